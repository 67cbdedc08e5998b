//! Quality-of-service telemetry for pooled connections.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Latency recorded before the first successful probe.
pub const UNMEASURED: u64 = u64::MAX;

/// Live counters of one pooled connection.
#[derive(Debug)]
pub struct Qos {
    latency_us: AtomicU64,
    in_flight: AtomicUsize,
    consecutive_failures: AtomicU32,
}

/// Point-in-time copy of [`Qos`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosSnapshot {
    /// Last probe round trip, `None` until one succeeded
    pub latency: Option<Duration>,
    /// Calls currently delegated to the connection
    pub in_flight: usize,
    /// Transport failures since the last success
    pub consecutive_failures: u32,
}

impl QosSnapshot {
    /// Sort key for latency ranking; unmeasured connections rank last.
    pub fn latency_key(&self) -> u64 {
        self.latency
            .map(|d| d.as_micros().min(u128::from(UNMEASURED - 1)) as u64)
            .unwrap_or(UNMEASURED)
    }
}

impl Default for Qos {
    fn default() -> Self {
        Self::new()
    }
}

impl Qos {
    pub fn new() -> Self {
        Self {
            latency_us: AtomicU64::new(UNMEASURED),
            in_flight: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn snapshot(&self) -> QosSnapshot {
        let latency = match self.latency_us.load(Ordering::Relaxed) {
            UNMEASURED => None,
            us => Some(Duration::from_micros(us)),
        };
        QosSnapshot {
            latency,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
        }
    }

    pub fn record_latency(&self, rtt: Duration) {
        let us = rtt.as_micros().min(u128::from(UNMEASURED - 1)) as u64;
        self.latency_us.store(us, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Returns the new consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Counts a call as in flight until the matching [`leave`](Self::leave).
    pub(crate) fn enter(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}
