//! Selection and eviction policies of the connection pool.

use std::time::Duration;

use remora_common::protocol::{RemoraError, Result};

use crate::qos::QosSnapshot;

/// How the pool ranks its live connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrioritizePolicy {
    /// Smallest last-measured round trip first
    #[default]
    LowestLatencyFirst,
    /// Fewest in-flight calls first
    LeastLoadFirst,
    /// Rotate through the connections in order
    RoundRobin,
}

impl PrioritizePolicy {
    /// Picks the index of the connection to use next.
    ///
    /// Ties go to the earliest candidate. `cursor` is the rotation state of
    /// `RoundRobin` and is left alone by the other policies.
    pub fn select(self, candidates: &[QosSnapshot], cursor: &mut usize) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            PrioritizePolicy::LowestLatencyFirst => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, qos)| qos.latency_key())
                .map(|(i, _)| i),
            PrioritizePolicy::LeastLoadFirst => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, qos)| qos.in_flight)
                .map(|(i, _)| i),
            PrioritizePolicy::RoundRobin => {
                let index = *cursor % candidates.len();
                *cursor = cursor.wrapping_add(1);
                Some(index)
            }
        }
    }
}

/// When the pool gives up on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    /// Only a failed probe evicts
    #[default]
    Never,
    /// Evict once the measured latency exceeds `threshold`
    Lag { threshold: Duration },
    /// Evict after `max_failures` consecutive transport failures
    RequestFail { max_failures: u32 },
}

impl DropPolicy {
    pub fn validate(&self) -> Result<()> {
        match self {
            DropPolicy::Lag { threshold } if threshold.is_zero() => Err(RemoraError::InvalidConfig(
                "LAG drop policy needs a positive threshold".to_string(),
            )),
            DropPolicy::RequestFail { max_failures: 0 } => Err(RemoraError::InvalidConfig(
                "REQUEST_FAIL drop policy needs a positive failure count".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn should_drop(&self, qos: &QosSnapshot) -> bool {
        match self {
            DropPolicy::Never => false,
            DropPolicy::Lag { threshold } => qos.latency.is_some_and(|latency| latency > *threshold),
            DropPolicy::RequestFail { max_failures } => qos.consecutive_failures >= *max_failures,
        }
    }
}
