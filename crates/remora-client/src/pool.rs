use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use remora_common::protocol::{Endpoint, RemoraError, Response, Result, ServiceInfo, Status};
use remora_common::Converter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{Arg, ServiceProxy};
use crate::policy::{DropPolicy, PrioritizePolicy};
use crate::qos::{Qos, QosSnapshot};
use crate::RemoteService;

/// Connection pool configuration.
///
/// # Default Configuration
///
/// - `prioritize`: lowest latency first
/// - `drop`: never (only a failed probe evicts)
/// - `probe_interval`: 5 seconds
/// - `probe_timeout`: 2 seconds
/// - `queue_capacity`: 50 candidates waiting for adoption
/// - `enqueue_timeout`: 1 second
///
/// # Example
///
/// ```rust
/// use remora_client::{DropPolicy, PoolConfig, PrioritizePolicy};
/// use std::time::Duration;
///
/// let config = PoolConfig::default()
///     .with_prioritize(PrioritizePolicy::LeastLoadFirst)
///     .with_drop(DropPolicy::Lag { threshold: Duration::from_millis(250) });
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub prioritize: PrioritizePolicy,
    pub drop: DropPolicy,
    /// Time between QoS probes of one connection
    pub probe_interval: Duration,
    /// Bound on a single probe
    pub probe_timeout: Duration,
    /// Capacity of the adoption queue
    pub queue_capacity: usize,
    /// How long [`PooledServiceProxy::pool`] waits for queue space
    pub enqueue_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            prioritize: PrioritizePolicy::default(),
            drop: DropPolicy::default(),
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            queue_capacity: 50,
            enqueue_timeout: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    pub fn with_prioritize(mut self, prioritize: PrioritizePolicy) -> Self {
        self.prioritize = prioritize;
        self
    }

    pub fn with_drop(mut self, drop: DropPolicy) -> Self {
        self.drop = drop;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.drop.validate()?;
        if self.queue_capacity == 0 {
            return Err(RemoraError::InvalidConfig(
                "queue_capacity must be positive".to_string(),
            ));
        }
        if self.probe_interval.is_zero() || self.probe_timeout.is_zero() {
            return Err(RemoraError::InvalidConfig(
                "probe interval and timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A pooled connection with its telemetry.
#[derive(Debug)]
pub(crate) struct PoolEntry {
    id: u64,
    proxy: ServiceProxy,
    qos: Qos,
}

#[derive(Default)]
struct ActiveSet {
    entries: Vec<Arc<PoolEntry>>,
    cursor: usize,
}

struct PoolShared {
    config: PoolConfig,
    active: Mutex<ActiveSet>,
    probes: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PoolShared {
    /// Picks a connection and counts the call in flight on it, under the
    /// active-set lock.
    fn select(&self) -> Option<(Arc<PoolEntry>, CallGuard)> {
        let mut active = lock(&self.active);
        let snapshots: Vec<QosSnapshot> = active.entries.iter().map(|e| e.qos.snapshot()).collect();
        let ActiveSet { entries, cursor } = &mut *active;
        let index = self.config.prioritize.select(&snapshots, cursor)?;
        let entry = entries[index].clone();
        let guard = CallGuard::begin(entry.clone());
        Some((entry, guard))
    }

    fn adopt(&self, proxy: ServiceProxy) -> Arc<PoolEntry> {
        let entry = Arc::new(PoolEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            proxy,
            qos: Qos::new(),
        });
        lock(&self.active).entries.push(entry.clone());
        tracing::info!("adopted connection {} to {}", entry.id, entry.proxy.address());
        entry
    }

    /// Removes `entry` from the selectable set. The connection closes once
    /// its in-flight calls finish.
    fn evict(&self, entry: &Arc<PoolEntry>, reason: &str) -> bool {
        let removed = {
            let mut active = lock(&self.active);
            let before = active.entries.len();
            active.entries.retain(|e| e.id != entry.id);
            before != active.entries.len()
        };
        if !removed {
            return false;
        }

        tracing::warn!("evicting connection {} to {}: {}", entry.id, entry.proxy.address(), reason);
        let entry = entry.clone();
        tokio::spawn(async move {
            while entry.qos.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            entry.proxy.close(true).await;
        });
        true
    }

    /// Applies one probe outcome. Returns whether the entry was evicted.
    fn record_probe(&self, entry: &Arc<PoolEntry>, outcome: Result<Duration>) -> bool {
        match outcome {
            Ok(rtt) => {
                entry.qos.record_latency(rtt);
                let snapshot = entry.qos.snapshot();
                if matches!(self.config.drop, DropPolicy::Lag { .. }) && self.config.drop.should_drop(&snapshot) {
                    return self.evict(entry, &format!("latency {:?} over threshold", rtt));
                }
                false
            }
            Err(e) => self.evict(entry, &format!("probe failed: {}", e)),
        }
    }

    /// Applies one call outcome. Returns whether the entry was evicted.
    fn record_call(&self, entry: &Arc<PoolEntry>, outcome: &Result<Response>) -> bool {
        let transport_failure = match outcome {
            Ok(response) => matches!(
                response.status(),
                Some(Status::Timeout) | Some(Status::ChannelClosed)
            ),
            Err(_) => true,
        };
        if !transport_failure {
            entry.qos.record_success();
            return false;
        }

        let failures = entry.qos.record_failure();
        if matches!(self.config.drop, DropPolicy::RequestFail { .. })
            && self.config.drop.should_drop(&entry.qos.snapshot())
        {
            return self.evict(entry, &format!("{} consecutive failed calls", failures));
        }
        false
    }
}

/// Counts a call against its connection until dropped.
struct CallGuard {
    entry: Arc<PoolEntry>,
}

impl CallGuard {
    fn begin(entry: Arc<PoolEntry>) -> Self {
        entry.qos.enter();
        Self { entry }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.entry.qos.leave();
    }
}

async fn adoption_loop(mut queue: mpsc::Receiver<ServiceProxy>, shared: Weak<PoolShared>) {
    while let Some(proxy) = queue.recv().await {
        let Some(pool) = shared.upgrade() else {
            proxy.close(true).await;
            break;
        };
        if pool.closed.load(Ordering::SeqCst) {
            proxy.close(true).await;
            continue;
        }

        let entry = pool.adopt(proxy);
        let probe = tokio::spawn(probe_loop(entry, Arc::downgrade(&pool)));
        let mut probes = lock(&pool.probes);
        probes.retain(|handle| !handle.is_finished());
        probes.push(probe);
    }
}

async fn probe_loop(entry: Arc<PoolEntry>, shared: Weak<PoolShared>) {
    let (interval, timeout) = match shared.upgrade() {
        Some(pool) => (pool.config.probe_interval, pool.config.probe_timeout),
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;
        let outcome = entry.proxy.ping(timeout).await;
        let Some(pool) = shared.upgrade() else {
            break;
        };
        if let Ok(rtt) = &outcome {
            tracing::debug!("probe of connection {}: {:?}", entry.id, rtt);
        }
        if pool.record_probe(&entry, outcome) {
            break;
        }
        if !lock(&pool.active).entries.iter().any(|e| e.id == entry.id) {
            break;
        }
    }
}

/// One logical service backed by several live connections.
///
/// Candidates are handed in with [`pool`](Self::pool), adopted in the
/// background and probed periodically. Each call goes to the connection the
/// [`PrioritizePolicy`] ranks first; the [`DropPolicy`] decides when a
/// connection is taken out of rotation.
///
/// # Example
///
/// ```rust,no_run
/// use remora_client::{PoolConfig, PooledServiceProxy, ServiceProxy};
/// use remora_common::ServiceInfo;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let service = ServiceInfo::new("echo", "1.0");
/// let pool = PooledServiceProxy::new(service.clone(), PoolConfig::default())?;
///
/// for addr in ["10.0.0.1:7000", "10.0.0.2:7000"] {
///     pool.pool(ServiceProxy::new(addr, service.clone())?).await;
/// }
/// # Ok(())
/// # }
/// ```
pub struct PooledServiceProxy {
    service: ServiceInfo,
    converter: Converter,
    shared: Arc<PoolShared>,
    queue: mpsc::Sender<ServiceProxy>,
    adoption: JoinHandle<()>,
}

impl PooledServiceProxy {
    /// Creates the pool and starts its adoption loop. Must be called inside a
    /// tokio runtime.
    pub fn new(service: ServiceInfo, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let converter = Converter::from_name(&service.converter)?;
        let (queue, rx) = mpsc::channel(config.queue_capacity);

        let shared = Arc::new(PoolShared {
            config,
            active: Mutex::new(ActiveSet::default()),
            probes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        });
        let adoption = tokio::spawn(adoption_loop(rx, Arc::downgrade(&shared)));

        Ok(Self {
            service,
            converter,
            shared,
            queue,
            adoption,
        })
    }

    pub fn service(&self) -> &ServiceInfo {
        &self.service
    }

    /// Offers a candidate connection.
    ///
    /// The candidate must serve every controller of the pooled service. It is
    /// opened here and queued for adoption; any failure drops it and returns
    /// `false`.
    pub async fn pool(&self, candidate: ServiceProxy) -> bool {
        if self.shared.closed.load(Ordering::SeqCst) {
            return false;
        }

        if let Some(missing) = self
            .service
            .controllers
            .iter()
            .find(|controller| !candidate.provides(controller))
        {
            tracing::warn!(
                "candidate {} does not provide {} {}, dropped",
                candidate.address(),
                missing.stub,
                missing.version
            );
            return false;
        }

        if let Err(e) = candidate.open().await {
            tracing::warn!("candidate {} failed to open, dropped: {}", candidate.address(), e);
            return false;
        }

        match self
            .queue
            .send_timeout(candidate, self.shared.config.enqueue_timeout)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                let candidate = e.into_inner();
                tracing::warn!("adoption queue full, dropped candidate {}", candidate.address());
                candidate.close(true).await;
                false
            }
        }
    }

    /// Number of connections currently selectable.
    pub fn active_count(&self) -> usize {
        lock(&self.shared.active).entries.len()
    }

    /// Address and telemetry of every selectable connection, in pool order.
    pub fn connections(&self) -> Vec<(String, QosSnapshot)> {
        lock(&self.shared.active)
            .entries
            .iter()
            .map(|e| (e.proxy.address().to_string(), e.qos.snapshot()))
            .collect()
    }

    /// Calls `endpoint` on the best-ranked connection.
    pub async fn request(&self, endpoint: &Endpoint, timeout: Duration, args: Vec<Arg>) -> Result<Response> {
        let (entry, guard) = self.shared.select().ok_or(RemoraError::NoAvailableConnection)?;
        let outcome = entry.proxy.request(endpoint, timeout, args).await;
        drop(guard);
        self.shared.record_call(&entry, &outcome);
        outcome
    }

    /// Stops adoption and probing and closes every pooled connection.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.adoption.abort();
        for probe in lock(&self.shared.probes).drain(..) {
            probe.abort();
        }

        let entries = std::mem::take(&mut lock(&self.shared.active).entries);
        for entry in entries {
            entry.proxy.close(true).await;
        }
        tracing::info!("pool for service '{}' closed", self.service.name);
    }
}

impl Drop for PooledServiceProxy {
    fn drop(&mut self) {
        self.adoption.abort();
        for probe in lock(&self.shared.probes).drain(..) {
            probe.abort();
        }
    }
}

#[async_trait]
impl RemoteService for PooledServiceProxy {
    async fn request(&self, endpoint: &Endpoint, timeout: Duration, args: Vec<Arg>) -> Result<Response> {
        PooledServiceProxy::request(self, endpoint, timeout, args).await
    }

    fn converter(&self) -> Converter {
        self.converter
    }
}
