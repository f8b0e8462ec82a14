//! Watcher - periodic availability re-checks
//!
//! The watcher pops hosts off the [`WatcherQueue`], re-checks the ones whose
//! last check is older than `delta`, flips their status and puts them back
//! with a fresh timestamp. Hosts that are not due yet go back unchanged.

pub mod queue;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clusters::cluster_for_host;
use crate::model::{ClusterType, Host, HostStatus};
use crate::store::{StoreError, StoreManager};
use crate::transport::{RemoteTarget, TemporarySshKey, Transport};

pub use queue::{QueueEntry, WatcherQueue};

/// Minimum age of a check before a host is checked again
pub const DEFAULT_DELTA_SECS: u64 = 20;

/// Idle sleep when there is nothing to do
pub const DEFAULT_THROTTLE_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub delta: Duration,
    pub throttle: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            delta: Duration::from_secs(DEFAULT_DELTA_SECS),
            throttle: Duration::from_secs(DEFAULT_THROTTLE_SECS),
        }
    }
}

impl WatcherConfig {
    pub fn with_delta(mut self, delta: Duration) -> Self {
        self.delta = delta;
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }
}

/// What one pass over the queue did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Queue was empty
    Empty,
    /// Host went back unchanged, due at `due_at`
    NotDue {
        address: String,
        due_at: DateTime<Utc>,
    },
    /// Host was checked and requeued with this status
    Checked { address: String, status: HostStatus },
    /// Host no longer exists in the store and was not requeued
    Dropped { address: String },
    /// Store could not be read; host went back unchecked
    Deferred { address: String },
}

pub struct Watcher {
    queue: WatcherQueue,
    store: StoreManager,
    transport: Arc<dyn Transport>,
    config: WatcherConfig,
}

impl Watcher {
    pub fn new(
        queue: WatcherQueue,
        store: StoreManager,
        transport: Arc<dyn Transport>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            queue,
            store,
            transport,
            config,
        }
    }

    fn delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.delta)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_DELTA_SECS as i64))
    }

    /// Seed an empty queue with every stored host, using each host's
    /// persisted `last_check`. Hosts without a parseable check time are
    /// skipped. Returns the number of hosts added.
    pub async fn populate(&self) -> usize {
        if !self.queue.is_empty() {
            return 0;
        }
        info!("Watcher queue is empty, populating from the store");
        let hosts = match self.store.list::<Host>().await {
            Ok(hosts) => hosts,
            Err(e) => {
                info!("No hosts loaded from the store: {}", e);
                return 0;
            }
        };

        let mut added = 0;
        for host in hosts {
            let Some(last_check) = host.last_checked() else {
                debug!(
                    "Skipping {}: unparseable last_check '{}'",
                    host.address, host.last_check
                );
                continue;
            };
            let address = host.address.clone();
            if self.queue.put(host, last_check) {
                debug!("Queued {} for re-checks", address);
                added += 1;
            }
        }
        added
    }

    /// Handle the entry at the front of the queue.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickOutcome {
        let Some(QueueEntry { host, last_check }) = self.queue.pop() else {
            return TickOutcome::Empty;
        };

        let due_at = last_check + self.delta();
        if now < due_at {
            debug!("{} not ready to check (last check {})", host.address, last_check);
            let address = host.address.clone();
            self.queue.put(host, last_check);
            return TickOutcome::NotDue { address, due_at };
        }

        let refreshed = self.store.get::<Host>(&host.address).await;
        let mut host = match refreshed {
            Ok(stored) => stored,
            Err(StoreError::NotFound { .. }) => {
                info!("{} is gone from the store, no longer watching", host.address);
                return TickOutcome::Dropped {
                    address: host.address,
                };
            }
            Err(e) => {
                warn!(
                    "Could not refresh {} from the store, deferring its check: {}",
                    host.address, e
                );
                let address = host.address.clone();
                self.queue.put(host, last_check);
                return TickOutcome::Deferred { address };
            }
        };

        info!("Checking {} for availability", host.address);
        host.status = self.checked_status(&host).await;
        host.stamp(now);

        if let Err(e) = self.store.save(&host).await {
            warn!("Unable to save status of {}: {}", host.address, e);
        }

        let address = host.address.clone();
        let status = host.status;
        self.queue.put(host, now);
        debug!("{} requeued for the next check", address);
        TickOutcome::Checked { address, status }
    }

    /// Status after an availability check of `host`
    async fn checked_status(&self, host: &Host) -> HostStatus {
        let available = match TemporarySshKey::write(&host.address, &host.ssh_priv_key) {
            Ok(key) => {
                let target = RemoteTarget::for_host(host, key.path());
                match self.transport.check_host_availability(target).await {
                    Ok(result) => result.is_success(),
                    Err(e) => {
                        debug!("Availability check of {} failed: {}", host.address, e);
                        false
                    }
                }
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        };

        if !available {
            return HostStatus::Failed;
        }
        if host.status != HostStatus::Failed {
            return host.status;
        }

        let cluster_type = match cluster_for_host(&self.store, &host.address).await {
            Ok(Some(cluster)) => cluster.cluster_type,
            Ok(None) => ClusterType::HostOnly,
            Err(e) => {
                debug!(
                    "{} has no cluster type ({}), assuming {}",
                    host.address,
                    e,
                    ClusterType::HostOnly
                );
                ClusterType::HostOnly
            }
        };
        if cluster_type.requires_container_manager() {
            HostStatus::Active
        } else {
            HostStatus::Disassociated
        }
    }

    /// Populate if needed and handle a single entry
    pub async fn run_once(&self) -> TickOutcome {
        self.populate().await;
        self.tick(Utc::now()).await
    }

    /// How long to idle after `outcome`
    fn pause_after(&self, outcome: &TickOutcome, now: DateTime<Utc>) -> Duration {
        match outcome {
            TickOutcome::Empty | TickOutcome::Deferred { .. } => self.config.throttle,
            TickOutcome::NotDue { .. } => {
                let soonest = self
                    .queue
                    .earliest_check()
                    .map(|at| at + self.delta())
                    .and_then(|due| (due - now).to_std().ok())
                    .unwrap_or(Duration::ZERO);
                soonest.min(self.config.throttle)
            }
            TickOutcome::Checked { .. } | TickOutcome::Dropped { .. } => Duration::ZERO,
        }
    }

    /// Run until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Watcher started: delta={}s, throttle={}s",
            self.config.delta.as_secs(),
            self.config.throttle.as_secs()
        );
        self.populate().await;

        loop {
            let now = Utc::now();
            let outcome = self.tick(now).await;
            let pause = self.pause_after(&outcome, now);
            if !pause.is_zero() {
                debug!("Watcher sleeping for {:?}", pause);
            }

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Watcher stopping");
    }
}

/// Spawn the watcher loop as a background task.
///
/// Returns the shutdown sender and the task handle.
pub fn spawn_watcher(watcher: Watcher) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        watcher.run(shutdown_rx).await;
    });
    (shutdown_tx, handle)
}

/// A running watcher task
pub struct WatcherHandle {
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatcherHandle {
    pub fn spawn(watcher: Watcher) -> Self {
        let (shutdown, task) = spawn_watcher(watcher);
        Self {
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Signal shutdown and wait for the loop to exit
    pub async fn stop(&self) {
        if self.shutdown.send(true).is_err() {
            debug!("Watcher already stopped");
        }
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Watcher task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusters::add_host_to_cluster;
    use crate::model::{format_timestamp, Cluster};
    use crate::testing::{FakeOutcome, FakeTransport};

    fn watcher_with(transport: FakeTransport) -> (Watcher, StoreManager, WatcherQueue) {
        let store = StoreManager::in_memory();
        let queue = WatcherQueue::new();
        let watcher = Watcher::new(
            queue.clone(),
            store.clone(),
            Arc::new(transport),
            WatcherConfig::default(),
        );
        (watcher, store, queue)
    }

    async fn stored_host(store: &StoreManager, address: &str, status: HostStatus) -> Host {
        let mut host = Host::new(address).with_status(status);
        host.stamp(Utc::now() - chrono::Duration::minutes(5));
        store.save(&host).await.unwrap()
    }

    #[tokio::test]
    async fn test_unreadable_store_defers_check() {
        let transport = Arc::new(FakeTransport::new());
        let queue = WatcherQueue::new();
        // no handler for hosts: every read fails with something other than not-found
        let watcher = Watcher::new(
            queue.clone(),
            StoreManager::new(),
            transport.clone(),
            WatcherConfig::default(),
        );
        let mut host = Host::new("10.2.0.2").with_status(HostStatus::Active);
        let last_check = Utc::now() - chrono::Duration::minutes(5);
        host.stamp(last_check);
        queue.put(host, last_check);

        let outcome = watcher.tick(Utc::now()).await;
        assert_eq!(
            outcome,
            TickOutcome::Deferred {
                address: "10.2.0.2".to_string()
            }
        );
        assert_eq!(transport.count("check_host_availability"), 0);
        assert_eq!(queue.qsize(), 1);
        assert_eq!(queue.earliest_check(), Some(last_check));
        assert_eq!(watcher.pause_after(&outcome, Utc::now()), watcher.config.throttle);
    }

    #[tokio::test]
    async fn test_failed_host_in_kubernetes_cluster_becomes_active() {
        let (watcher, store, queue) = watcher_with(FakeTransport::new());
        store
            .save(&Cluster::new("honeynut", ClusterType::Kubernetes))
            .await
            .unwrap();
        add_host_to_cluster(&store, "honeynut", "10.2.0.2").await.unwrap();
        let host = stored_host(&store, "10.2.0.2", HostStatus::Failed).await;
        queue.put(host.clone(), host.last_checked().unwrap());

        let outcome = watcher.tick(Utc::now()).await;
        assert_eq!(
            outcome,
            TickOutcome::Checked {
                address: "10.2.0.2".to_string(),
                status: HostStatus::Active
            }
        );
        let saved: Host = store.get("10.2.0.2").await.unwrap();
        assert_eq!(saved.status, HostStatus::Active);
        assert_eq!(queue.qsize(), 1);
    }

    #[tokio::test]
    async fn test_failed_host_without_cluster_becomes_disassociated() {
        let (watcher, store, queue) = watcher_with(FakeTransport::new());
        let host = stored_host(&store, "10.2.0.2", HostStatus::Failed).await;
        queue.put(host.clone(), host.last_checked().unwrap());

        watcher.tick(Utc::now()).await;
        let saved: Host = store.get("10.2.0.2").await.unwrap();
        assert_eq!(saved.status, HostStatus::Disassociated);
    }

    #[tokio::test]
    async fn test_active_host_stays_active() {
        let (watcher, store, queue) = watcher_with(FakeTransport::new());
        let host = stored_host(&store, "10.2.0.2", HostStatus::Active).await;
        queue.put(host.clone(), host.last_checked().unwrap());

        watcher.tick(Utc::now()).await;
        let saved: Host = store.get("10.2.0.2").await.unwrap();
        assert_eq!(saved.status, HostStatus::Active);
    }

    #[tokio::test]
    async fn test_unreachable_host_fails() {
        let transport = FakeTransport::new()
            .with_availability("a", FakeOutcome::Exit(255))
            .with_availability("b", FakeOutcome::Error);
        let (watcher, store, queue) = watcher_with(transport);
        for address in ["a", "b"] {
            let host = stored_host(&store, address, HostStatus::Active).await;
            queue.put(host.clone(), host.last_checked().unwrap());
        }

        let now = Utc::now();
        watcher.tick(now).await;
        watcher.tick(now).await;
        for address in ["a", "b"] {
            let saved: Host = store.get(address).await.unwrap();
            assert_eq!(saved.status, HostStatus::Failed);
            assert_eq!(saved.last_check, format_timestamp(now));
        }
    }

    #[tokio::test]
    async fn test_not_due_requeued_unchanged() {
        let transport = FakeTransport::new();
        let (watcher, store, queue) = watcher_with(transport);
        let now = Utc::now();
        let host = Host::new("10.2.0.2");
        store.save(&host).await.unwrap();
        queue.put(host, now - chrono::Duration::seconds(5));

        let outcome = watcher.tick(now).await;
        match outcome {
            TickOutcome::NotDue { address, due_at } => {
                assert_eq!(address, "10.2.0.2");
                assert_eq!(due_at, now + chrono::Duration::seconds(15));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let entry = queue.pop().unwrap();
        assert_eq!(entry.last_check, now - chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_deleted_host_is_dropped() {
        let (watcher, _store, queue) = watcher_with(FakeTransport::new());
        queue.put(Host::new("gone"), Utc::now() - chrono::Duration::minutes(5));

        let outcome = watcher.tick(Utc::now()).await;
        assert_eq!(
            outcome,
            TickOutcome::Dropped {
                address: "gone".to_string()
            }
        );
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_populate_skips_unparseable_last_check() {
        let (watcher, store, queue) = watcher_with(FakeTransport::new());
        stored_host(&store, "a", HostStatus::Active).await;
        store.save(&Host::new("never-checked")).await.unwrap();

        assert_eq!(watcher.populate().await, 1);
        assert_eq!(queue.addresses(), vec!["a"]);
        assert_eq!(watcher.populate().await, 0);
    }

    #[tokio::test]
    async fn test_pause_after_not_due_is_bounded() {
        let (watcher, _store, queue) = watcher_with(FakeTransport::new());
        let now = Utc::now();
        queue.put(Host::new("a"), now - chrono::Duration::seconds(15));
        let outcome = TickOutcome::NotDue {
            address: "a".to_string(),
            due_at: now + chrono::Duration::seconds(5),
        };
        assert_eq!(watcher.pause_after(&outcome, now), Duration::from_secs(5));
        assert_eq!(
            watcher.pause_after(&TickOutcome::Empty, now),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (watcher, _store, _queue) = watcher_with(FakeTransport::new());
        let (shutdown, handle) = spawn_watcher(watcher);
        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_handle_liveness() {
        let (watcher, _store, _queue) = watcher_with(FakeTransport::new());
        let handle = WatcherHandle::spawn(watcher);
        assert!(handle.is_alive());
        handle.stop().await;
        assert!(!handle.is_alive());
        // stopping twice is harmless
        handle.stop().await;
    }
}
