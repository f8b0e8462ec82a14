//! Top-level owner of the background components
//!
//! The supervisor builds the watcher queue and hands it to both the
//! provisioning worker (which seeds it) and the watcher (which drains it).
//! Each component gets its own clone of the store so no backend connection
//! is shared between them.

use std::sync::Arc;

use tracing::info;

use crate::config::{Config, ConfigError};
use crate::containermgr::RegistrationPolicy;
use crate::investigator::{Investigator, ProvisionWorker};
use crate::service::HostService;
use crate::store::StoreManager;
use crate::transport::{SshTransport, Transport};
use crate::watcher::{Watcher, WatcherConfig, WatcherHandle, WatcherQueue};

pub struct Supervisor {
    store: StoreManager,
    transport: Arc<dyn Transport>,
    watcher_queue: WatcherQueue,
    investigator: Arc<Investigator>,
    watcher: Arc<WatcherHandle>,
}

impl Supervisor {
    /// Start everything described by `config` with the SSH transport
    pub fn start(config: &Config) -> Result<Self, ConfigError> {
        let store = config.build_store()?;
        let transport: Arc<dyn Transport> = Arc::new(SshTransport::new(config.transport.clone()));
        Ok(Self::start_with(
            store,
            transport,
            config.investigator.registration_policy(),
            config.watcher.watcher_config(),
        ))
    }

    /// Start the investigator and watcher around existing collaborators
    pub fn start_with(
        store: StoreManager,
        transport: Arc<dyn Transport>,
        registration: RegistrationPolicy,
        watcher_config: WatcherConfig,
    ) -> Self {
        let watcher_queue = WatcherQueue::new();

        let worker = ProvisionWorker::new(transport.clone(), watcher_queue.clone())
            .with_registration_policy(registration);
        let investigator = Arc::new(Investigator::spawn(worker));
        info!(
            "Investigator started (registration: {} attempts, {:?} apart)",
            registration.attempts, registration.delay
        );

        let watcher = Watcher::new(
            watcher_queue.clone(),
            store.clone(),
            transport.clone(),
            watcher_config,
        );
        let watcher = Arc::new(WatcherHandle::spawn(watcher));

        Self {
            store,
            transport,
            watcher_queue,
            investigator,
            watcher,
        }
    }

    /// Service handle for the API layer
    pub fn host_service(&self) -> HostService {
        HostService::new(
            self.store.clone(),
            self.investigator.clone(),
            self.watcher_queue.clone(),
            self.transport.clone(),
        )
        .with_watcher(self.watcher.clone())
    }

    pub fn watcher_queue(&self) -> &WatcherQueue {
        &self.watcher_queue
    }

    /// Stop the watcher, then the investigator
    pub async fn shutdown(&self) {
        info!("Shutting down background components");
        self.watcher.stop().await;
        self.investigator.stop().await;
    }
}
