//! Provisioning worker
//!
//! Drives one host at a time through
//! `investigating -> bootstrapping -> {active | inactive | disassociated | failed}`.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use super::messages::{ProvisionRequest, ProvisionResponse, WorkerMessage};
use super::ProvisionError;
use crate::containermgr::{wait_for_registration, RegistrationPolicy};
use crate::model::{Cluster, Host, HostStatus};
use crate::store::StoreManager;
use crate::transport::{get_oscmd, RemoteTarget, TemporarySshKey, Transport};
use crate::watcher::queue::WatcherQueue;

pub struct ProvisionWorker {
    transport: Arc<dyn Transport>,
    watcher_queue: WatcherQueue,
    registration: RegistrationPolicy,
}

impl ProvisionWorker {
    pub fn new(transport: Arc<dyn Transport>, watcher_queue: WatcherQueue) -> Self {
        Self {
            transport,
            watcher_queue,
            registration: RegistrationPolicy::default(),
        }
    }

    pub fn with_registration_policy(mut self, policy: RegistrationPolicy) -> Self {
        self.registration = policy;
        self
    }

    /// Serve requests in arrival order until the request channel closes.
    pub async fn run(
        self,
        mut requests: UnboundedReceiver<ProvisionRequest>,
        responses: UnboundedSender<WorkerMessage>,
    ) {
        info!("Provisioning worker started");
        while let Some(request) = requests.recv().await {
            let response = self.investigate(request).await;
            if responses.send(WorkerMessage::Response(response)).is_err() {
                warn!("Response channel closed, stopping provisioning worker");
                break;
            }
        }
        info!("Provisioning worker stopped");
    }

    /// Provision one host and report where it ended up
    pub async fn investigate(&self, request: ProvisionRequest) -> ProvisionResponse {
        let ProvisionRequest {
            id,
            store,
            mut host,
            cluster,
        } = request;

        info!("Investigating {} (request {})", host.address, id);
        host.status = HostStatus::Investigating;
        let error = self
            .provision(&store, &mut host, cluster.as_ref())
            .await
            .err();

        match &error {
            Some(e) => warn!("{} ended in {}: {}", host.address, host.status, e),
            None => info!("{} ended in {}", host.address, host.status),
        }
        ProvisionResponse { id, host, error }
    }

    async fn provision(
        &self,
        store: &StoreManager,
        host: &mut Host,
        cluster: Option<&Cluster>,
    ) -> Result<(), ProvisionError> {
        // Removed on drop, on every return below
        let key = match TemporarySshKey::write(&host.address, &host.ssh_priv_key) {
            Ok(key) => key,
            Err(e) => {
                host.status = HostStatus::Failed;
                return Err(ProvisionError::FactGathering {
                    address: host.address.clone(),
                    reason: e.to_string(),
                });
            }
        };

        // Facts
        let gathered = self
            .transport
            .get_info(RemoteTarget::for_host(host, key.path()))
            .await
            .and_then(|result| result.into_success(&host.address));
        let facts = match gathered {
            Ok(result) => result.facts,
            Err(e) => {
                host.status = HostStatus::Failed;
                return Err(ProvisionError::FactGathering {
                    address: host.address.clone(),
                    reason: e.to_string(),
                });
            }
        };
        host.apply_facts(&facts);
        host.stamp(Utc::now());
        host.status = HostStatus::Bootstrapping;
        debug!(
            "{} facts: os={} cpus={} memory={} space={}",
            host.address, host.os, host.cpus, host.memory, host.space
        );

        // Bootstrap
        let oscmd = match get_oscmd(&host.os) {
            Ok(oscmd) => oscmd,
            Err(e) => {
                host.status = HostStatus::Disassociated;
                return Err(ProvisionError::Bootstrap {
                    address: host.address.clone(),
                    reason: e.to_string(),
                });
            }
        };
        let bootstrapped = self
            .transport
            .bootstrap(RemoteTarget::for_host(host, key.path()), cluster, store, &oscmd)
            .await
            .and_then(|result| result.into_success(&host.address));
        if let Err(e) = bootstrapped {
            host.status = HostStatus::Disassociated;
            return Err(ProvisionError::Bootstrap {
                address: host.address.clone(),
                reason: e.to_string(),
            });
        }

        // Registration
        host.status = self.registration_status(store, &host.address, cluster).await;

        if self.watcher_queue.put(host.clone(), Utc::now()) {
            debug!("Queued {} for re-checks", host.address);
        }
        Ok(())
    }

    /// `active` unless a container manager for the cluster's type never
    /// confirms the host
    async fn registration_status(
        &self,
        store: &StoreManager,
        address: &str,
        cluster: Option<&Cluster>,
    ) -> HostStatus {
        let cluster = match cluster {
            Some(c) if c.cluster_type.requires_container_manager() => c,
            _ => return HostStatus::Active,
        };

        let managers = store.list_container_managers(cluster.cluster_type);
        if managers.is_empty() {
            warn!(
                "No {} container manager configured for cluster {}",
                cluster.cluster_type, cluster.name
            );
            return HostStatus::Inactive;
        }

        for manager in managers {
            if !wait_for_registration(manager.as_ref(), address, self.registration).await {
                warn!(
                    "{} did not register with {} for cluster {}",
                    address,
                    manager.name(),
                    cluster.name
                );
                return HostStatus::Inactive;
            }
        }
        HostStatus::Active
    }
}
