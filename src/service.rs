//! Host and cluster operations behind the HTTP API
//!
//! [`HostService`] owns the collaborators a request needs: the store, the
//! investigator, the watcher queue and the transport used by cluster
//! operations. The API layer only translates HTTP to these calls and
//! [`ServiceError`] kinds to status codes.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clusterexec::{self, ClusterExecError, ClusterExecutor};
use crate::clusters::{
    add_host_to_cluster, cluster_for_host, cluster_has_host, remove_host_from_all_clusters,
    remove_host_from_cluster,
};
use crate::containermgr::ContainerManagerError;
use crate::investigator::{CompletionCallback, Investigator, InvestigatorError};
use crate::model::{
    Cluster, ClusterCommand, ClusterOperation, ClusterType, Host, HostCounts, HostStatus, Network,
    NetworkType, Record, ValidationError, DEFAULT_NETWORK, DEFAULT_REMOTE_USER,
};
use crate::store::{StoreError, StoreManager};
use crate::transport::Transport;
use crate::watcher::{WatcherHandle, WatcherQueue};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Investigator(#[from] InvestigatorError),

    #[error(transparent)]
    ContainerManager(#[from] ContainerManagerError),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => ServiceError::NotFound(e.to_string()),
            StoreError::Validation(v) => ServiceError::Validation(v),
            other => ServiceError::Store(other),
        }
    }
}

impl From<ClusterExecError> for ServiceError {
    fn from(e: ClusterExecError) -> Self {
        match e {
            ClusterExecError::Store(e) => e.into(),
            ClusterExecError::MissingVersion => ServiceError::BadRequest(e.to_string()),
            ClusterExecError::Host { .. } => ServiceError::BadRequest(e.to_string()),
        }
    }
}

fn default_remote_user() -> String {
    DEFAULT_REMOTE_USER.to_string()
}

/// Body of a host creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRequest {
    pub ssh_priv_key: String,

    #[serde(default = "default_remote_user")]
    pub remote_user: String,

    /// Cluster to join once provisioned
    #[serde(default)]
    pub cluster: Option<String>,
}

/// Result of a host creation request
#[derive(Debug, Clone, PartialEq)]
pub enum HostCreation {
    /// A matching host already existed; nothing was submitted
    Existing(Host),
    /// A new host was submitted for provisioning
    Submitted(Host),
}

impl HostCreation {
    pub fn host(&self) -> &Host {
        match self {
            HostCreation::Existing(host) | HostCreation::Submitted(host) => host,
        }
    }
}

/// Cluster rendering with member availability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterView {
    pub name: String,
    pub status: String,
    #[serde(rename = "type")]
    pub cluster_type: ClusterType,
    pub network: String,
    pub hosts: HostCounts,
}

/// Body of a network creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRequest {
    #[serde(rename = "type")]
    pub network_type: NetworkType,

    #[serde(default)]
    pub options: serde_json::Map<String, Value>,
}

/// Body of a cluster host-list replacement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostListUpdate {
    /// Host list the caller last saw
    pub old: Vec<String>,
    pub new: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub info: Value,
}

impl ComponentStatus {
    fn new(ok: bool, info: Value) -> Self {
        Self {
            status: if ok { "OK" } else { "FAILED" }.to_string(),
            info,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "OK"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub store: ComponentStatus,
    pub investigator: ComponentStatus,
    pub watcher: ComponentStatus,
}

pub struct HostService {
    store: StoreManager,
    investigator: Arc<Investigator>,
    watcher_queue: WatcherQueue,
    watcher: Option<Arc<WatcherHandle>>,
    transport: Arc<dyn Transport>,
}

impl HostService {
    pub fn new(
        store: StoreManager,
        investigator: Arc<Investigator>,
        watcher_queue: WatcherQueue,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            store,
            investigator,
            watcher_queue,
            watcher: None,
            transport,
        }
    }

    pub fn with_watcher(mut self, watcher: Arc<WatcherHandle>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn store(&self) -> &StoreManager {
        &self.store
    }

    // ========================================================================
    // Hosts
    // ========================================================================

    /// Create a host and submit it for provisioning.
    ///
    /// Idempotent while the request agrees with the stored host: same key
    /// and, when a cluster is named, membership of that cluster. A
    /// disagreeing request or an unknown cluster is a conflict.
    pub async fn create_host(
        &self,
        address: &str,
        request: HostRequest,
    ) -> Result<HostCreation, ServiceError> {
        match self.store.get::<Host>(address).await {
            Ok(existing) => return self.check_existing(existing, &request).await,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let cluster = match &request.cluster {
            Some(name) => Some(self.cluster_to_join(name, address).await?),
            None => None,
        };

        let host = Host::new(address)
            .with_ssh_key(request.ssh_priv_key)
            .with_remote_user(request.remote_user);
        Host::schema().validate(&serde_json::to_value(&host).map_err(StoreError::from)?)?;

        let callback = persist_callback(self.store.clone(), request.cluster);
        self.investigator
            .submit(&self.store, host.clone(), cluster, Some(callback))?;
        info!("Accepted new host {}", address);
        Ok(HostCreation::Submitted(host))
    }

    async fn check_existing(
        &self,
        existing: Host,
        request: &HostRequest,
    ) -> Result<HostCreation, ServiceError> {
        if existing.ssh_priv_key != request.ssh_priv_key {
            return Err(ServiceError::Conflict(format!(
                "host {} exists with a different key",
                existing.address
            )));
        }
        if let Some(name) = &request.cluster {
            let member = match cluster_has_host(&self.store, name, &existing.address).await {
                Ok(member) => member,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e.into()),
            };
            if !member {
                return Err(ServiceError::Conflict(format!(
                    "host {} is not a member of cluster {}",
                    existing.address, name
                )));
            }
        }
        debug!("{} already exists, nothing to do", existing.address);
        Ok(HostCreation::Existing(existing))
    }

    /// The cluster a new host may join: it must exist and the host must not
    /// belong to a different one.
    async fn cluster_to_join(&self, name: &str, address: &str) -> Result<Cluster, ServiceError> {
        let cluster = match self.store.get::<Cluster>(name).await {
            Ok(cluster) => cluster,
            Err(e) if e.is_not_found() => {
                return Err(ServiceError::Conflict(format!(
                    "cluster {} does not exist",
                    name
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(other) = cluster_for_host(&self.store, address).await? {
            if other.name != cluster.name {
                return Err(ServiceError::Conflict(format!(
                    "{} already belongs to cluster {}",
                    address, other.name
                )));
            }
        }
        Ok(cluster)
    }

    /// The stored host, or an `investigating` placeholder while the host is
    /// still being provisioned
    pub async fn get_host(&self, address: &str) -> Result<Host, ServiceError> {
        if self.investigator.is_pending(address) {
            return Ok(Host::new(address));
        }
        Ok(self.store.get::<Host>(address).await?)
    }

    pub async fn list_hosts(&self) -> Result<Vec<Host>, ServiceError> {
        Ok(self.store.list::<Host>().await?)
    }

    /// Delete a host and stop tracking it anywhere.
    ///
    /// The watcher entry, any pending provisioning callback and cluster
    /// memberships are removed even when the record itself is already gone.
    pub async fn delete_host(&self, address: &str) -> Result<(), ServiceError> {
        let deleted = self.store.delete::<Host>(address).await;

        if self.watcher_queue.dequeue(address) {
            debug!("{} removed from the watcher queue", address);
        }
        if self.investigator.cancel_pending(address) {
            debug!("Dropped pending provisioning callback for {}", address);
        }
        match remove_host_from_all_clusters(&self.store, address).await {
            Ok(clusters) => {
                for name in clusters {
                    info!("{} has been removed from cluster {}", address, name);
                }
            }
            Err(e) => warn!("Failed to remove {} from its clusters: {}", address, e),
        }

        deleted?;
        info!("Deleted host {}", address);
        Ok(())
    }

    /// Host status plus what the cluster's container manager reports.
    ///
    /// With `raw` the container manager's status code is passed back
    /// alongside its untouched payload.
    pub async fn host_status(
        &self,
        address: &str,
        raw: bool,
    ) -> Result<(u16, Value), ServiceError> {
        let host = self.store.get::<Host>(address).await?;
        let cluster_type = cluster_for_host(&self.store, address)
            .await?
            .map(|c| c.cluster_type)
            .unwrap_or(ClusterType::HostOnly);

        let mut code = 200;
        let mut container_manager = json!({});
        if cluster_type.requires_container_manager() {
            if let Some(manager) = self.store.list_container_managers(cluster_type).first() {
                let (status, payload) = manager.get_host_status(address, raw).await?;
                if raw {
                    code = status;
                }
                container_manager = payload;
            }
        }

        let body = json!({
            "host": {
                "last_check": host.last_check,
                "status": host.status,
            },
            "type": cluster_type,
            "container_manager": container_manager,
        });
        Ok((code, body))
    }

    pub async fn host_creds(&self, address: &str) -> Result<Value, ServiceError> {
        Ok(self.store.get::<Host>(address).await?.credentials())
    }

    // ========================================================================
    // Clusters
    // ========================================================================

    pub async fn list_clusters(&self) -> Result<Vec<String>, ServiceError> {
        let clusters = self.store.list::<Cluster>().await?;
        Ok(clusters.into_iter().map(|c| c.name).collect())
    }

    pub async fn get_cluster(&self, name: &str) -> Result<ClusterView, ServiceError> {
        let cluster = self.store.get::<Cluster>(name).await?;

        let mut members = Vec::with_capacity(cluster.hostset.len());
        for address in &cluster.hostset {
            match self.store.get::<Host>(address).await {
                Ok(host) => members.push(host),
                Err(e) if e.is_not_found() => {
                    debug!("Cluster {} lists unknown host {}", name, address);
                    members.push(Host::new(address.clone()).with_status(HostStatus::Failed));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(ClusterView {
            hosts: HostCounts::tally(&members),
            name: cluster.name,
            status: cluster.status,
            cluster_type: cluster.cluster_type,
            network: cluster.network,
        })
    }

    /// Create a cluster on `network`, the default network when `None`. An
    /// existing cluster of the same name is returned unchanged. Any other
    /// network must already be stored.
    pub async fn create_cluster(
        &self,
        name: &str,
        cluster_type: ClusterType,
        network: Option<&str>,
    ) -> Result<Cluster, ServiceError> {
        match self.store.get::<Cluster>(name).await {
            Ok(existing) => return Ok(existing),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        let network = network.unwrap_or(DEFAULT_NETWORK);
        if network != DEFAULT_NETWORK {
            match self.store.get::<Network>(network).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    return Err(ServiceError::Conflict(format!(
                        "network {} does not exist",
                        network
                    )))
                }
                Err(e) => return Err(e.into()),
            }
        }
        let cluster = Cluster::new(name, cluster_type).with_network(network);
        let cluster = self.store.save(&cluster).await?;
        info!("Created {} cluster {}", cluster.cluster_type, cluster.name);
        Ok(cluster)
    }

    pub async fn delete_cluster(&self, name: &str) -> Result<(), ServiceError> {
        self.store.delete::<Cluster>(name).await?;
        info!("Deleted cluster {}", name);
        Ok(())
    }

    pub async fn cluster_hosts(&self, name: &str) -> Result<Vec<String>, ServiceError> {
        let cluster = self.store.get::<Cluster>(name).await?;
        Ok(cluster.hostset.into_iter().collect())
    }

    /// Replace the host list, provided the caller's view of it is current
    pub async fn replace_cluster_hosts(
        &self,
        name: &str,
        update: HostListUpdate,
    ) -> Result<(), ServiceError> {
        let mut cluster = self.store.get::<Cluster>(name).await?;
        let old: BTreeSet<String> = update.old.into_iter().collect();
        if old != cluster.hostset {
            return Err(ServiceError::Conflict(format!(
                "host list of cluster {} has changed",
                name
            )));
        }
        cluster.hostset = update.new.into_iter().collect();
        self.store.save(&cluster).await?;
        Ok(())
    }

    /// Whether `address` is a member; not-found when it is not
    pub async fn cluster_member(&self, name: &str, address: &str) -> Result<(), ServiceError> {
        if cluster_has_host(&self.store, name, address).await? {
            Ok(())
        } else {
            Err(ServiceError::NotFound(format!(
                "{} is not a member of cluster {}",
                address, name
            )))
        }
    }

    pub async fn add_cluster_host(&self, name: &str, address: &str) -> Result<(), ServiceError> {
        self.store.get::<Cluster>(name).await?;
        if let Some(other) = cluster_for_host(&self.store, address).await? {
            if other.name != name {
                return Err(ServiceError::Conflict(format!(
                    "{} already belongs to cluster {}",
                    address, other.name
                )));
            }
        }
        add_host_to_cluster(&self.store, name, address).await?;
        Ok(())
    }

    pub async fn remove_cluster_host(&self, name: &str, address: &str) -> Result<(), ServiceError> {
        remove_host_from_cluster(&self.store, name, address).await?;
        Ok(())
    }

    // ========================================================================
    // Networks
    // ========================================================================

    pub async fn list_networks(&self) -> Result<Vec<String>, ServiceError> {
        let networks = self.store.list::<Network>().await?;
        Ok(networks.into_iter().map(|n| n.name).collect())
    }

    pub async fn get_network(&self, name: &str) -> Result<Network, ServiceError> {
        Ok(self.store.get::<Network>(name).await?)
    }

    /// Create or replace a network. An etcd network needs an etcd store
    /// backend for hosts to read from.
    pub async fn create_network(
        &self,
        name: &str,
        request: NetworkRequest,
    ) -> Result<Network, ServiceError> {
        if request.network_type == NetworkType::FlannelEtcd
            && !self.store.store_handlers().contains(&"etcd")
        {
            return Err(ServiceError::Conflict(format!(
                "network type {} requires an etcd store handler",
                request.network_type
            )));
        }
        let network = Network::new(name, request.network_type).with_options(request.options);
        let network = self.store.save(&network).await?;
        info!("Saved {} network {}", network.network_type, network.name);
        Ok(network)
    }

    pub async fn delete_network(&self, name: &str) -> Result<(), ServiceError> {
        self.store.delete::<Network>(name).await?;
        info!("Deleted network {}", name);
        Ok(())
    }

    // ========================================================================
    // Cluster operations
    // ========================================================================

    /// Record and start `command` across the cluster's hosts
    pub async fn start_cluster_operation(
        &self,
        name: &str,
        command: ClusterCommand,
        version: Option<String>,
    ) -> Result<ClusterOperation, ServiceError> {
        let operation = clusterexec::begin(&self.store, name, command, version).await?;
        ClusterExecutor::new(self.store.clone(), self.transport.clone()).spawn(operation.clone());
        Ok(operation)
    }

    pub async fn get_cluster_operation(
        &self,
        name: &str,
        command: ClusterCommand,
    ) -> Result<ClusterOperation, ServiceError> {
        Ok(self
            .store
            .get::<ClusterOperation>(&ClusterOperation::key_for(command, name))
            .await?)
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub async fn system_status(&self) -> SystemStatus {
        let store = match self.store.check_backends().await {
            Ok(()) => ComponentStatus::new(true, Value::Null),
            Err(e) => {
                warn!("Store check failed: {}", e);
                ComponentStatus::new(false, json!({"error": e.to_string()}))
            }
        };
        let investigator = ComponentStatus::new(
            self.investigator.is_alive(),
            json!({"pending": self.investigator.pending_count()}),
        );
        let watcher = ComponentStatus::new(
            self.watcher.as_ref().is_some_and(|w| w.is_alive()),
            json!({"size": self.watcher_queue.qsize()}),
        );
        SystemStatus {
            store,
            investigator,
            watcher,
        }
    }
}

/// Persist a successfully provisioned host and join its cluster. Hosts
/// whose provisioning failed are not written.
fn persist_callback(store: StoreManager, cluster: Option<String>) -> CompletionCallback {
    Box::new(move |host, error| {
        Box::pin(async move {
            if let Some(e) = error {
                warn!("Not saving {}: {}", host.address, e);
                return;
            }
            if let Err(e) = store.save(&host).await {
                warn!("Unable to save {}: {}", host.address, e);
                return;
            }
            if let Some(name) = cluster {
                match add_host_to_cluster(&store, &name, &host.address).await {
                    Ok(_) => info!("{} joined cluster {}", host.address, name),
                    Err(e) => warn!("Unable to add {} to cluster {}: {}", host.address, name, e),
                }
            }
        })
    })
}
