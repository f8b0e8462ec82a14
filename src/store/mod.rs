//! Record store
//!
//! [`StoreManager`] routes typed records to backend handlers by record kind.
//! Backends are registered as [`HandlerFactory`] values together with the
//! kinds they serve; live handlers are created lazily on first use and
//! cached per manager instance. Cloning a manager copies the registrations
//! only, so the clone opens its own connections.

pub mod etcd;
pub mod kubernetes;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::containermgr::{ContainerManager, ContainerManagerFactory};
use crate::model::{ClusterType, Record, RecordKind, ValidationError};

pub use etcd::{EtcdConfig, EtcdHandler};
pub use kubernetes::{KubeStoreConfig, KubeStoreHandler};
pub use memory::MemoryStore;

/// Errors raised by the store and its backends
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} '{key}' not found")]
    NotFound { kind: RecordKind, key: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("No store handler registered for {0}")]
    NoHandler(RecordKind),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(kind: RecordKind, key: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// One backend connection, working on JSON renderings of records
#[async_trait]
pub trait StoreHandler: Send + Sync {
    async fn get(&self, kind: RecordKind, key: &str) -> Result<Value, StoreError>;

    /// Write `value` under `key`, returning what was stored
    async fn save(&self, kind: RecordKind, key: &str, value: Value) -> Result<Value, StoreError>;

    async fn delete(&self, kind: RecordKind, key: &str) -> Result<(), StoreError>;

    async fn list(&self, kind: RecordKind) -> Result<Vec<Value>, StoreError>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Configuration of a backend that can open new handlers
pub trait HandlerFactory: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    fn connect(&self) -> Result<Arc<dyn StoreHandler>, StoreError>;

    /// Where the backend is reached, if it is a remote service
    fn endpoint(&self) -> Option<String> {
        None
    }
}

struct Registration {
    factory: Arc<dyn HandlerFactory>,
    kinds: Vec<RecordKind>,
}

/// Type-routed access to every configured backend
pub struct StoreManager {
    registrations: Vec<Registration>,
    routes: HashMap<RecordKind, usize>,
    container_managers: Vec<Arc<dyn ContainerManagerFactory>>,
    handlers: DashMap<usize, Arc<dyn StoreHandler>>,
}

impl Clone for StoreManager {
    fn clone(&self) -> Self {
        Self {
            registrations: self
                .registrations
                .iter()
                .map(|r| Registration {
                    factory: r.factory.clone(),
                    kinds: r.kinds.clone(),
                })
                .collect(),
            routes: self.routes.clone(),
            container_managers: self.container_managers.clone(),
            handlers: DashMap::new(),
        }
    }
}

impl std::fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManager")
            .field(
                "backends",
                &self
                    .registrations
                    .iter()
                    .map(|r| (r.factory.name(), r.kinds.clone()))
                    .collect::<Vec<_>>(),
            )
            .field("container_managers", &self.container_managers.len())
            .field("connected", &self.handlers.len())
            .finish()
    }
}

impl Default for StoreManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreManager {
    /// An empty manager with no backends
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            routes: HashMap::new(),
            container_managers: Vec::new(),
            handlers: DashMap::new(),
        }
    }

    /// A manager serving every record kind from one shared in-memory backend
    pub fn in_memory() -> Self {
        let mut manager = Self::new();
        manager.register_handler(Arc::new(MemoryStore::new()), &RecordKind::ALL);
        manager
    }

    /// Route `kinds` to `factory`. A later registration for a kind replaces
    /// the earlier route.
    pub fn register_handler(&mut self, factory: Arc<dyn HandlerFactory>, kinds: &[RecordKind]) {
        let index = self.registrations.len();
        for kind in kinds {
            if let Some(previous) = self.routes.insert(*kind, index) {
                warn!(
                    "{} handler replaces {} for {}",
                    factory.name(),
                    self.registrations[previous].factory.name(),
                    kind
                );
            }
        }
        debug!("Registered {} handler for {:?}", factory.name(), kinds);
        self.registrations.push(Registration {
            factory,
            kinds: kinds.to_vec(),
        });
    }

    /// Names of the registered backends, in registration order
    pub fn store_handlers(&self) -> Vec<&'static str> {
        self.registrations.iter().map(|r| r.factory.name()).collect()
    }

    /// Endpoint of the first registered backend named `name`
    pub fn backend_endpoint(&self, name: &str) -> Option<String> {
        self.registrations
            .iter()
            .find(|r| r.factory.name() == name)
            .and_then(|r| r.factory.endpoint())
    }

    pub fn register_container_manager(&mut self, factory: Arc<dyn ContainerManagerFactory>) {
        self.container_managers.push(factory);
    }

    /// Fresh clients for every container manager serving `cluster_type`.
    /// Managers that fail to build are logged and skipped.
    pub fn list_container_managers(
        &self,
        cluster_type: ClusterType,
    ) -> Vec<Arc<dyn ContainerManager>> {
        self.container_managers
            .iter()
            .filter(|f| f.cluster_type() == cluster_type)
            .filter_map(|f| match f.connect() {
                Ok(manager) => Some(manager),
                Err(e) => {
                    warn!("Skipping {} container manager: {}", cluster_type, e);
                    None
                }
            })
            .collect()
    }

    fn handler_for(&self, kind: RecordKind) -> Result<Arc<dyn StoreHandler>, StoreError> {
        let index = *self.routes.get(&kind).ok_or(StoreError::NoHandler(kind))?;
        if let Some(handler) = self.handlers.get(&index) {
            return Ok(handler.clone());
        }
        let registration = &self.registrations[index];
        let handler = registration.factory.connect()?;
        debug!("Connected {} handler", registration.factory.name());
        self.handlers.insert(index, handler.clone());
        Ok(handler)
    }

    pub async fn get<R: Record>(&self, key: &str) -> Result<R, StoreError> {
        let value = self.handler_for(R::KIND)?.get(R::KIND, key).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Validate `record` against its schema and write it.
    pub async fn save<R: Record>(&self, record: &R) -> Result<R, StoreError> {
        let value = serde_json::to_value(record)?;
        R::schema().validate(&value)?;
        let key = record.primary_key();
        let stored = self.handler_for(R::KIND)?.save(R::KIND, &key, value).await?;
        Ok(serde_json::from_value(stored)?)
    }

    pub async fn delete<R: Record>(&self, key: &str) -> Result<(), StoreError> {
        self.handler_for(R::KIND)?.delete(R::KIND, key).await
    }

    /// Every record of a kind. Entries that no longer parse are skipped.
    pub async fn list<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let values = self.handler_for(R::KIND)?.list(R::KIND).await?;
        Ok(values
            .into_iter()
            .filter_map(|value| match serde_json::from_value(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping unreadable {} record: {}", R::KIND, e);
                    None
                }
            })
            .collect())
    }

    /// Ping every registered backend
    pub async fn check_backends(&self) -> Result<(), StoreError> {
        for kind in self.routes.keys() {
            self.handler_for(*kind)?.ping().await?;
        }
        Ok(())
    }
}
