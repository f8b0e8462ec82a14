//! In-process fakes for the transport and container-manager seams
//!
//! Used by the unit tests; nothing here touches the network or spawns
//! processes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::containermgr::{ContainerManager, ContainerManagerFactory, ContainerManagerError};
use crate::model::{Cluster, ClusterType};
use crate::store::StoreManager;
use crate::transport::{OsCommands, RemoteTarget, Transport, TransportError, TransportResult};

/// What a fake remote operation does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOutcome {
    /// Completes with this exit code
    Exit(i32),
    /// Cannot be run at all
    Error,
}

impl FakeOutcome {
    fn resolve(
        self,
        address: &str,
        facts: Map<String, Value>,
    ) -> Result<TransportResult, TransportError> {
        match self {
            FakeOutcome::Exit(exit_code) => Ok(TransportResult { exit_code, facts }),
            FakeOutcome::Error => Err(TransportError::Timeout {
                address: address.to_string(),
                secs: 0,
            }),
        }
    }
}

/// Facts reported by [`FakeTransport::new`]
pub fn default_facts() -> Map<String, Value> {
    match json!({"os": "fedora", "cpus": 2, "memory": 11989228, "space": 487652}) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Transport recording every call as `"<operation>:<address>"`
pub struct FakeTransport {
    facts: Map<String, Value>,
    get_info: FakeOutcome,
    bootstrap: FakeOutcome,
    availability: HashMap<String, FakeOutcome>,
    command_failures: HashMap<String, FakeOutcome>,
    calls: Mutex<Vec<String>>,
    key_paths: Mutex<Vec<PathBuf>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    /// Every operation succeeds; fact gathering reports [`default_facts`]
    pub fn new() -> Self {
        Self {
            facts: default_facts(),
            get_info: FakeOutcome::Exit(0),
            bootstrap: FakeOutcome::Exit(0),
            availability: HashMap::new(),
            command_failures: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            key_paths: Mutex::new(Vec::new()),
        }
    }

    pub fn with_facts(mut self, facts: Map<String, Value>) -> Self {
        self.facts = facts;
        self
    }

    pub fn with_get_info(mut self, outcome: FakeOutcome) -> Self {
        self.get_info = outcome;
        self
    }

    pub fn with_bootstrap(mut self, outcome: FakeOutcome) -> Self {
        self.bootstrap = outcome;
        self
    }

    /// Availability outcome for one address; others succeed
    pub fn with_availability(mut self, address: &str, outcome: FakeOutcome) -> Self {
        self.availability.insert(address.to_string(), outcome);
        self
    }

    /// Restart/upgrade/deploy outcome for one address; others succeed
    pub fn with_command_outcome(mut self, address: &str, outcome: FakeOutcome) -> Self {
        self.command_failures.insert(address.to_string(), outcome);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of calls of one operation
    pub fn count(&self, operation: &str) -> usize {
        let prefix = format!("{}:", operation);
        self.calls()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Key files seen by the transport, in call order
    pub fn key_paths(&self) -> Vec<PathBuf> {
        self.key_paths.lock().map(|k| k.clone()).unwrap_or_default()
    }

    fn record(&self, operation: &str, target: RemoteTarget<'_>) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(format!("{}:{}", operation, target.address));
        }
        if let Ok(mut keys) = self.key_paths.lock() {
            keys.push(target.key_path.to_path_buf());
        }
    }

    fn command_outcome(&self, address: &str) -> FakeOutcome {
        self.command_failures
            .get(address)
            .copied()
            .unwrap_or(FakeOutcome::Exit(0))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get_info(&self, target: RemoteTarget<'_>) -> Result<TransportResult, TransportError> {
        self.record("get_info", target);
        self.get_info.resolve(target.address, self.facts.clone())
    }

    async fn bootstrap(
        &self,
        target: RemoteTarget<'_>,
        _cluster: Option<&Cluster>,
        _store: &StoreManager,
        _oscmd: &OsCommands,
    ) -> Result<TransportResult, TransportError> {
        self.record("bootstrap", target);
        self.bootstrap.resolve(target.address, Map::new())
    }

    async fn check_host_availability(
        &self,
        target: RemoteTarget<'_>,
    ) -> Result<TransportResult, TransportError> {
        self.record("check_host_availability", target);
        self.availability
            .get(target.address)
            .copied()
            .unwrap_or(FakeOutcome::Exit(0))
            .resolve(target.address, Map::new())
    }

    async fn restart(
        &self,
        target: RemoteTarget<'_>,
        _oscmd: &OsCommands,
    ) -> Result<TransportResult, TransportError> {
        self.record("restart", target);
        self.command_outcome(target.address)
            .resolve(target.address, Map::new())
    }

    async fn upgrade(
        &self,
        target: RemoteTarget<'_>,
        _oscmd: &OsCommands,
    ) -> Result<TransportResult, TransportError> {
        self.record("upgrade", target);
        self.command_outcome(target.address)
            .resolve(target.address, Map::new())
    }

    async fn deploy(
        &self,
        target: RemoteTarget<'_>,
        _oscmd: &OsCommands,
        _version: &str,
    ) -> Result<TransportResult, TransportError> {
        self.record("deploy", target);
        self.command_outcome(target.address)
            .resolve(target.address, Map::new())
    }
}

/// Container manager that confirms registration after a number of polls
pub struct FakeContainerManager {
    misses_before_registered: Option<u32>,
    polls: AtomicU32,
}

impl FakeContainerManager {
    pub fn registered() -> Self {
        Self::registered_after(0)
    }

    /// Reports unregistered `misses` times, then registered
    pub fn registered_after(misses: u32) -> Self {
        Self {
            misses_before_registered: Some(misses),
            polls: AtomicU32::new(0),
        }
    }

    pub fn never_registered() -> Self {
        Self {
            misses_before_registered: None,
            polls: AtomicU32::new(0),
        }
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerManager for FakeContainerManager {
    fn name(&self) -> &str {
        "fake"
    }

    fn endpoint(&self) -> &str {
        "http://fake.invalid"
    }

    async fn node_registered(&self, _address: &str) -> bool {
        let seen = self.polls.fetch_add(1, Ordering::SeqCst);
        match self.misses_before_registered {
            Some(misses) => seen >= misses,
            None => false,
        }
    }

    async fn get_host_status(&self, address: &str, raw: bool) -> Result<(u16, Value), ContainerManagerError> {
        let payload = json!({
            "metadata": {"name": address},
            "status": {"phase": "Running"}
        });
        if raw {
            Ok((200, payload))
        } else {
            Ok((200, payload["status"].clone()))
        }
    }
}

/// Hands out one shared [`FakeContainerManager`] for kubernetes clusters
pub struct FakeContainerManagerFactory {
    manager: Arc<FakeContainerManager>,
}

impl FakeContainerManagerFactory {
    pub fn new(manager: FakeContainerManager) -> Self {
        Self {
            manager: Arc::new(manager),
        }
    }

    pub fn registered() -> Self {
        Self::new(FakeContainerManager::registered())
    }

    pub fn never_registered() -> Self {
        Self::new(FakeContainerManager::never_registered())
    }

    pub fn manager(&self) -> Arc<FakeContainerManager> {
        self.manager.clone()
    }
}

impl ContainerManagerFactory for FakeContainerManagerFactory {
    fn cluster_type(&self) -> ClusterType {
        ClusterType::Kubernetes
    }

    fn connect(&self) -> Result<Arc<dyn ContainerManager>, ContainerManagerError> {
        let manager: Arc<dyn ContainerManager> = self.manager.clone();
        Ok(manager)
    }
}
