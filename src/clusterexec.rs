//! Cluster-wide restart, upgrade and deploy
//!
//! An operation walks the cluster's hosts one at a time, each with its own
//! temporary key file, and records progress in a [`ClusterOperation`] keyed
//! by `<command>/<cluster>`. The first host that fails marks the whole
//! operation failed and stops it.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::model::{Cluster, ClusterCommand, ClusterOperation, Host, OperationStatus};
use crate::store::{StoreError, StoreManager};
use crate::transport::{
    get_oscmd, OsCommands, RemoteTarget, TemporarySshKey, Transport, TransportError,
    TransportResult,
};

#[derive(Error, Debug)]
pub enum ClusterExecError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("deploy requires a version")]
    MissingVersion,

    #[error("{command} failed on {address}: {reason}")]
    Host {
        command: ClusterCommand,
        address: String,
        reason: String,
    },
}

/// Record a new `in_process` operation for an existing cluster.
///
/// Any earlier record for the same command and cluster is replaced.
pub async fn begin(
    store: &StoreManager,
    cluster_name: &str,
    command: ClusterCommand,
    version: Option<String>,
) -> Result<ClusterOperation, ClusterExecError> {
    if command == ClusterCommand::Deploy && version.as_deref().map_or(true, str::is_empty) {
        return Err(ClusterExecError::MissingVersion);
    }
    let cluster = store.get::<Cluster>(cluster_name).await?;

    let mut operation = ClusterOperation::start(&cluster.name, command, version, Utc::now());
    operation.in_process = cluster.hostset.iter().cloned().collect();
    let operation = store.save(&operation).await?;
    info!(
        "Started {} on cluster {} ({} hosts)",
        command,
        cluster.name,
        operation.in_process.len()
    );
    Ok(operation)
}

/// Runs recorded cluster operations against the hosts
pub struct ClusterExecutor {
    store: StoreManager,
    transport: Arc<dyn Transport>,
}

impl ClusterExecutor {
    pub fn new(store: StoreManager, transport: Arc<dyn Transport>) -> Self {
        Self { store, transport }
    }

    /// Run `operation` in the background
    pub fn spawn(self, operation: ClusterOperation) -> JoinHandle<ClusterOperation> {
        tokio::spawn(async move { self.run(operation).await })
    }

    /// Run `operation` to completion and return its final record.
    ///
    /// A store failure aborts the run without a final write; the stored
    /// record stays `in_process`.
    pub async fn run(&self, mut operation: ClusterOperation) -> ClusterOperation {
        let outcome = self.execute(&mut operation).await;
        let status = match outcome {
            Ok(()) => {
                info!("{} finished on cluster {}", operation.command, operation.name);
                OperationStatus::Finished
            }
            Err(ClusterExecError::Store(e)) => {
                error!(
                    "Aborting {} on cluster {}: {}",
                    operation.command, operation.name, e
                );
                return operation;
            }
            Err(e) => {
                warn!("{} on cluster {} failed: {}", operation.command, operation.name, e);
                OperationStatus::Failed
            }
        };

        operation.complete(status, Utc::now());
        match self.store.save(&operation).await {
            Ok(saved) => saved,
            Err(e) => {
                error!(
                    "Unable to record {} of {} on cluster {}: {}",
                    status, operation.command, operation.name, e
                );
                operation
            }
        }
    }

    async fn execute(&self, operation: &mut ClusterOperation) -> Result<(), ClusterExecError> {
        let pending = operation.in_process.clone();
        for address in pending {
            let host = self.store.get::<Host>(&address).await?;
            self.run_on_host(operation, &host).await?;
            operation.mark_finished(&address);
            *operation = self.store.save(operation).await?;
            debug!("{} done on {}", operation.command, address);
        }
        Ok(())
    }

    async fn run_on_host(
        &self,
        operation: &ClusterOperation,
        host: &Host,
    ) -> Result<(), ClusterExecError> {
        let host_error = |reason: String| ClusterExecError::Host {
            command: operation.command,
            address: host.address.clone(),
            reason,
        };

        let key = TemporarySshKey::write(&host.address, &host.ssh_priv_key)
            .map_err(|e| host_error(e.to_string()))?;
        let oscmd = get_oscmd(&host.os).map_err(|e| host_error(e.to_string()))?;

        info!("Running {} on {}", operation.command, host.address);
        let target = RemoteTarget::for_host(host, key.path());
        self.dispatch(operation, target, &oscmd)
            .await
            .and_then(|result| result.into_success(&host.address))
            .map_err(|e| host_error(e.to_string()))?;
        Ok(())
    }

    async fn dispatch(
        &self,
        operation: &ClusterOperation,
        target: RemoteTarget<'_>,
        oscmd: &OsCommands,
    ) -> Result<TransportResult, TransportError> {
        match operation.command {
            ClusterCommand::Restart => self.transport.restart(target, oscmd).await,
            ClusterCommand::Upgrade => self.transport.upgrade(target, oscmd).await,
            ClusterCommand::Deploy => {
                let version = operation.version.as_deref().unwrap_or_default();
                self.transport.deploy(target, oscmd, version).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusters::add_host_to_cluster;
    use crate::model::{ClusterType, HostStatus};
    use crate::testing::{FakeOutcome, FakeTransport};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    async fn cluster_with_hosts(addresses: &[&str]) -> StoreManager {
        let store = StoreManager::in_memory();
        store
            .save(&Cluster::new("honeynut", ClusterType::Kubernetes))
            .await
            .unwrap();
        for address in addresses {
            let mut host = Host::new(*address)
                .with_ssh_key(STANDARD.encode("key"))
                .with_status(HostStatus::Active);
            host.os = "fedora".to_string();
            store.save(&host).await.unwrap();
            add_host_to_cluster(&store, "honeynut", address)
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_restart_every_host() {
        let store = cluster_with_hosts(&["a", "b"]).await;
        let transport = Arc::new(FakeTransport::new());

        let operation = begin(&store, "honeynut", ClusterCommand::Restart, None)
            .await
            .unwrap();
        assert_eq!(operation.status, OperationStatus::InProcess);
        assert_eq!(operation.in_process, vec!["a", "b"]);

        let done = ClusterExecutor::new(store.clone(), transport.clone())
            .run(operation)
            .await;
        assert_eq!(done.status, OperationStatus::Finished);
        assert_eq!(done.finished, vec!["a", "b"]);
        assert!(done.in_process.is_empty());
        assert!(!done.finished_at.is_empty());
        assert_eq!(transport.calls(), vec!["restart:a", "restart:b"]);

        let stored: ClusterOperation = store.get("restart/honeynut").await.unwrap();
        assert_eq!(stored, done);

        for path in transport.key_paths() {
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn test_first_failure_stops_operation() {
        let store = cluster_with_hosts(&["a", "b", "c"]).await;
        let transport = Arc::new(FakeTransport::new().with_command_outcome("b", FakeOutcome::Exit(1)));

        let operation = begin(&store, "honeynut", ClusterCommand::Upgrade, None)
            .await
            .unwrap();
        let done = ClusterExecutor::new(store.clone(), transport.clone())
            .run(operation)
            .await;

        assert_eq!(done.status, OperationStatus::Failed);
        assert_eq!(done.finished, vec!["a"]);
        assert_eq!(done.in_process, vec!["b", "c"]);
        assert_eq!(transport.count("upgrade"), 2);
    }

    #[tokio::test]
    async fn test_missing_host_aborts() {
        let store = cluster_with_hosts(&["a"]).await;
        add_host_to_cluster(&store, "honeynut", "ghost")
            .await
            .unwrap();
        let transport = Arc::new(FakeTransport::new());

        let operation = begin(&store, "honeynut", ClusterCommand::Restart, None)
            .await
            .unwrap();
        let done = ClusterExecutor::new(store.clone(), transport)
            .run(operation)
            .await;

        assert_eq!(done.status, OperationStatus::InProcess);
        let stored: ClusterOperation = store.get("restart/honeynut").await.unwrap();
        assert_eq!(stored.status, OperationStatus::InProcess);
        assert_eq!(stored.finished, vec!["a"]);
    }

    #[tokio::test]
    async fn test_deploy_needs_version() {
        let store = cluster_with_hosts(&["a"]).await;
        let err = begin(&store, "honeynut", ClusterCommand::Deploy, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterExecError::MissingVersion));

        let operation = begin(
            &store,
            "honeynut",
            ClusterCommand::Deploy,
            Some("7.1".to_string()),
        )
        .await
        .unwrap();
        let transport = Arc::new(FakeTransport::new());
        let done = ClusterExecutor::new(store, transport.clone())
            .spawn(operation)
            .await
            .unwrap();
        assert_eq!(done.status, OperationStatus::Finished);
        assert_eq!(done.version.as_deref(), Some("7.1"));
        assert_eq!(transport.calls(), vec!["deploy:a"]);
    }

    #[tokio::test]
    async fn test_unknown_cluster() {
        let store = StoreManager::in_memory();
        let err = begin(&store, "nope", ClusterCommand::Restart, None)
            .await
            .unwrap_err();
        match err {
            ClusterExecError::Store(e) => assert!(e.is_not_found()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
