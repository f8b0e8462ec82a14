//! Remote operations transport
//!
//! The transport runs named operations against a host and reports an exit
//! code plus whatever facts the operation produced. A non-zero exit code is
//! a normal result; [`TransportError`] is reserved for operations that could
//! not be run at all.

pub mod key;
pub mod oscmd;
pub mod ssh;

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{Cluster, Host};
use crate::store::StoreManager;

pub use key::TemporarySshKey;
pub use oscmd::{get_oscmd, FlannelBackend, OsCommands};
pub use ssh::{SshTransport, SshTransportConfig};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to spawn remote command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Remote command on {address} timed out after {secs}s")]
    Timeout { address: String, secs: u64 },

    #[error("Unsupported operating system '{0}'")]
    UnsupportedOs(String),

    #[error("Key material error: {0}")]
    Key(String),

    #[error("Remote command on {address} exited with {code}")]
    Failed { address: String, code: i32 },
}

/// Exit code and gathered facts of one remote operation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportResult {
    pub exit_code: i32,
    pub facts: Map<String, Value>,
}

impl TransportResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_facts(facts: Map<String, Value>) -> Self {
        Self {
            exit_code: 0,
            facts,
        }
    }

    pub fn exit(exit_code: i32) -> Self {
        Self {
            exit_code,
            facts: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`TransportError::Failed`]
    pub fn into_success(self, address: &str) -> Result<Self, TransportError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(TransportError::Failed {
                address: address.to_string(),
                code: self.exit_code,
            })
        }
    }
}

/// Where and as whom an operation runs
#[derive(Debug, Clone, Copy)]
pub struct RemoteTarget<'a> {
    pub address: &'a str,
    pub remote_user: &'a str,
    pub key_path: &'a Path,
}

impl<'a> RemoteTarget<'a> {
    pub fn for_host(host: &'a Host, key_path: &'a Path) -> Self {
        Self {
            address: &host.address,
            remote_user: &host.remote_user,
            key_path,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Gather `os`, `cpus`, `memory` and `space` facts
    async fn get_info(&self, target: RemoteTarget<'_>) -> Result<TransportResult, TransportError>;

    /// Configure the host to join `cluster` (or run standalone)
    async fn bootstrap(
        &self,
        target: RemoteTarget<'_>,
        cluster: Option<&Cluster>,
        store: &StoreManager,
        oscmd: &OsCommands,
    ) -> Result<TransportResult, TransportError>;

    /// Whether the host answers at all
    async fn check_host_availability(
        &self,
        target: RemoteTarget<'_>,
    ) -> Result<TransportResult, TransportError>;

    async fn restart(
        &self,
        target: RemoteTarget<'_>,
        oscmd: &OsCommands,
    ) -> Result<TransportResult, TransportError>;

    async fn upgrade(
        &self,
        target: RemoteTarget<'_>,
        oscmd: &OsCommands,
    ) -> Result<TransportResult, TransportError>;

    async fn deploy(
        &self,
        target: RemoteTarget<'_>,
        oscmd: &OsCommands,
        version: &str,
    ) -> Result<TransportResult, TransportError>;
}
