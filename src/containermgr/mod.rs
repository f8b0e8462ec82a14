//! Container-manager clients
//!
//! A container manager is the external orchestrator a clustered host must
//! register with before it counts as `active`. Clients are built from a
//! [`ContainerManagerFactory`] so every holder of a store handle can get its
//! own client.

pub mod kubernetes;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::model::ClusterType;

pub use kubernetes::{KubeContainerManager, KubeContainerManagerConfig};

/// Default number of registration polls
pub const REGISTRATION_ATTEMPTS: u32 = 3;

/// Default delay between registration polls
pub const REGISTRATION_DELAY_SECS: u64 = 5;

#[derive(Error, Debug)]
pub enum ContainerManagerError {
    #[error("Container manager request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Container manager client error: {0}")]
    Client(String),
}

/// Checks host registration against one external container manager
#[async_trait]
pub trait ContainerManager: Send + Sync {
    /// Name used in logs and status payloads
    fn name(&self) -> &str;

    /// Base URL hosts are pointed at when they join
    fn endpoint(&self) -> &str;

    /// Whether `address` is known to the container manager
    async fn node_registered(&self, address: &str) -> bool;

    /// Status of `address` as seen by the container manager.
    ///
    /// With `raw` the manager's own status code and payload are passed
    /// through untouched; otherwise the payload is reduced to the node's
    /// status section.
    async fn get_host_status(&self, address: &str, raw: bool) -> Result<(u16, Value), ContainerManagerError>;
}

/// Builds fresh clients for one configured container manager
pub trait ContainerManagerFactory: Send + Sync {
    /// Cluster type this manager serves
    fn cluster_type(&self) -> ClusterType;

    fn connect(&self) -> Result<Arc<dyn ContainerManager>, ContainerManagerError>;
}

/// Registration polling policy
#[derive(Debug, Clone, Copy)]
pub struct RegistrationPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RegistrationPolicy {
    fn default() -> Self {
        Self {
            attempts: REGISTRATION_ATTEMPTS,
            delay: Duration::from_secs(REGISTRATION_DELAY_SECS),
        }
    }
}

impl RegistrationPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Poll `manager` until it reports `address` registered or attempts run out.
pub async fn wait_for_registration(
    manager: &dyn ContainerManager,
    address: &str,
    policy: RegistrationPolicy,
) -> bool {
    for attempt in 1..=policy.attempts {
        if manager.node_registered(address).await {
            debug!(
                "{} registered with {} (attempt {})",
                address,
                manager.name(),
                attempt
            );
            return true;
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }
    debug!(
        "{} not registered with {} after {} attempts",
        address,
        manager.name(),
        policy.attempts
    );
    false
}
