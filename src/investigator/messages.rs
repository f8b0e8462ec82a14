//! Messages exchanged between the coordinator and the provisioning worker

use uuid::Uuid;

use super::ProvisionError;
use crate::model::{Cluster, Host};
use crate::store::StoreManager;

/// One host to provision
#[derive(Debug)]
pub struct ProvisionRequest {
    pub id: Uuid,
    /// Handle cloned for the worker; it opens its own backend connections
    pub store: StoreManager,
    pub host: Host,
    /// Cluster snapshot taken at submit time
    pub cluster: Option<Cluster>,
}

/// Terminal outcome of a request
#[derive(Debug)]
pub struct ProvisionResponse {
    pub id: Uuid,
    pub host: Host,
    pub error: Option<ProvisionError>,
}

/// Traffic on the response channel
#[derive(Debug)]
pub enum WorkerMessage {
    Response(ProvisionResponse),
    /// Stops the response listener
    Shutdown,
}
