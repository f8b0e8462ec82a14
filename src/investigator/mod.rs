//! Investigator - host provisioning
//!
//! Two halves talk over a pair of channels:
//!
//! - [`Investigator`] (the coordinator) accepts requests from the API layer,
//!   remembers a completion callback per host address and runs a listener
//!   task that matches worker responses back to those callbacks.
//! - [`ProvisionWorker`] takes one request at a time and drives the host
//!   through fact gathering, bootstrap and container-manager registration.
//!
//! The worker never writes to the store; whatever it learns travels back in
//! the response and the callback decides what to persist.

pub mod coordinator;
pub mod messages;
pub mod worker;

use thiserror::Error;

pub use coordinator::{CompletionCallback, Investigator};
pub use messages::{ProvisionRequest, ProvisionResponse, WorkerMessage};
pub use worker::ProvisionWorker;

/// Why a provisioning pass stopped early
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("Fact gathering failed for {address}: {reason}")]
    FactGathering { address: String, reason: String },

    #[error("Bootstrap failed for {address}: {reason}")]
    Bootstrap { address: String, reason: String },
}

#[derive(Error, Debug)]
pub enum InvestigatorError {
    #[error("Provisioning worker is not running")]
    WorkerGone,
}
