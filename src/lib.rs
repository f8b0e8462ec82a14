//! hostkeeper: provisions hosts over SSH, tracks their health and groups
//! them into container-manager clusters.

pub mod api;
pub mod cli;
pub mod clusterexec;
pub mod clusters;
pub mod config;
pub mod containermgr;
pub mod investigator;
pub mod model;
pub mod service;
pub mod store;
pub mod supervisor;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;
pub mod watcher;
