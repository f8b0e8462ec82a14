//! Cluster record - a named group of hosts sharing a container manager type

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::host::Host;
use super::network::DEFAULT_NETWORK;
use super::schema::{Constraint, FieldSpec, FieldType, Schema};
use super::{Record, RecordKind};

/// Which container manager (if any) hosts of a cluster must register with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    /// Plain hosts, no container manager
    HostOnly,
    #[default]
    Kubernetes,
}

impl ClusterType {
    pub const NAMES: &'static [&'static str] = &["host_only", "kubernetes"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::HostOnly => "host_only",
            ClusterType::Kubernetes => "kubernetes",
        }
    }

    /// Whether bootstrapped hosts must be confirmed by a container manager
    pub fn requires_container_manager(&self) -> bool {
        !matches!(self, ClusterType::HostOnly)
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host_only" => Ok(ClusterType::HostOnly),
            "kubernetes" => Ok(ClusterType::Kubernetes),
            other => Err(format!("unknown cluster type '{}'", other)),
        }
    }
}

/// A named group of host addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,

    #[serde(default)]
    pub status: String,

    #[serde(rename = "type", default)]
    pub cluster_type: ClusterType,

    /// Name of the network record hosts are configured for
    #[serde(default = "default_network")]
    pub network: String,

    /// Member addresses. Not part of the default rendering.
    #[serde(default)]
    pub hostset: BTreeSet<String>,
}

fn default_network() -> String {
    DEFAULT_NETWORK.to_string()
}

static CLUSTER_SCHEMA: Schema = Schema {
    kind: RecordKind::Cluster,
    fields: &[
        FieldSpec::required("name", FieldType::String).with(&[Constraint::NonEmpty]),
        FieldSpec::required("status", FieldType::String),
        FieldSpec::required("type", FieldType::String)
            .with(&[Constraint::OneOf(ClusterType::NAMES)]),
        FieldSpec::required("network", FieldType::String).with(&[Constraint::NonEmpty]),
        FieldSpec::required("hostset", FieldType::StringList),
    ],
};

impl Cluster {
    pub fn new(name: impl Into<String>, cluster_type: ClusterType) -> Self {
        Self {
            name: name.into(),
            status: "ok".to_string(),
            cluster_type,
            network: default_network(),
            hostset: BTreeSet::new(),
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn contains(&self, address: &str) -> bool {
        self.hostset.contains(address)
    }
}

impl Record for Cluster {
    const KIND: RecordKind = RecordKind::Cluster;

    fn primary_key(&self) -> String {
        self.name.clone()
    }

    fn schema() -> &'static Schema {
        &CLUSTER_SCHEMA
    }

    fn hidden_fields() -> &'static [&'static str] {
        &["hostset"]
    }
}

/// Availability summary of a cluster's members
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCounts {
    pub total: usize,
    pub available: usize,
    pub unavailable: usize,
}

impl HostCounts {
    /// Count hosts by availability. `active` is available, everything else is not.
    pub fn tally<'a>(hosts: impl IntoIterator<Item = &'a Host>) -> Self {
        hosts.into_iter().fold(Self::default(), |mut counts, host| {
            counts.total += 1;
            if host.status.is_available() {
                counts.available += 1;
            } else {
                counts.unavailable += 1;
            }
            counts
        })
    }
}
