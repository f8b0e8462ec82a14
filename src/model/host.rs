//! Host record - a machine being provisioned and supervised
//!
//! A Host moves through the following statuses:
//!
//! ```text
//!   (new) -> investigating -> bootstrapping -> active
//!                 |                 |       -> inactive
//!                 v                 v
//!               failed        disassociated
//! ```
//!
//! After provisioning the watcher keeps flipping `failed` hosts back to
//! `active`/`disassociated` and reachable-but-broken hosts to `failed`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::schema::{Constraint, FieldSpec, FieldType, Schema};
use super::{format_timestamp, parse_timestamp, Record, RecordKind};

/// Default user for remote operations
pub const DEFAULT_REMOTE_USER: &str = "root";

/// Sentinel for facts that have not been gathered yet
pub const UNKNOWN_CPUS: i64 = -1;

/// Lifecycle status of a Host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    /// Facts are being gathered
    #[default]
    Investigating,
    /// Remote configuration is running
    Bootstrapping,
    /// Bootstrapped and, where required, registered with its container manager
    Active,
    /// Bootstrapped but the container manager never saw the host
    Inactive,
    /// Reachable but not joined to its cluster; needs a new bootstrap
    Disassociated,
    /// Unreachable or fact gathering failed
    Failed,
}

impl HostStatus {
    pub const NAMES: &'static [&'static str] = &[
        "investigating",
        "bootstrapping",
        "active",
        "inactive",
        "disassociated",
        "failed",
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Investigating => "investigating",
            HostStatus::Bootstrapping => "bootstrapping",
            HostStatus::Active => "active",
            HostStatus::Inactive => "inactive",
            HostStatus::Disassociated => "disassociated",
            HostStatus::Failed => "failed",
        }
    }

    /// Whether the host counts as available in cluster summaries
    pub fn is_available(&self) -> bool {
        matches!(self, HostStatus::Active)
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "investigating" => Ok(HostStatus::Investigating),
            "bootstrapping" => Ok(HostStatus::Bootstrapping),
            "active" => Ok(HostStatus::Active),
            "inactive" => Ok(HostStatus::Inactive),
            "disassociated" => Ok(HostStatus::Disassociated),
            "failed" => Ok(HostStatus::Failed),
            other => Err(format!("unknown host status '{}'", other)),
        }
    }
}

/// A provisioned machine, keyed by its address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Primary key, usually an IP address
    pub address: String,

    #[serde(default)]
    pub status: HostStatus,

    /// Operating system reported by fact gathering
    #[serde(default)]
    pub os: String,

    #[serde(default = "default_cpus")]
    pub cpus: i64,

    /// Memory in bytes
    #[serde(default)]
    pub memory: i64,

    /// Disk space in bytes
    #[serde(default)]
    pub space: i64,

    /// Last time the host was checked, empty if never
    #[serde(default)]
    pub last_check: String,

    /// Base64 encoded private key used for remote operations
    #[serde(default)]
    pub ssh_priv_key: String,

    #[serde(default = "default_remote_user")]
    pub remote_user: String,
}

fn default_cpus() -> i64 {
    UNKNOWN_CPUS
}

fn default_remote_user() -> String {
    DEFAULT_REMOTE_USER.to_string()
}

static HOST_SCHEMA: Schema = Schema {
    kind: RecordKind::Host,
    fields: &[
        FieldSpec::required("address", FieldType::String)
            .with(&[Constraint::NonEmpty, Constraint::Argument]),
        FieldSpec::required("status", FieldType::String)
            .with(&[Constraint::OneOf(HostStatus::NAMES)]),
        FieldSpec::required("os", FieldType::String),
        FieldSpec::required("cpus", FieldType::Integer).with(&[Constraint::Min(UNKNOWN_CPUS)]),
        FieldSpec::required("memory", FieldType::Integer).with(&[Constraint::Min(0)]),
        FieldSpec::required("space", FieldType::Integer).with(&[Constraint::Min(0)]),
        FieldSpec::required("last_check", FieldType::String).with(&[Constraint::Timestamp]),
        FieldSpec::required("ssh_priv_key", FieldType::String),
        FieldSpec::required("remote_user", FieldType::String)
            .with(&[Constraint::NonEmpty, Constraint::Argument]),
    ],
};

impl Host {
    /// A new host in `investigating` with no facts gathered yet
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            status: HostStatus::Investigating,
            os: String::new(),
            cpus: UNKNOWN_CPUS,
            memory: 0,
            space: 0,
            last_check: String::new(),
            ssh_priv_key: String::new(),
            remote_user: default_remote_user(),
        }
    }

    pub fn with_ssh_key(mut self, ssh_priv_key: impl Into<String>) -> Self {
        self.ssh_priv_key = ssh_priv_key.into();
        self
    }

    pub fn with_remote_user(mut self, remote_user: impl Into<String>) -> Self {
        self.remote_user = remote_user.into();
        self
    }

    pub fn with_status(mut self, status: HostStatus) -> Self {
        self.status = status;
        self
    }

    /// Merge gathered facts (`os`, `cpus`, `memory`, `space`) into the host.
    ///
    /// Numeric facts are accepted as numbers or numeric strings; anything
    /// else leaves the current value untouched.
    pub fn apply_facts(&mut self, facts: &Map<String, Value>) {
        if let Some(os) = facts.get("os").and_then(Value::as_str) {
            self.os = os.to_string();
        }
        if let Some(cpus) = facts.get("cpus").and_then(fact_as_i64) {
            self.cpus = cpus;
        }
        if let Some(memory) = facts.get("memory").and_then(fact_as_i64) {
            self.memory = memory;
        }
        if let Some(space) = facts.get("space").and_then(fact_as_i64) {
            self.space = space;
        }
    }

    /// Parsed `last_check`, if set and valid
    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.last_check)
    }

    pub fn stamp(&mut self, at: DateTime<Utc>) {
        self.last_check = format_timestamp(at);
    }

    /// Credentials view (`ssh_priv_key`, `remote_user`)
    pub fn credentials(&self) -> Value {
        let remote_user = if self.remote_user.is_empty() {
            DEFAULT_REMOTE_USER
        } else {
            &self.remote_user
        };
        serde_json::json!({
            "ssh_priv_key": self.ssh_priv_key,
            "remote_user": remote_user,
        })
    }
}

fn fact_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl Record for Host {
    const KIND: RecordKind = RecordKind::Host;

    fn primary_key(&self) -> String {
        self.address.clone()
    }

    fn schema() -> &'static Schema {
        &HOST_SCHEMA
    }

    fn hidden_fields() -> &'static [&'static str] {
        &["ssh_priv_key", "remote_user"]
    }
}
