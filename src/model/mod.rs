//! Records persisted by the store
//!
//! Every record kind is a plain struct carrying typed fields. The store only
//! ever sees records through the [`Record`] trait, which gives it the record
//! kind (used to route to a backend), the primary key and the schema used to
//! validate a record before it is written.

pub mod cluster;
pub mod host;
pub mod network;
pub mod operation;
pub mod schema;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use cluster::{Cluster, ClusterType, HostCounts};
pub use host::{Host, HostStatus, DEFAULT_REMOTE_USER};
pub use network::{Network, NetworkType, DEFAULT_NETWORK};
pub use operation::{ClusterCommand, ClusterOperation, OperationStatus};
pub use schema::{CoercionError, Schema, ValidationError, Violation};

/// The closed set of record kinds the store knows how to route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Host,
    Cluster,
    ClusterOperation,
    Network,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        RecordKind::Host,
        RecordKind::Cluster,
        RecordKind::ClusterOperation,
        RecordKind::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Host => "host",
            RecordKind::Cluster => "cluster",
            RecordKind::ClusterOperation => "cluster_operation",
            RecordKind::Network => "network",
        }
    }

    /// Schema of the record type behind this kind
    pub fn schema(&self) -> &'static Schema {
        match self {
            RecordKind::Host => Host::schema(),
            RecordKind::Cluster => Cluster::schema(),
            RecordKind::ClusterOperation => ClusterOperation::schema(),
            RecordKind::Network => Network::schema(),
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" | "hosts" => Ok(RecordKind::Host),
            "cluster" | "clusters" => Ok(RecordKind::Cluster),
            "cluster_operation" | "cluster_operations" => Ok(RecordKind::ClusterOperation),
            "network" | "networks" => Ok(RecordKind::Network),
            other => Err(format!("unknown record kind '{}'", other)),
        }
    }
}

/// A typed record that can be stored, validated and rendered
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind used to pick the backend handler
    const KIND: RecordKind;

    /// Globally unique key of this record within its kind
    fn primary_key(&self) -> String;

    /// Field schema checked on every save
    fn schema() -> &'static Schema;

    /// Fields left out of the default (non-secure) rendering
    fn hidden_fields() -> &'static [&'static str] {
        &[]
    }

    /// Render as JSON, dropping hidden fields unless `secure` is set
    fn to_json(&self, secure: bool) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if !secure {
            if let Value::Object(map) = &mut value {
                for field in Self::hidden_fields() {
                    map.remove(*field);
                }
            }
        }
        value
    }
}

// ============================================================================
// Timestamps
// ============================================================================

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Format a timestamp the way `last_check` is persisted (naive UTC, ISO-8601)
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a persisted timestamp. Accepts the naive form written by
/// [`format_timestamp`] (with or without fractional seconds) and RFC 3339.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_roundtrip() {
        let at = Utc.with_ymd_and_hms(2015, 12, 17, 15, 48, 18).unwrap();
        let formatted = format_timestamp(at);
        assert_eq!(formatted, "2015-12-17T15:48:18.000000");
        assert_eq!(parse_timestamp(&formatted), Some(at));
    }

    #[test]
    fn test_parse_timestamp_variants() {
        assert!(parse_timestamp("2015-12-17T15:48:18.710454").is_some());
        assert!(parse_timestamp("2015-12-17T15:48:18").is_some());
        assert!(parse_timestamp("2015-12-17T15:48:18Z").is_some());
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_record_kind_parse() {
        assert_eq!("hosts".parse::<RecordKind>().unwrap(), RecordKind::Host);
        assert_eq!(
            "cluster_operation".parse::<RecordKind>().unwrap(),
            RecordKind::ClusterOperation
        );
        assert!("network".parse::<RecordKind>().is_err());
    }
}
