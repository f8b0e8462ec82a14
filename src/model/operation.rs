//! Cluster-wide operation record (restart, upgrade, deploy)

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::schema::{Constraint, FieldSpec, FieldType, Schema};
use super::{format_timestamp, Record, RecordKind};

/// Command run across every host of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterCommand {
    Restart,
    Upgrade,
    Deploy,
}

impl ClusterCommand {
    pub const NAMES: &'static [&'static str] = &["restart", "upgrade", "deploy"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterCommand::Restart => "restart",
            ClusterCommand::Upgrade => "upgrade",
            ClusterCommand::Deploy => "deploy",
        }
    }
}

impl fmt::Display for ClusterCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restart" => Ok(ClusterCommand::Restart),
            "upgrade" => Ok(ClusterCommand::Upgrade),
            "deploy" => Ok(ClusterCommand::Deploy),
            other => Err(format!("unknown cluster command '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    InProcess,
    Finished,
    Failed,
}

impl OperationStatus {
    pub const NAMES: &'static [&'static str] = &["in_process", "finished", "failed"];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::InProcess => "in_process",
            OperationStatus::Finished => "finished",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::InProcess)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one command across a cluster, keyed by `(command, name)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterOperation {
    /// Cluster name
    pub name: String,

    pub command: ClusterCommand,

    #[serde(default)]
    pub status: OperationStatus,

    /// Target version, deploy only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Addresses still being worked on
    #[serde(default)]
    pub in_process: Vec<String>,

    /// Addresses done
    #[serde(default)]
    pub finished: Vec<String>,

    #[serde(default)]
    pub started_at: String,

    #[serde(default)]
    pub finished_at: String,
}

static OPERATION_SCHEMA: Schema = Schema {
    kind: RecordKind::ClusterOperation,
    fields: &[
        FieldSpec::required("name", FieldType::String).with(&[Constraint::NonEmpty]),
        FieldSpec::required("command", FieldType::String)
            .with(&[Constraint::OneOf(ClusterCommand::NAMES)]),
        FieldSpec::required("status", FieldType::String)
            .with(&[Constraint::OneOf(OperationStatus::NAMES)]),
        FieldSpec::optional("version", FieldType::String).with(&[Constraint::NonEmpty]),
        FieldSpec::required("in_process", FieldType::StringList),
        FieldSpec::required("finished", FieldType::StringList),
        FieldSpec::required("started_at", FieldType::String).with(&[Constraint::Timestamp]),
        FieldSpec::required("finished_at", FieldType::String).with(&[Constraint::Timestamp]),
    ],
};

impl ClusterOperation {
    /// A fresh `in_process` operation started at `now`
    pub fn start(
        name: impl Into<String>,
        command: ClusterCommand,
        version: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            status: OperationStatus::InProcess,
            version,
            in_process: Vec::new(),
            finished: Vec::new(),
            started_at: format_timestamp(now),
            finished_at: String::new(),
        }
    }

    /// Store key for a command on a cluster
    pub fn key_for(command: ClusterCommand, name: &str) -> String {
        format!("{}/{}", command, name)
    }

    /// Move `address` from `in_process` to `finished`
    pub fn mark_finished(&mut self, address: &str) {
        self.in_process.retain(|a| a != address);
        if !self.finished.iter().any(|a| a == address) {
            self.finished.push(address.to_string());
        }
    }

    pub fn complete(&mut self, status: OperationStatus, now: DateTime<Utc>) {
        self.status = status;
        self.finished_at = format_timestamp(now);
    }
}

impl Record for ClusterOperation {
    const KIND: RecordKind = RecordKind::ClusterOperation;

    fn primary_key(&self) -> String {
        Self::key_for(self.command, &self.name)
    }

    fn schema() -> &'static Schema {
        &OPERATION_SCHEMA
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_key_includes_command() {
        let op = ClusterOperation::start("honeynut", ClusterCommand::Upgrade, None, Utc::now());
        assert_eq!(op.primary_key(), "upgrade/honeynut");
    }

    #[test]
    fn test_progress_and_completion() {
        let mut op = ClusterOperation::start(
            "honeynut",
            ClusterCommand::Deploy,
            Some("7.2".to_string()),
            Utc::now(),
        );
        op.in_process = vec!["a".to_string(), "b".to_string()];
        op.mark_finished("a");
        op.mark_finished("a");
        assert_eq!(op.in_process, vec!["b".to_string()]);
        assert_eq!(op.finished, vec!["a".to_string()]);

        op.complete(OperationStatus::Finished, Utc::now());
        assert!(op.status.is_terminal());
        assert!(!op.finished_at.is_empty());

        let value = serde_json::to_value(&op).unwrap();
        assert!(ClusterOperation::schema().validate(&value).is_ok());
    }

    #[test]
    fn test_version_omitted_when_absent() {
        let op = ClusterOperation::start("x", ClusterCommand::Restart, None, Utc::now());
        let value = serde_json::to_value(&op).unwrap();
        assert!(value.get("version").is_none());
        assert!(ClusterOperation::schema().validate(&value).is_ok());
    }
}
