//! Network record - the overlay network a cluster's hosts are configured for

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::schema::{Constraint, FieldSpec, FieldType, Schema};
use super::{Record, RecordKind};

/// Name of the network used by clusters that do not name one
pub const DEFAULT_NETWORK: &str = "default";

/// How flannel on a bootstrapped host finds its configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// flanneld talks to a flannel server at `options.address`
    #[default]
    FlannelServer,
    /// flanneld reads its config from the etcd store backend
    FlannelEtcd,
}

impl NetworkType {
    pub const NAMES: &'static [&'static str] = &["flannel_server", "flannel_etcd"];

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::FlannelServer => "flannel_server",
            NetworkType::FlannelEtcd => "flannel_etcd",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flannel_server" => Ok(NetworkType::FlannelServer),
            "flannel_etcd" => Ok(NetworkType::FlannelEtcd),
            other => Err(format!("unknown network type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,

    #[serde(rename = "type", default)]
    pub network_type: NetworkType,

    /// Type specific settings, e.g. `address` of a flannel server
    #[serde(default)]
    pub options: Map<String, Value>,
}

static NETWORK_SCHEMA: Schema = Schema {
    kind: RecordKind::Network,
    fields: &[
        FieldSpec::required("name", FieldType::String).with(&[Constraint::NonEmpty]),
        FieldSpec::required("type", FieldType::String)
            .with(&[Constraint::OneOf(NetworkType::NAMES)]),
        FieldSpec::required("options", FieldType::Object),
    ],
};

impl Network {
    pub fn new(name: impl Into<String>, network_type: NetworkType) -> Self {
        Self {
            name: name.into(),
            network_type,
            options: Map::new(),
        }
    }

    /// The network assumed when a cluster's network is not stored
    pub fn default_network() -> Self {
        Self::new(DEFAULT_NETWORK, NetworkType::default())
    }

    pub fn with_options(mut self, options: Map<String, Value>) -> Self {
        self.options = options;
        self
    }

    /// `options.address` of a flannel server network
    pub fn server_address(&self) -> Option<&str> {
        match self.network_type {
            NetworkType::FlannelServer => self.options.get("address").and_then(Value::as_str),
            NetworkType::FlannelEtcd => None,
        }
    }
}

impl Record for Network {
    const KIND: RecordKind = RecordKind::Network;

    fn primary_key(&self) -> String {
        self.name.clone()
    }

    fn schema() -> &'static Schema {
        &NETWORK_SCHEMA
    }
}
