//! etcd backend over the v3 JSON gateway
//!
//! Records are stored as JSON documents under `<prefix>/<kind>/<key>`.
//! Keys and values travel base64 encoded, as the gateway requires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::trace;

use super::{HandlerFactory, StoreError, StoreHandler};
use crate::model::RecordKind;

/// Connection settings for an etcd cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EtcdConfig {
    /// Gateway endpoint, e.g. `http://127.0.0.1:2379`
    pub endpoint: String,

    /// Key prefix shared by every record
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_prefix() -> String {
    "/hostkeeper".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl EtcdConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            prefix: default_prefix(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl HandlerFactory for EtcdConfig {
    fn name(&self) -> &'static str {
        "etcd"
    }

    fn connect(&self) -> Result<Arc<dyn StoreHandler>, StoreError> {
        Ok(Arc::new(EtcdHandler::new(self.clone())?))
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.endpoint.clone())
    }
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    #[serde(default)]
    deleted: Option<String>,
}

pub struct EtcdHandler {
    config: EtcdConfig,
    http_client: Client,
}

impl EtcdHandler {
    pub fn new(config: EtcdConfig) -> Result<Self, StoreError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: Value,
    ) -> Result<T, StoreError> {
        let url = format!("{}{}", self.config.endpoint.trim_end_matches('/'), path);
        trace!("etcd POST {}", url);
        let response = self.http_client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!(
                "etcd {} returned {}: {}",
                path, status, message
            )));
        }
        Ok(response.json().await?)
    }
}

// ============================================================================
// SBIO: Pure key/value encoding
// ============================================================================

/// Full etcd key of a record
pub fn record_key(prefix: &str, kind: RecordKind, key: &str) -> String {
    format!("{}/{}", kind_prefix(prefix, kind), key)
}

/// Directory-like prefix holding every record of a kind, with trailing slash
pub fn kind_prefix(prefix: &str, kind: RecordKind) -> String {
    format!("{}/{}/", prefix.trim_end_matches('/'), kind)
}

/// The first key after every key starting with `prefix`
pub fn range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // every byte was 0xff: "\0" means "to the end of the keyspace"
    vec![0]
}

fn decode_value(kv: &KeyValue) -> Result<Value, StoreError> {
    let bytes = STANDARD
        .decode(&kv.value)
        .map_err(|e| StoreError::Backend(format!("etcd value is not base64: {}", e)))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl StoreHandler for EtcdHandler {
    async fn get(&self, kind: RecordKind, key: &str) -> Result<Value, StoreError> {
        let full = record_key(&self.config.prefix, kind, key);
        let response: RangeResponse = self
            .call("/v3/kv/range", json!({ "key": STANDARD.encode(&full) }))
            .await?;
        match response.kvs.first() {
            Some(kv) => decode_value(kv),
            None => Err(StoreError::not_found(kind, key)),
        }
    }

    async fn save(&self, kind: RecordKind, key: &str, value: Value) -> Result<Value, StoreError> {
        let full = record_key(&self.config.prefix, kind, key);
        let body = serde_json::to_vec(&value)?;
        let _: Value = self
            .call(
                "/v3/kv/put",
                json!({
                    "key": STANDARD.encode(&full),
                    "value": STANDARD.encode(body),
                }),
            )
            .await?;
        Ok(value)
    }

    async fn delete(&self, kind: RecordKind, key: &str) -> Result<(), StoreError> {
        let full = record_key(&self.config.prefix, kind, key);
        let response: DeleteResponse = self
            .call("/v3/kv/deleterange", json!({ "key": STANDARD.encode(&full) }))
            .await?;
        match response.deleted.as_deref() {
            Some("0") | None => Err(StoreError::not_found(kind, key)),
            Some(_) => Ok(()),
        }
    }

    async fn list(&self, kind: RecordKind) -> Result<Vec<Value>, StoreError> {
        let prefix = kind_prefix(&self.config.prefix, kind);
        let response: RangeResponse = self
            .call(
                "/v3/kv/range",
                json!({
                    "key": STANDARD.encode(&prefix),
                    "range_end": STANDARD.encode(range_end(&prefix)),
                }),
            )
            .await?;
        response.kvs.iter().map(decode_value).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: Value = self.call("/v3/maintenance/status", json!({})).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_layout() {
        assert_eq!(
            record_key("/hostkeeper", RecordKind::Host, "10.2.0.2"),
            "/hostkeeper/host/10.2.0.2"
        );
        assert_eq!(
            record_key("/hostkeeper/", RecordKind::ClusterOperation, "upgrade/a"),
            "/hostkeeper/cluster_operation/upgrade/a"
        );
    }

    #[test]
    fn test_range_end() {
        assert_eq!(range_end("/hostkeeper/host/"), b"/hostkeeper/host0".to_vec());
        assert_eq!(range_end("a\u{7f}"), b"a\x80".to_vec());
        assert_eq!(range_end(""), vec![0]);
    }

    #[test]
    fn test_decode_value() {
        let kv = KeyValue {
            value: STANDARD.encode(br#"{"address":"a"}"#),
        };
        assert_eq!(decode_value(&kv).unwrap()["address"], "a");

        let bad = KeyValue {
            value: "***".to_string(),
        };
        assert!(matches!(decode_value(&bad), Err(StoreError::Backend(_))));
    }

    #[test]
    fn test_config_defaults() {
        let config: EtcdConfig = serde_yaml::from_str("endpoint: http://127.0.0.1:2379").unwrap();
        assert_eq!(config.prefix, "/hostkeeper");
        assert_eq!(config, EtcdConfig::new("http://127.0.0.1:2379"));
    }
}
