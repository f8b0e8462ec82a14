//! Kubernetes annotation backend
//!
//! Hosts live as `hostkeeper.io/<field>` annotations on the Kubernetes node
//! named after the host address. The private key is kept out of the
//! annotations and stored in an opaque secret instead. Annotations are
//! strings only, so every read goes through [`Schema::coerce`]; a node
//! without our annotations, or with values that do not coerce, reads as
//! not found.
//!
//! Only host records can be stored here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::Regex;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::{HandlerFactory, StoreError, StoreHandler};
use crate::model::{RecordKind, Schema};

const ANNOTATION_PREFIX: &str = "hostkeeper.io/";
const SECRET_FIELD: &str = "ssh_priv_key";
const SECRET_NAMESPACE: &str = "default";

/// Connection settings for the Kubernetes API server used as a store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KubeStoreConfig {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl KubeStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl HandlerFactory for KubeStoreConfig {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn connect(&self) -> Result<Arc<dyn StoreHandler>, StoreError> {
        Ok(Arc::new(KubeStoreHandler::new(self.clone())?))
    }
}

pub struct KubeStoreHandler {
    config: KubeStoreConfig,
    http_client: Client,
    annotation_pattern: Regex,
}

impl KubeStoreHandler {
    pub fn new(config: KubeStoreConfig) -> Result<Self, StoreError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let annotation_pattern = annotation_pattern()?;
        Ok(Self {
            config,
            http_client,
            annotation_pattern,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.config.url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_node(&self, address: &str) -> Result<Option<Value>, StoreError> {
        let url = self.api(&format!("/nodes/{}", address));
        let response = self.authorize(self.http_client.get(&url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(StoreError::Backend(format!(
                "GET node {} returned {}",
                address, status
            ))),
        }
    }

    async fn patch_annotations(
        &self,
        address: &str,
        annotations: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let url = self.api(&format!("/nodes/{}", address));
        let response = self
            .authorize(self.http_client.patch(&url))
            .header("Content-Type", "application/merge-patch+json")
            .json(&json!({ "metadata": { "annotations": annotations } }))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(StoreError::Backend(format!(
                "node {} is not registered with kubernetes",
                address
            ))),
            status => Err(StoreError::Backend(format!(
                "PATCH node {} returned {}",
                address, status
            ))),
        }
    }

    async fn load_secret(&self, address: &str) -> Result<Option<String>, StoreError> {
        let url = self.api(&secret_path(Some(address)));
        let response = self.authorize(self.http_client.get(&url)).send().await?;
        if !response.status().is_success() {
            debug!("No key secret for {} ({})", address, response.status());
            return Ok(None);
        }
        let body: Value = response.json().await?;
        let Some(encoded) = body
            .get("data")
            .and_then(|d| d.get(SECRET_FIELD))
            .and_then(Value::as_str)
        else {
            return Ok(None);
        };
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| StoreError::Backend(format!("secret for {} is not base64: {}", address, e)))?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| StoreError::Backend(format!("secret for {} is not text: {}", address, e)))
    }

    async fn store_secret(&self, address: &str, key: &str) -> Result<(), StoreError> {
        let secret = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "type": "Opaque",
            "metadata": { "name": secret_name(address) },
            "data": { SECRET_FIELD: STANDARD.encode(key) },
        });
        let response = self
            .authorize(self.http_client.post(self.api(&secret_path(None))))
            .json(&secret)
            .send()
            .await?;
        let status = match response.status() {
            StatusCode::CONFLICT => {
                self.authorize(self.http_client.put(self.api(&secret_path(Some(address)))))
                    .json(&secret)
                    .send()
                    .await?
                    .status()
            }
            status => status,
        };
        if status.is_success() {
            Ok(())
        } else {
            Err(StoreError::Backend(format!(
                "saving key secret for {} returned {}",
                address, status
            )))
        }
    }

    async fn delete_secret(&self, address: &str) -> Result<(), StoreError> {
        let url = self.api(&secret_path(Some(address)));
        let response = self.authorize(self.http_client.delete(&url)).send().await?;
        match response.status() {
            status if status.is_success() || status == StatusCode::NOT_FOUND => Ok(()),
            status => Err(StoreError::Backend(format!(
                "deleting key secret for {} returned {}",
                address, status
            ))),
        }
    }

    /// Turn a node object into a typed host value, if it carries our annotations
    async fn host_from_node(&self, address: &str, node: &Value) -> Result<Value, StoreError> {
        let schema = RecordKind::Host.schema();
        let mut raw = read_annotations(&self.annotation_pattern, node);
        if raw.is_empty() {
            return Err(StoreError::not_found(RecordKind::Host, address));
        }
        raw.entry("address".to_string())
            .or_insert_with(|| address.to_string());
        if let Some(key) = self.load_secret(address).await? {
            raw.insert(SECRET_FIELD.to_string(), key);
        }
        coerce_or_not_found(schema, address, &raw)
    }
}

fn ensure_host(kind: RecordKind) -> Result<(), StoreError> {
    if kind == RecordKind::Host {
        Ok(())
    } else {
        Err(StoreError::Backend(format!(
            "kubernetes store cannot hold {} records",
            kind
        )))
    }
}

// ============================================================================
// SBIO: Pure annotation mapping
// ============================================================================

fn annotation_pattern() -> Result<Regex, StoreError> {
    Regex::new(r"^hostkeeper\.io/([a-z_]+)$")
        .map_err(|e| StoreError::Backend(format!("annotation pattern: {}", e)))
}

/// Our fields out of a node's annotations
pub fn read_annotations(pattern: &Regex, node: &Value) -> HashMap<String, String> {
    node.pointer("/metadata/annotations")
        .and_then(Value::as_object)
        .map(|annotations| {
            annotations
                .iter()
                .filter_map(|(name, value)| {
                    let field = pattern.captures(name)?.get(1)?.as_str().to_string();
                    Some((field, value.as_str()?.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Annotation patch for a flattened host. The key is never included.
pub fn write_annotations(flat: &HashMap<String, String>) -> Map<String, Value> {
    flat.iter()
        .filter(|(field, value)| field.as_str() != SECRET_FIELD && !value.is_empty())
        .map(|(field, value)| {
            (
                format!("{}{}", ANNOTATION_PREFIX, field),
                Value::String(value.clone()),
            )
        })
        .collect()
}

/// Secret name derived from an address; only DNS-label characters survive
pub fn secret_name(address: &str) -> String {
    let cleaned: String = address
        .to_ascii_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '-' => c,
            _ => '-',
        })
        .collect();
    format!("hostkeeper-host-{}", cleaned)
}

fn secret_path(address: Option<&str>) -> String {
    match address {
        Some(address) => format!(
            "/namespaces/{}/secrets/{}",
            SECRET_NAMESPACE,
            secret_name(address)
        ),
        None => format!("/namespaces/{}/secrets", SECRET_NAMESPACE),
    }
}

fn coerce_or_not_found(
    schema: &Schema,
    address: &str,
    raw: &HashMap<String, String>,
) -> Result<Value, StoreError> {
    schema.coerce(raw).map_err(|e| {
        debug!("Annotations on {} do not coerce: {}", address, e);
        StoreError::not_found(RecordKind::Host, address)
    })
}

#[async_trait]
impl StoreHandler for KubeStoreHandler {
    async fn get(&self, kind: RecordKind, key: &str) -> Result<Value, StoreError> {
        ensure_host(kind)?;
        let node = self
            .get_node(key)
            .await?
            .ok_or_else(|| StoreError::not_found(kind, key))?;
        self.host_from_node(key, &node).await
    }

    async fn save(&self, kind: RecordKind, key: &str, value: Value) -> Result<Value, StoreError> {
        ensure_host(kind)?;
        let flat = kind.schema().flatten(&value);
        if let Some(ssh_key) = flat.get(SECRET_FIELD).filter(|k| !k.is_empty()) {
            self.store_secret(key, ssh_key).await?;
        }
        self.patch_annotations(key, write_annotations(&flat)).await?;
        Ok(value)
    }

    async fn delete(&self, kind: RecordKind, key: &str) -> Result<(), StoreError> {
        ensure_host(kind)?;
        let node = self
            .get_node(key)
            .await?
            .ok_or_else(|| StoreError::not_found(kind, key))?;
        let existing = read_annotations(&self.annotation_pattern, &node);
        if existing.is_empty() {
            return Err(StoreError::not_found(kind, key));
        }
        let removal = existing
            .keys()
            .map(|field| (format!("{}{}", ANNOTATION_PREFIX, field), Value::Null))
            .collect();
        self.delete_secret(key).await?;
        self.patch_annotations(key, removal).await
    }

    async fn list(&self, kind: RecordKind) -> Result<Vec<Value>, StoreError> {
        ensure_host(kind)?;
        let url = self.api("/nodes");
        let response = self.authorize(self.http_client.get(&url)).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Backend(format!(
                "listing nodes returned {}",
                response.status()
            )));
        }
        let body: Value = response.json().await?;
        let mut hosts = Vec::new();
        for node in body.get("items").and_then(Value::as_array).into_iter().flatten() {
            let Some(address) = node.pointer("/metadata/name").and_then(Value::as_str) else {
                continue;
            };
            match self.host_from_node(address, node).await {
                Ok(host) => hosts.push(host),
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => warn!("Skipping node {}: {}", address, e),
            }
        }
        Ok(hosts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let url = format!("{}/healthz", self.config.url.trim_end_matches('/'));
        let response = self.authorize(self.http_client.get(&url)).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Backend(format!(
                "kubernetes health returned {}",
                response.status()
            )))
        }
    }
}
