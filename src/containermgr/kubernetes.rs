//! Kubernetes container-manager client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{ContainerManager, ContainerManagerFactory, ContainerManagerError};
use crate::model::ClusterType;

/// Connection settings for a Kubernetes API server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KubeContainerManagerConfig {
    /// API server base URL, e.g. `https://10.0.0.1:6443`
    pub url: String,

    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl KubeContainerManagerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl ContainerManagerFactory for KubeContainerManagerConfig {
    fn cluster_type(&self) -> ClusterType {
        ClusterType::Kubernetes
    }

    fn connect(&self) -> Result<Arc<dyn ContainerManager>, ContainerManagerError> {
        Ok(Arc::new(KubeContainerManager::new(self.clone())?))
    }
}

/// Client backed by the Kubernetes node API
pub struct KubeContainerManager {
    config: KubeContainerManagerConfig,
    http_client: Client,
}

impl KubeContainerManager {
    pub fn new(config: KubeContainerManagerConfig) -> Result<Self, ContainerManagerError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    fn node_url(&self, address: &str) -> String {
        format!(
            "{}/api/v1/nodes/{}",
            self.config.url.trim_end_matches('/'),
            address
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ContainerManager for KubeContainerManager {
    fn name(&self) -> &str {
        "kubernetes"
    }

    fn endpoint(&self) -> &str {
        &self.config.url
    }

    async fn node_registered(&self, address: &str) -> bool {
        let request = self.authorize(self.http_client.get(self.node_url(address)));
        match request.send().await {
            Ok(response) => {
                debug!("Node {} lookup returned {}", address, response.status());
                response.status() == StatusCode::OK
            }
            Err(e) => {
                warn!("Node {} lookup failed: {}", address, e);
                false
            }
        }
    }

    async fn get_host_status(&self, address: &str, raw: bool) -> Result<(u16, Value), ContainerManagerError> {
        let request = self.authorize(self.http_client.get(self.node_url(address)));
        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let payload: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        if raw {
            return Ok((status, payload));
        }
        let summary = payload.get("status").cloned().unwrap_or_else(|| json!({}));
        Ok((status, summary))
    }
}
