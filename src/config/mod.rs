//! Service configuration
//!
//! A YAML file, every section optional:
//!
//! ```yaml
//! listen:
//!   interface: 0.0.0.0
//!   port: 8000
//! stores:
//!   - backend: etcd
//!     endpoint: http://127.0.0.1:2379
//!     models: [cluster, cluster_operation, network]
//!   - backend: kubernetes
//!     url: https://10.0.0.1:6443
//!     token: secret
//!     models: [host]
//! container_managers:
//!   - type: kubernetes
//!     url: https://10.0.0.1:6443
//! investigator:
//!   registration_attempts: 3
//!   registration_delay_secs: 5
//! watcher:
//!   delta_secs: 20
//!   throttle_secs: 60
//! transport:
//!   ssh_binary: ssh
//!   connect_timeout_secs: 10
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::containermgr::{
    KubeContainerManagerConfig, RegistrationPolicy, REGISTRATION_ATTEMPTS,
    REGISTRATION_DELAY_SECS,
};
use crate::model::{ClusterType, RecordKind};
use crate::store::{EtcdConfig, HandlerFactory, KubeStoreConfig, MemoryStore, StoreManager};
use crate::transport::SshTransportConfig;
use crate::watcher::{WatcherConfig, DEFAULT_DELTA_SECS, DEFAULT_THROTTLE_SECS};

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 8000;

/// Default config file location: ~/.hostkeeper/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hostkeeper")
        .join("config.yaml")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenConfig {
    #[serde(default = "default_interface")]
    pub interface: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Etcd,
    Kubernetes,
}

/// One backend and the record kinds it serves
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: Backend,

    #[serde(default = "all_models")]
    pub models: Vec<RecordKind>,

    /// etcd gateway endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// etcd key prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Kubernetes API server URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Kubernetes bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn all_models() -> Vec<RecordKind> {
    RecordKind::ALL.to_vec()
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory,
            models: all_models(),
            endpoint: None,
            prefix: None,
            url: None,
            token: None,
            timeout_secs: None,
        }
    }

    /// Build the handler factory for this backend
    pub fn factory(&self) -> Result<Arc<dyn HandlerFactory>, ConfigError> {
        match self.backend {
            Backend::Memory => Ok(Arc::new(MemoryStore::new())),
            Backend::Etcd => {
                let endpoint = self.endpoint.as_deref().ok_or_else(|| {
                    ConfigError::Invalid("etcd store requires an endpoint".to_string())
                })?;
                let mut config = EtcdConfig::new(endpoint);
                if let Some(prefix) = &self.prefix {
                    config.prefix = prefix.clone();
                }
                if let Some(timeout) = self.timeout_secs {
                    config.timeout_secs = timeout;
                }
                Ok(Arc::new(config))
            }
            Backend::Kubernetes => {
                let url = self.url.as_deref().ok_or_else(|| {
                    ConfigError::Invalid("kubernetes store requires a url".to_string())
                })?;
                let mut config = KubeStoreConfig::new(url);
                config.token = self.token.clone();
                if let Some(timeout) = self.timeout_secs {
                    config.timeout_secs = timeout;
                }
                Ok(Arc::new(config))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerManagerConfig {
    #[serde(rename = "type", default)]
    pub cluster_type: ClusterType,

    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ContainerManagerConfig {
    pub fn kubernetes(&self) -> KubeContainerManagerConfig {
        let config = KubeContainerManagerConfig::new(&self.url);
        match &self.token {
            Some(token) => config.with_token(token),
            None => config,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvestigatorConfig {
    #[serde(default = "default_registration_attempts")]
    pub registration_attempts: u32,

    #[serde(default = "default_registration_delay_secs")]
    pub registration_delay_secs: u64,
}

fn default_registration_attempts() -> u32 {
    REGISTRATION_ATTEMPTS
}

fn default_registration_delay_secs() -> u64 {
    REGISTRATION_DELAY_SECS
}

impl Default for InvestigatorConfig {
    fn default() -> Self {
        Self {
            registration_attempts: default_registration_attempts(),
            registration_delay_secs: default_registration_delay_secs(),
        }
    }
}

impl InvestigatorConfig {
    pub fn registration_policy(&self) -> RegistrationPolicy {
        RegistrationPolicy::new(
            self.registration_attempts,
            Duration::from_secs(self.registration_delay_secs),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatcherSettings {
    #[serde(default = "default_delta_secs")]
    pub delta_secs: u64,

    #[serde(default = "default_throttle_secs")]
    pub throttle_secs: u64,
}

fn default_delta_secs() -> u64 {
    DEFAULT_DELTA_SECS
}

fn default_throttle_secs() -> u64 {
    DEFAULT_THROTTLE_SECS
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            delta_secs: default_delta_secs(),
            throttle_secs: default_throttle_secs(),
        }
    }
}

impl WatcherSettings {
    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig::default()
            .with_delta(Duration::from_secs(self.delta_secs))
            .with_throttle(Duration::from_secs(self.throttle_secs))
    }
}

/// The complete configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,

    /// Empty means a single in-memory backend for every record kind
    #[serde(default)]
    pub stores: Vec<StoreConfig>,

    #[serde(default)]
    pub container_managers: Vec<ContainerManagerConfig>,

    #[serde(default)]
    pub investigator: InvestigatorConfig,

    #[serde(default)]
    pub watcher: WatcherSettings,

    #[serde(default)]
    pub transport: SshTransportConfig,
}

impl Config {
    /// Address the HTTP API binds to
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.listen.interface, self.listen.port)
            .parse()
            .map_err(|e| {
                ConfigError::Invalid(format!(
                    "listen address {}:{}: {}",
                    self.listen.interface, self.listen.port, e
                ))
            })
    }

    /// Build a store manager with every configured backend and container
    /// manager registered
    pub fn build_store(&self) -> Result<StoreManager, ConfigError> {
        let mut store = StoreManager::new();
        if self.stores.is_empty() {
            let memory = StoreConfig::memory();
            store.register_handler(memory.factory()?, &memory.models);
        }
        for config in &self.stores {
            store.register_handler(config.factory()?, &config.models);
        }
        for manager in &self.container_managers {
            store.register_container_manager(Arc::new(manager.kubernetes()));
        }
        Ok(store)
    }
}

// ============================================================================
// SBIO: Pure parsing and validation
// ============================================================================

/// Parse and validate configuration text
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Check the parts of a config that serde cannot
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    for store in &config.stores {
        if store.models.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{:?} store serves no models",
                store.backend
            )));
        }
        if store.backend == Backend::Kubernetes
            && store.models.iter().any(|kind| *kind != RecordKind::Host)
        {
            return Err(ConfigError::Invalid(
                "kubernetes store can only hold the host model".to_string(),
            ));
        }
        // Surfaces missing backend fields
        store.factory()?;
    }

    for kind in RecordKind::ALL {
        if !config.stores.is_empty() && !config.stores.iter().any(|s| s.models.contains(&kind)) {
            return Err(ConfigError::Invalid(format!(
                "no store configured for {}",
                kind
            )));
        }
    }

    for manager in &config.container_managers {
        if !manager.cluster_type.requires_container_manager() {
            return Err(ConfigError::Invalid(format!(
                "{} clusters have no container manager",
                manager.cluster_type
            )));
        }
    }

    if config.investigator.registration_attempts == 0 {
        return Err(ConfigError::Invalid(
            "registration_attempts must be at least 1".to_string(),
        ));
    }
    config.listen_addr()?;
    Ok(())
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and parse a config file. `~` in the path is expanded.
pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
    let path = PathBuf::from(expanded);
    let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen.port, 8000);
        assert_eq!(config.listen_addr().unwrap().to_string(), "0.0.0.0:8000");
        assert_eq!(config.watcher.delta_secs, 20);
        assert_eq!(config.watcher.throttle_secs, 60);
        assert_eq!(config.investigator.registration_attempts, 3);
        assert_eq!(config.transport.ssh_binary, "ssh");
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse_config(
            r#"
listen:
  interface: 127.0.0.1
  port: 9000
stores:
  - backend: etcd
    endpoint: http://127.0.0.1:2379
    models: [cluster, cluster_operation, network]
  - backend: kubernetes
    url: https://10.0.0.1:6443
    token: abc
    models: [host]
container_managers:
  - type: kubernetes
    url: https://10.0.0.1:6443
investigator:
  registration_delay_secs: 1
watcher:
  delta_secs: 30
"#,
        )
        .unwrap();

        assert_eq!(config.listen_addr().unwrap().to_string(), "127.0.0.1:9000");
        assert_eq!(config.stores.len(), 2);
        assert_eq!(config.stores[1].models, vec![RecordKind::Host]);
        assert_eq!(config.container_managers[0].cluster_type, ClusterType::Kubernetes);
        assert_eq!(config.investigator.registration_attempts, 3);
        assert_eq!(
            config.investigator.registration_policy().delay,
            Duration::from_secs(1)
        );
        assert_eq!(config.watcher.watcher_config().delta, Duration::from_secs(30));
        assert_eq!(config.watcher.throttle_secs, 60);
    }

    #[test]
    fn test_kubernetes_store_only_holds_hosts() {
        let err = parse_config(
            "stores:\n  - backend: kubernetes\n    url: https://k8s:6443\n    models: [host, cluster]\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_every_kind_needs_a_store() {
        let err = parse_config(
            "stores:\n  - backend: etcd\n    endpoint: http://e:2379\n    models: [host]\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("no store configured for cluster"));
    }

    #[test]
    fn test_etcd_requires_endpoint() {
        let err = parse_config("stores:\n  - backend: etcd\n").unwrap_err();
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn test_host_only_container_manager_rejected() {
        let err = parse_config("container_managers:\n  - type: host_only\n    url: http://x\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_backend_is_parse_error() {
        let err = parse_config("stores:\n  - backend: redis\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[tokio::test]
    async fn test_build_store_defaults_to_memory() {
        let store = parse_config("").unwrap().build_store().unwrap();
        store
            .save(&crate::model::Host::new("10.2.0.2"))
            .await
            .unwrap();
        assert!(store.check_backends().await.is_ok());
        assert!(store
            .list_container_managers(ClusterType::Kubernetes)
            .is_empty());
    }

    #[test]
    fn test_build_store_registers_container_managers() {
        let config = parse_config("container_managers:\n  - url: https://k8s:6443\n").unwrap();
        let store = config.build_store().unwrap();
        let managers = store.list_container_managers(ClusterType::Kubernetes);
        assert_eq!(managers.len(), 1);
        assert_eq!(managers[0].endpoint(), "https://k8s:6443");
    }

    #[test]
    fn test_load_config_file() {
        let file = create_temp_file("listen:\n  port: 8123\n");
        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.listen.port, 8123);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_config_file(Path::new("/nonexistent/config.yaml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with(".hostkeeper/config.yaml"));
    }
}
