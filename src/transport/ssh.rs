//! Transport that shells out to the system `ssh` client

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::oscmd::shell_quote;
use super::{FlannelBackend, OsCommands, RemoteTarget, Transport, TransportError, TransportResult};
use crate::model::{Cluster, ClusterType, Network, NetworkType, DEFAULT_NETWORK};
use crate::store::StoreManager;

/// Prints one `key=value` fact per line
const FACTS_SCRIPT: &str = concat!(
    ". /etc/os-release 2>/dev/null; ",
    "echo \"os=$ID\"; ",
    "echo \"cpus=$(nproc)\"; ",
    "echo \"memory=$(awk '/^MemTotal:/ {print $2 * 1024}' /proc/meminfo)\"; ",
    "echo \"space=$(df -B1 --output=size -x tmpfs -x devtmpfs 2>/dev/null | awk 'NR>1 {s+=$1} END {print s+0}')\"; ",
    "[ -e /run/ostree-booted ] && echo ostree=yes; ",
    "true"
);

/// OS families that report their base distribution when running as an image based host
const ATOMIC_BASES: &[&str] = &["fedora", "centos", "rhel"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshTransportConfig {
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Upper bound for any single remote command
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_command_timeout_secs() -> u64 {
    900
}

impl Default for SshTransportConfig {
    fn default() -> Self {
        Self {
            ssh_binary: default_ssh_binary(),
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

pub struct SshTransport {
    config: SshTransportConfig,
}

impl SshTransport {
    pub fn new(config: SshTransportConfig) -> Self {
        Self { config }
    }

    async fn run(
        &self,
        target: RemoteTarget<'_>,
        remote_command: &str,
    ) -> Result<(i32, String), TransportError> {
        let args = ssh_args(&self.config, target, remote_command);
        debug!("Running on {}: {}", target.address, remote_command);

        let child = Command::new(&self.config.ssh_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let secs = self.config.command_timeout_secs;
        let output = timeout(Duration::from_secs(secs), child)
            .await
            .map_err(|_| TransportError::Timeout {
                address: target.address.to_string(),
                secs,
            })??;

        let code = output.status.code().unwrap_or(-1);
        if code != 0 {
            warn!(
                "Command on {} exited with {}: {}",
                target.address,
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok((code, String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    async fn run_status(
        &self,
        target: RemoteTarget<'_>,
        remote_command: &str,
    ) -> Result<TransportResult, TransportError> {
        let (code, _) = self.run(target, remote_command).await?;
        Ok(TransportResult::exit(code))
    }
}

// ============================================================================
// SBIO: Pure argument building and output parsing
// ============================================================================

/// Arguments passed to the ssh client for one remote command
pub fn ssh_args(
    config: &SshTransportConfig,
    target: RemoteTarget<'_>,
    remote_command: &str,
) -> Vec<String> {
    vec![
        "-i".to_string(),
        target.key_path.display().to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", config.connect_timeout_secs),
        "-l".to_string(),
        target.remote_user.to_string(),
        "--".to_string(),
        target.address.to_string(),
        remote_command.to_string(),
    ]
}

/// Parse `key=value` fact lines. Numeric facts become integers; image based
/// hosts are reported as `atomic`.
pub fn parse_facts(stdout: &str) -> Map<String, Value> {
    let mut facts = Map::new();
    let mut ostree = false;

    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "os" if !value.is_empty() => {
                facts.insert("os".to_string(), Value::from(value.to_ascii_lowercase()));
            }
            key @ ("cpus" | "memory" | "space") => {
                if let Ok(n) = value.parse::<i64>() {
                    facts.insert(key.to_string(), Value::from(n));
                }
            }
            "ostree" => ostree = value == "yes",
            _ => {}
        }
    }

    if ostree {
        let base = facts.get("os").and_then(Value::as_str).unwrap_or_default();
        if ATOMIC_BASES.contains(&base) {
            facts.insert("os".to_string(), Value::from("atomic"));
        }
    }
    facts
}

/// flanneld settings for `network`. An etcd network without an etcd backend
/// has nothing to point at.
pub fn flannel_backend<'a>(
    network: &'a Network,
    etcd_endpoint: Option<&'a str>,
) -> Option<FlannelBackend<'a>> {
    match network.network_type {
        NetworkType::FlannelServer => network.server_address().map(FlannelBackend::Server),
        NetworkType::FlannelEtcd => etcd_endpoint.map(FlannelBackend::Etcd),
    }
}

/// Network a host of `cluster` is configured for
async fn cluster_network(store: &StoreManager, cluster: Option<&Cluster>) -> Network {
    let Some(cluster) = cluster else {
        return Network::default_network();
    };
    match store.get::<Network>(&cluster.network).await {
        Ok(network) => network,
        Err(e) if e.is_not_found() && cluster.network == DEFAULT_NETWORK => {
            Network::default_network()
        }
        Err(e) => {
            warn!(
                "Network {} of cluster {} unavailable, using the default: {}",
                cluster.network, cluster.name, e
            );
            Network::default_network()
        }
    }
}

/// Detach a reboot so the ssh session can return before the host goes down
fn detached(command: &str) -> String {
    format!(
        "nohup sh -c {} >/dev/null 2>&1 &",
        shell_quote(&format!("sleep 2 && {}", command))
    )
}

#[async_trait]
impl Transport for SshTransport {
    async fn get_info(&self, target: RemoteTarget<'_>) -> Result<TransportResult, TransportError> {
        let (exit_code, stdout) = self.run(target, FACTS_SCRIPT).await?;
        let facts = parse_facts(&stdout);
        debug!("Facts for {}: {:?}", target.address, facts);
        Ok(TransportResult { exit_code, facts })
    }

    async fn bootstrap(
        &self,
        target: RemoteTarget<'_>,
        cluster: Option<&Cluster>,
        store: &StoreManager,
        oscmd: &OsCommands,
    ) -> Result<TransportResult, TransportError> {
        let cluster_type = cluster
            .map(|c| c.cluster_type)
            .unwrap_or(ClusterType::HostOnly);
        let api_server = if cluster_type.requires_container_manager() {
            store
                .list_container_managers(cluster_type)
                .first()
                .map(|m| m.endpoint().to_string())
        } else {
            None
        };
        let network = cluster_network(store, cluster).await;
        let etcd_endpoint = store.backend_endpoint("etcd");
        info!(
            "Bootstrapping {} as {} ({}, network {})",
            target.address, cluster_type, oscmd.os_type, network.name
        );
        let script = oscmd.bootstrap_script(
            cluster_type,
            api_server.as_deref(),
            flannel_backend(&network, etcd_endpoint.as_deref()),
        );
        self.run_status(target, &script).await
    }

    async fn check_host_availability(
        &self,
        target: RemoteTarget<'_>,
    ) -> Result<TransportResult, TransportError> {
        self.run_status(target, "true").await
    }

    async fn restart(
        &self,
        target: RemoteTarget<'_>,
        oscmd: &OsCommands,
    ) -> Result<TransportResult, TransportError> {
        self.run_status(target, &detached(&oscmd.restart())).await
    }

    async fn upgrade(
        &self,
        target: RemoteTarget<'_>,
        oscmd: &OsCommands,
    ) -> Result<TransportResult, TransportError> {
        self.run_status(target, &oscmd.upgrade()).await
    }

    async fn deploy(
        &self,
        target: RemoteTarget<'_>,
        oscmd: &OsCommands,
        version: &str,
    ) -> Result<TransportResult, TransportError> {
        self.run_status(target, &oscmd.deploy(version)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_parse_facts() {
        let stdout = "os=Fedora\ncpus=2\nmemory=11989228\nspace=487652\njunk\n";
        let facts = parse_facts(stdout);
        assert_eq!(facts["os"], "fedora");
        assert_eq!(facts["cpus"], 2);
        assert_eq!(facts["memory"], 11989228);
        assert_eq!(facts["space"], 487652);
    }

    #[test]
    fn test_parse_facts_atomic() {
        let facts = parse_facts("os=centos\nostree=yes\n");
        assert_eq!(facts["os"], "atomic");

        let facts = parse_facts("os=debian\nostree=yes\n");
        assert_eq!(facts["os"], "debian");
    }

    #[test]
    fn test_parse_facts_skips_garbage_numbers() {
        let facts = parse_facts("cpus=\nmemory=lots\nos=\n");
        assert!(facts.is_empty());
    }

    #[test]
    fn test_ssh_args() {
        let config = SshTransportConfig::default();
        let target = RemoteTarget {
            address: "10.2.0.2",
            remote_user: "root",
            key_path: Path::new("/tmp/key123"),
        };
        let args = ssh_args(&config, target, "true");
        assert_eq!(args[0], "-i");
        assert_eq!(args[1], "/tmp/key123");
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert_eq!(
            args[args.len() - 5..],
            ["-l", "root", "--", "10.2.0.2", "true"]
        );
    }

    #[test]
    fn test_ssh_args_keep_user_and_address_out_of_option_position() {
        let config = SshTransportConfig::default();
        let target = RemoteTarget {
            address: "-oProxyCommand=touch /tmp/x",
            remote_user: "-oProxyCommand=touch /tmp/y",
            key_path: Path::new("/tmp/key123"),
        };
        let args = ssh_args(&config, target, "true");
        let separator = args.iter().position(|a| a == "--").unwrap();

        // the user is only ever the value of -l
        let user = args.iter().position(|a| a == target.remote_user).unwrap();
        assert_eq!(args[user - 1], "-l");
        assert!(user < separator);

        // the address only appears after the end of options
        assert_eq!(args[separator + 1], target.address);
        assert!(args[..separator]
            .iter()
            .all(|a| !a.contains("ProxyCommand") || a == target.remote_user));
    }

    #[test]
    fn test_flannel_backend_by_network_type() {
        let mut options = Map::new();
        options.insert("address".to_string(), Value::from("10.0.0.1:8080"));
        let server = Network::new("dev", NetworkType::FlannelServer).with_options(options);
        assert_eq!(
            flannel_backend(&server, Some("http://e:2379")),
            Some(FlannelBackend::Server("10.0.0.1:8080"))
        );

        let etcd = Network::new("dev", NetworkType::FlannelEtcd);
        assert_eq!(
            flannel_backend(&etcd, Some("http://e:2379")),
            Some(FlannelBackend::Etcd("http://e:2379"))
        );
        assert_eq!(flannel_backend(&etcd, None), None);
        assert_eq!(flannel_backend(&Network::default_network(), None), None);
    }

    #[tokio::test]
    async fn test_cluster_network_lookup() {
        let store = StoreManager::in_memory();
        let network = Network::new("dev", NetworkType::FlannelEtcd);
        store.save(&network).await.unwrap();

        let cluster = Cluster::new("honeynut", ClusterType::Kubernetes).with_network("dev");
        assert_eq!(cluster_network(&store, Some(&cluster)).await, network);

        let missing = Cluster::new("honeynut", ClusterType::Kubernetes).with_network("gone");
        assert_eq!(
            cluster_network(&store, Some(&missing)).await,
            Network::default_network()
        );
        assert_eq!(cluster_network(&store, None).await, Network::default_network());
    }

    #[test]
    fn test_detached_reboot() {
        assert_eq!(
            detached("systemctl reboot"),
            "nohup sh -c 'sleep 2 && systemctl reboot' >/dev/null 2>&1 &"
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let transport = SshTransport::new(SshTransportConfig {
            ssh_binary: "/nonexistent/hostkeeper-ssh".to_string(),
            ..Default::default()
        });
        let target = RemoteTarget {
            address: "10.2.0.2",
            remote_user: "root",
            key_path: Path::new("/tmp/none"),
        };
        let err = transport.check_host_availability(target).await.unwrap_err();
        assert!(matches!(err, TransportError::Spawn(_)));
    }
}
