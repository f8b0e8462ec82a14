//! Per-OS command sets
//!
//! Each supported OS family maps the abstract operations the transport runs
//! (package installs, upgrade, restart, deploy) onto concrete shell commands.

use super::TransportError;
use crate::model::ClusterType;

/// Shell commands for one OS family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsCommands {
    pub os_type: &'static str,
    install: &'static str,
    upgrade: &'static str,
    deploy: Option<&'static str>,
    restart: &'static str,
    docker_package: &'static str,
    flannel_package: &'static str,
    kube_package: &'static str,
}

const FEDORA: OsCommands = OsCommands {
    os_type: "fedora",
    install: "dnf -y install",
    upgrade: "dnf -y update",
    deploy: None,
    restart: "systemctl reboot",
    docker_package: "docker",
    flannel_package: "flannel",
    kube_package: "kubernetes-node",
};

const RHEL: OsCommands = OsCommands {
    os_type: "rhel",
    install: "yum -y install",
    upgrade: "yum -y update",
    deploy: None,
    restart: "systemctl reboot",
    docker_package: "docker",
    flannel_package: "flannel",
    kube_package: "kubernetes-node",
};

const CENTOS: OsCommands = OsCommands {
    os_type: "centos",
    ..RHEL
};

/// Image based hosts ship every package already
const ATOMIC: OsCommands = OsCommands {
    os_type: "atomic",
    install: "",
    upgrade: "rpm-ostree upgrade",
    deploy: Some("rpm-ostree deploy"),
    restart: "systemctl reboot",
    docker_package: "",
    flannel_package: "",
    kube_package: "",
};

/// Command set for an OS as reported by fact gathering
pub fn get_oscmd(os: &str) -> Result<OsCommands, TransportError> {
    match os.trim().to_ascii_lowercase().as_str() {
        "fedora" => Ok(FEDORA),
        "rhel" | "redhat" => Ok(RHEL),
        "centos" => Ok(CENTOS),
        "atomic" => Ok(ATOMIC),
        other => Err(TransportError::UnsupportedOs(other.to_string())),
    }
}

impl OsCommands {
    fn install(&self, package: &str) -> String {
        if self.install.is_empty() || package.is_empty() {
            "true".to_string()
        } else {
            format!("{} {}", self.install, package)
        }
    }

    pub fn upgrade(&self) -> String {
        self.upgrade.to_string()
    }

    pub fn restart(&self) -> String {
        self.restart.to_string()
    }

    /// Deploy a specific version. Package based systems have no notion of
    /// a deployable tree, so this is a no-op there.
    pub fn deploy(&self, version: &str) -> String {
        match self.deploy {
            Some(cmd) => format!("{} {}", cmd, shell_quote(version)),
            None => "true".to_string(),
        }
    }

    /// Full bootstrap script for joining a cluster of `cluster_type`.
    ///
    /// `api_server` is written into the kubelet configuration and `flannel`
    /// into the flanneld configuration when given.
    pub fn bootstrap_script(
        &self,
        cluster_type: ClusterType,
        api_server: Option<&str>,
        flannel: Option<FlannelBackend<'_>>,
    ) -> String {
        let mut steps = vec![self.install(self.docker_package)];
        let mut services = vec!["docker"];

        if cluster_type.requires_container_manager() {
            steps.push(self.install(self.flannel_package));
            steps.push(self.install(self.kube_package));
            if let Some(flannel) = flannel {
                steps.push(format!(
                    "echo {} > /etc/sysconfig/flanneld",
                    shell_quote(&flannel.sysconfig())
                ));
            }
            if let Some(url) = api_server {
                steps.push(format!(
                    "echo {} > /etc/kubernetes/kubelet",
                    shell_quote(&format!("KUBELET_API_SERVER=--api-servers={}", url))
                ));
            }
            services.extend(["flanneld", "kubelet", "kube-proxy"]);
        }

        for service in services {
            steps.push(format!("systemctl enable {}", service));
            steps.push(format!("systemctl restart {}", service));
        }
        steps.join(" && ")
    }
}

/// Where flanneld on a bootstrapped host gets its network config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlannelBackend<'a> {
    /// Address of a flannel server
    Server(&'a str),
    /// URL of the etcd cluster
    Etcd(&'a str),
}

impl FlannelBackend<'_> {
    fn sysconfig(&self) -> String {
        match self {
            FlannelBackend::Server(address) => format!("FLANNEL_OPTIONS=--remote={}", address),
            FlannelBackend::Etcd(url) => format!("FLANNEL_ETCD_ENDPOINTS={}", url),
        }
    }
}

/// Single-quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_oscmd_known_types() {
        for os in ["fedora", "rhel", "redhat", "centos", "atomic", "Fedora"] {
            assert!(get_oscmd(os).is_ok(), "{os} should be supported");
        }
        assert_eq!(get_oscmd("centos").unwrap().upgrade(), "yum -y update");
    }

    #[test]
    fn test_get_oscmd_unknown_type() {
        assert!(matches!(
            get_oscmd("plan9"),
            Err(TransportError::UnsupportedOs(os)) if os == "plan9"
        ));
    }

    #[test]
    fn test_deploy_only_on_atomic() {
        assert_eq!(get_oscmd("atomic").unwrap().deploy("7.2"), "rpm-ostree deploy '7.2'");
        assert_eq!(get_oscmd("fedora").unwrap().deploy("7.2"), "true");
    }

    #[test]
    fn test_bootstrap_script_host_only() {
        let script = FEDORA.bootstrap_script(
            ClusterType::HostOnly,
            None,
            Some(FlannelBackend::Server("10.0.0.1:8080")),
        );
        assert!(script.starts_with("dnf -y install docker"));
        assert!(script.contains("systemctl restart docker"));
        assert!(!script.contains("kubelet"));
        assert!(!script.contains("flanneld"));
    }

    #[test]
    fn test_bootstrap_script_kubernetes() {
        let script = ATOMIC.bootstrap_script(ClusterType::Kubernetes, Some("https://k8s:6443"), None);
        assert!(script.starts_with("true && "));
        assert!(script.contains("--api-servers=https://k8s:6443"));
        assert!(script.contains("systemctl enable kubelet"));
    }

    #[test]
    fn test_bootstrap_script_flannel_config() {
        let script = FEDORA.bootstrap_script(
            ClusterType::Kubernetes,
            None,
            Some(FlannelBackend::Server("10.0.0.1:8080")),
        );
        assert!(script.contains("echo 'FLANNEL_OPTIONS=--remote=10.0.0.1:8080' > /etc/sysconfig/flanneld"));

        let script = FEDORA.bootstrap_script(
            ClusterType::Kubernetes,
            None,
            Some(FlannelBackend::Etcd("http://127.0.0.1:2379")),
        );
        assert!(script.contains("'FLANNEL_ETCD_ENDPOINTS=http://127.0.0.1:2379'"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }
}
