//! Host network rules the tunnel needs: IP forwarding and source NAT for the
//! tunnel subnet.
//!
//! Every operation is idempotent. Running the installer against a host that
//! already carries the rules leaves it untouched; running it after a firewall
//! reset puts the rules back.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use shared_utils::config::FirewallBackend;
use std::fmt;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

mod iptables;
mod memory;
mod rules_file;
mod ruleset;

pub use iptables::{IptablesInstaller, parse_route_get};
pub use memory::MemoryInstaller;
pub use rules_file::RulesFileInstaller;
pub use ruleset::RuleSet;

/// Errors surfaced by rule installation.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on {path}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("System command `{command}` failed: {stderr}")]
    CommandFailure { command: String, stderr: String },

    #[error("no route to {probe}; cannot detect the egress interface")]
    NoRouteFound { probe: IpAddr },

    #[error("malformed rules: {0}")]
    Malformed(String),
}

/// Result alias for rule operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Source NAT for traffic leaving the tunnel subnet through `egress`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasqueradeRule {
    pub subnet: IpNetwork,
    pub egress: String,
}

impl MasqueradeRule {
    pub fn new(subnet: IpNetwork, egress: impl Into<String>) -> Self {
        Self {
            subnet,
            egress: egress.into(),
        }
    }

    /// Arguments after `-t nat -A` / `-I POSTROUTING 1`.
    pub(crate) fn match_args(&self) -> [String; 6] {
        [
            "-s".into(),
            self.subnet.to_string(),
            "-o".into(),
            self.egress.clone(),
            "-j".into(),
            "MASQUERADE".into(),
        ]
    }

    /// The rule as `iptables-save` prints it.
    pub fn to_line(&self) -> String {
        format!("-A POSTROUTING {}", self.match_args().join(" "))
    }
}

impl fmt::Display for MasqueradeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.subnet, self.egress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Inserted,
    AlreadyPresent,
}

/// What happened to a single forwarding toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Enabled,
    AlreadyEnabled,
    /// The kernel does not expose this toggle (e.g. IPv6 disabled).
    Unsupported,
    NotRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardingReport {
    pub ipv4: Toggle,
    pub ipv6: Toggle,
}

/// Narrow capability the bootstrap controller needs from the host.
#[async_trait]
pub trait NetworkRuleInstaller: Send + Sync {
    /// Enable packet forwarding; only writes toggles that are currently off.
    async fn ensure_forwarding(&self, ipv4: bool, ipv6: bool) -> NetworkResult<ForwardingReport>;

    /// Install `rule` unless an equivalent rule already exists.
    async fn ensure_masquerade(&self, rule: &MasqueradeRule) -> NetworkResult<InstallOutcome>;

    /// Name of the interface used to reach `probe`.
    async fn detect_egress(&self, probe: IpAddr) -> NetworkResult<String>;
}

const SYSCTL_IPV4_FORWARD: &str = "sys/net/ipv4/ip_forward";
const SYSCTL_IPV6_FORWARD: &str = "sys/net/ipv6/conf/all/forwarding";

/// Forwarding toggles under a `/proc` style root.
#[derive(Debug, Clone)]
pub struct SysctlForwarding {
    proc_root: PathBuf,
}

impl Default for SysctlForwarding {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl SysctlForwarding {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    async fn ensure_sysctl(path: &Path) -> NetworkResult<Toggle> {
        match fs::read_to_string(path).await {
            Ok(existing) if existing.trim() == "1" => return Ok(Toggle::AlreadyEnabled),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Toggle::Unsupported),
            Err(source) => {
                return Err(NetworkError::File {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        fs::write(path, b"1\n")
            .await
            .map_err(|source| NetworkError::File {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Toggle::Enabled)
    }

    pub async fn ensure(&self, ipv4: bool, ipv6: bool) -> NetworkResult<ForwardingReport> {
        let mut report = ForwardingReport {
            ipv4: Toggle::NotRequested,
            ipv6: Toggle::NotRequested,
        };

        if ipv4 {
            let path = self.proc_root.join(SYSCTL_IPV4_FORWARD);
            report.ipv4 = Self::ensure_sysctl(&path).await?;
            match report.ipv4 {
                Toggle::Enabled => info!(path = %path.display(), "enabled IPv4 forwarding"),
                Toggle::Unsupported => {
                    return Err(NetworkError::File {
                        path,
                        source: ErrorKind::NotFound.into(),
                    });
                }
                _ => {}
            }
        }

        if ipv6 {
            let path = self.proc_root.join(SYSCTL_IPV6_FORWARD);
            report.ipv6 = Self::ensure_sysctl(&path).await?;
            match report.ipv6 {
                Toggle::Enabled => info!(path = %path.display(), "enabled IPv6 forwarding"),
                Toggle::Unsupported => {
                    warn!(path = %path.display(), "IPv6 forwarding toggle not available")
                }
                _ => {}
            }
        }

        Ok(report)
    }
}

/// Construct the installer selected in configuration.
pub fn build_installer(backend: &FirewallBackend) -> Arc<dyn NetworkRuleInstaller> {
    match backend {
        FirewallBackend::Iptables => Arc::new(IptablesInstaller::default()),
        FirewallBackend::RulesFile(path) => Arc::new(RulesFileInstaller::new(path.clone())),
    }
}
