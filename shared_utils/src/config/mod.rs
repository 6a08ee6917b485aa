//! Configuration management module for vpngate.
//!
//! Settings come from an optional TOML file overlaid by `VPNGATE_*`
//! environment variables. [`Settings::to_inputs`] turns the loose settings
//! into validated [`EnvironmentInputs`]; every security-relevant value must
//! be supplied explicitly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Environment variable naming an optional TOML settings file.
pub const CONFIG_ENV: &str = "VPNGATE_CONFIG";

const DEFAULT_DATA_DIR: &str = "/etc/vpngate";
const DEFAULT_SERVER_BIN: &str = "openvpn";
const DEFAULT_PORT: u16 = 1194;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Transport protocol the tunnel server listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(ConfigError::invalid(
                "protocol",
                format!("expected udp or tcp, got {other:?}"),
            )),
        }
    }
}

/// Whether the CA private key must be sealed with a passphrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassphrasePolicy {
    Required,
    None,
}

impl FromStr for PassphrasePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "required" => Ok(PassphrasePolicy::Required),
            "none" => Ok(PassphrasePolicy::None),
            other => Err(ConfigError::invalid(
                "ca_passphrase_policy",
                format!("expected required or none, got {other:?}"),
            )),
        }
    }
}

/// Host interface tunnel traffic leaves through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressInterface {
    /// Resolve the interface from the routing table at bootstrap time.
    Auto,
    Named(String),
}

impl FromStr for EgressInterface {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::invalid("egress_interface", "empty value"));
        }
        if s.eq_ignore_ascii_case("auto") {
            return Ok(EgressInterface::Auto);
        }
        if s.len() > 15 || s.contains(|c: char| c.is_whitespace() || c == '/') {
            return Err(ConfigError::invalid(
                "egress_interface",
                format!("{s:?} is not a valid interface name"),
            ));
        }
        Ok(EgressInterface::Named(s.to_string()))
    }
}

/// Where masquerade rules are installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallBackend {
    /// Live iptables NAT table.
    Iptables,
    /// A persisted ufw-style rules file such as `/etc/ufw/before.rules`.
    RulesFile(PathBuf),
}

impl FromStr for FirewallBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("iptables") {
            return Ok(FirewallBackend::Iptables);
        }
        match s.strip_prefix("rules-file:") {
            Some(path) if !path.is_empty() => Ok(FirewallBackend::RulesFile(PathBuf::from(path))),
            _ => Err(ConfigError::invalid(
                "firewall",
                format!("expected iptables or rules-file:<path>, got {s:?}"),
            )),
        }
    }
}

/// How control passes to the tunnel server once bootstrap succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandoffMode {
    /// Launch the server as a child, forward signals, propagate its exit code.
    #[default]
    Supervise,
    /// Replace the current process image.
    Exec,
}

impl FromStr for HandoffMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "supervise" => Ok(HandoffMode::Supervise),
            "exec" => Ok(HandoffMode::Exec),
            other => Err(ConfigError::invalid(
                "handoff",
                format!("expected supervise or exec, got {other:?}"),
            )),
        }
    }
}

/// A secret string whose value never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

/// Loose settings as read from the TOML file and environment.
///
/// Every field is optional here; required-ness is enforced by
/// [`Settings::to_inputs`] so the error names the missing field.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    pub protocol: Option<String>,
    pub public_endpoint: Option<String>,
    pub ca_passphrase_policy: Option<String>,
    /// Only ever read from the environment.
    #[serde(skip)]
    pub ca_passphrase: Option<String>,
    pub tunnel_subnet: Option<String>,
    pub egress_interface: Option<String>,
    pub dns: Option<Vec<String>>,
    pub routes: Option<Vec<String>>,
    pub data_dir: Option<PathBuf>,
    pub firewall: Option<String>,
    pub ipv6_forwarding: Option<bool>,
    pub server_bin: Option<PathBuf>,
    pub handoff: Option<String>,
    #[serde(default)]
    pub log: LogSettings,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSettings {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,

    /// Also write a daily rotated log file into this directory
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

/// Validated bootstrap inputs.
#[derive(Debug, Clone)]
pub struct EnvironmentInputs {
    pub protocol: Protocol,
    /// `host` or `host:port`, validated by the config generator.
    pub public_endpoint: String,
    pub passphrase_policy: PassphrasePolicy,
    pub ca_passphrase: Option<Secret>,
    /// Tunnel subnet in CIDR notation, validated by the config generator.
    pub tunnel_subnet: String,
    pub egress_interface: EgressInterface,
    pub dns: Vec<IpAddr>,
    pub routes: Vec<String>,
    pub data_dir: PathBuf,
    pub firewall: FirewallBackend,
    pub ipv6_forwarding: bool,
    pub server_bin: PathBuf,
    pub handoff: HandoffMode,
}

impl EnvironmentInputs {
    /// Port implied by the public endpoint when none is given explicitly.
    pub const DEFAULT_PORT: u16 = DEFAULT_PORT;
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("expected a boolean, got {other:?}"))),
    }
}

fn require<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str, ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::MissingValue(key.to_string())),
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save settings to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Settings file read when `VPNGATE_CONFIG` is not set
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("vpngate").join("vpngate.toml")
        } else {
            PathBuf::from("vpngate.toml")
        }
    }

    /// Build settings from the process environment. The TOML file named by
    /// `VPNGATE_CONFIG` is read first, or [`Settings::default_path`] when
    /// that file exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_lookup_or(lookup, &Self::default_path())
    }

    /// Like [`Settings::from_lookup`], with `fallback` read when
    /// `VPNGATE_CONFIG` is unset. A missing fallback file is not an error.
    pub fn from_lookup_or<F>(lookup: F, fallback: &Path) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = match lookup(CONFIG_ENV) {
            Some(path) if !path.trim().is_empty() => Settings::load(path.trim())?,
            _ if fallback.is_file() => Settings::load(fallback)?,
            _ => Settings::default(),
        };
        base.overlay(lookup)
    }

    /// Override fields with any `VPNGATE_*` variables the lookup yields.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("VPNGATE_PROTOCOL") {
            self.protocol = Some(v);
        }
        if let Some(v) = var("VPNGATE_PUBLIC_ENDPOINT") {
            self.public_endpoint = Some(v);
        }
        if let Some(v) = var("VPNGATE_CA_PASSPHRASE_POLICY") {
            self.ca_passphrase_policy = Some(v);
        }
        if let Some(v) = lookup("VPNGATE_CA_PASSPHRASE") {
            self.ca_passphrase = Some(v);
        }
        if let Some(v) = var("VPNGATE_TUNNEL_SUBNET") {
            self.tunnel_subnet = Some(v);
        }
        if let Some(v) = var("VPNGATE_EGRESS_INTERFACE") {
            self.egress_interface = Some(v);
        }
        if let Some(v) = var("VPNGATE_DNS") {
            self.dns = Some(split_list(&v));
        }
        if let Some(v) = lookup("VPNGATE_ROUTES") {
            self.routes = Some(split_list(&v));
        }
        if let Some(v) = var("VPNGATE_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("VPNGATE_FIREWALL") {
            self.firewall = Some(v);
        }
        if let Some(v) = var("VPNGATE_IPV6_FORWARDING") {
            self.ipv6_forwarding = Some(parse_bool("ipv6_forwarding", &v)?);
        }
        if let Some(v) = var("VPNGATE_SERVER_BIN") {
            self.server_bin = Some(PathBuf::from(v));
        }
        if let Some(v) = var("VPNGATE_HANDOFF") {
            self.handoff = Some(v);
        }
        if let Some(v) = var("VPNGATE_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = var("VPNGATE_LOG_JSON") {
            self.log.json = parse_bool("log.json", &v)?;
        }
        if let Some(v) = var("VPNGATE_LOG_DIR") {
            self.log.dir = Some(PathBuf::from(v));
        }
        Ok(self)
    }

    /// Directory holding all persisted gateway state.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    /// CA passphrase, if one was supplied.
    pub fn passphrase(&self) -> Option<Secret> {
        self.ca_passphrase
            .as_ref()
            .filter(|p| !p.is_empty())
            .map(|p| Secret::new(p.clone()))
    }

    /// Validate the settings into bootstrap inputs.
    ///
    /// Required values are checked in a fixed order so the first missing
    /// field is always the one reported.
    pub fn to_inputs(&self) -> Result<EnvironmentInputs, ConfigError> {
        let protocol: Protocol = require(&self.protocol, "protocol")?.parse()?;
        let public_endpoint = require(&self.public_endpoint, "public_endpoint")?.to_string();
        let passphrase_policy: PassphrasePolicy =
            require(&self.ca_passphrase_policy, "ca_passphrase_policy")?.parse()?;
        let tunnel_subnet = require(&self.tunnel_subnet, "tunnel_subnet")?.to_string();
        let egress_interface: EgressInterface =
            require(&self.egress_interface, "egress_interface")?.parse()?;

        let dns_raw = match &self.dns {
            Some(list) if !list.is_empty() => list,
            _ => return Err(ConfigError::MissingValue("dns".to_string())),
        };
        let dns = dns_raw
            .iter()
            .map(|s| {
                s.trim().parse::<IpAddr>().map_err(|_| {
                    ConfigError::invalid("dns", format!("{s:?} is not an IP address"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let firewall = match &self.firewall {
            Some(v) => v.parse()?,
            None => FirewallBackend::Iptables,
        };
        let handoff = match &self.handoff {
            Some(v) => v.parse()?,
            None => HandoffMode::default(),
        };

        Ok(EnvironmentInputs {
            protocol,
            public_endpoint,
            passphrase_policy,
            ca_passphrase: self.passphrase(),
            tunnel_subnet,
            egress_interface,
            dns,
            routes: self.routes.clone().unwrap_or_default(),
            data_dir: self.data_dir(),
            firewall,
            ipv6_forwarding: self.ipv6_forwarding.unwrap_or(false),
            server_bin: self
                .server_bin
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER_BIN)),
            handoff,
        })
    }
}
