//! Bootstrap controller: first-boot provisioning, state reuse and handoff.
//!
//! Whether first-time initialization already happened is decided by a single
//! predicate, [`StateLayout::is_initialized`]. Everything after that is
//! either "create exactly once" (PKI, identity, server config) or
//! "reassert every run" (forwarding, NAT).

use crate::configgen::{self, GenerateError};
use crate::handoff::{HandoffError, TunnelServer};
use crate::identity::{IdentityError, ServerIdentity};
use crate::layout::{SERVER_CONFIG, StateLayout};
use crate::netrules::{
    ForwardingReport, InstallOutcome, MasqueradeRule, NetworkError, NetworkRuleInstaller,
};
use crate::pki::{PkiError, PkiState, PkiStatus, PkiStore};
use ipnetwork::IpNetwork;
use shared_utils::config::{ConfigError, EgressInterface, EnvironmentInputs};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Address whose route decides the egress interface in `auto` mode.
pub const EGRESS_PROBE: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("missing required configuration: {0}")]
    MissingConfiguration(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("inconsistent state at {path}: {reason}")]
    InconsistentState { path: PathBuf, reason: String },

    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("failed to write {path}: {source}")]
    Persist { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Handoff(#[from] HandoffError),
}

impl From<ConfigError> for BootstrapError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::MissingValue(field) => BootstrapError::MissingConfiguration(field),
            other => BootstrapError::InvalidConfiguration(other.to_string()),
        }
    }
}

impl BootstrapError {
    fn inconsistent(path: &Path, reason: impl Into<String>) -> Self {
        BootstrapError::InconsistentState {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Stable short name of the error kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BootstrapError::MissingConfiguration(_) => "missing_configuration",
            BootstrapError::InvalidConfiguration(_) => "invalid_configuration",
            BootstrapError::InconsistentState { .. } => "inconsistent_state",
            BootstrapError::Pki(err) => match err {
                PkiError::AlreadyInitialized(_) => "already_initialized",
                PkiError::WeakPassphrase(_) => "weak_passphrase",
                PkiError::DuplicateClientName(_) => "duplicate_client_name",
                PkiError::InvalidClientName { .. } => "invalid_client_name",
                PkiError::UnknownClient(_) => "unknown_client",
                PkiError::PassphraseRequired | PkiError::Seal(_) => "ca_key_locked",
                PkiError::NotInitialized(_) => "not_initialized",
                _ => "pki",
            },
            BootstrapError::Generate(GenerateError::InvalidEndpoint { .. }) => "invalid_endpoint",
            BootstrapError::Generate(GenerateError::InvalidSubnet { .. }) => "invalid_subnet",
            BootstrapError::Network(NetworkError::NoRouteFound { .. }) => "no_route_found",
            BootstrapError::Network(_) => "network",
            BootstrapError::Identity(_) | BootstrapError::Persist { .. } => "persist",
            BootstrapError::Handoff(_) => "handoff",
        }
    }

    /// Process exit status for this error. Every kind gets its own code.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            "missing_configuration" => 10,
            "invalid_configuration" => 11,
            "invalid_endpoint" => 12,
            "invalid_subnet" => 13,
            "inconsistent_state" => 20,
            "already_initialized" => 21,
            "weak_passphrase" => 22,
            "duplicate_client_name" => 23,
            "invalid_client_name" => 24,
            "unknown_client" => 25,
            "ca_key_locked" => 26,
            "not_initialized" => 27,
            "pki" => 29,
            "no_route_found" => 30,
            "network" => 31,
            "persist" => 40,
            "handoff" => 50,
            _ => 1,
        }
    }
}

/// Result alias for controller operations.
pub type BootstrapResult<T> = Result<T, BootstrapError>;

/// What a bootstrap run found and did.
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub first_boot: bool,
    pub identity: ServerIdentity,
    pub ca_fingerprint: String,
    pub server_fingerprint: String,
    pub egress: String,
    pub masquerade: InstallOutcome,
    pub forwarding: ForwardingReport,
}

pub struct Controller {
    layout: StateLayout,
    installer: Arc<dyn NetworkRuleInstaller>,
}

impl Controller {
    pub fn new(layout: StateLayout, installer: Arc<dyn NetworkRuleInstaller>) -> Self {
        Self { layout, installer }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    fn store(&self) -> PkiStore {
        PkiStore::new(self.layout.pki_dir())
    }

    /// Bring the host to a state where the tunnel server can start.
    ///
    /// Nothing is retried. Any error leaves the tunnel server unstarted.
    pub async fn bootstrap(&self, inputs: &EnvironmentInputs) -> BootstrapResult<BootstrapReport> {
        let (first_boot, identity, pki) = if self.layout.is_initialized() {
            let (identity, pki) = self.reuse(inputs)?;
            (false, identity, pki)
        } else {
            let (identity, pki) = self.provision(inputs)?;
            (true, identity, pki)
        };

        let (egress, masquerade, forwarding) = self.install_rules(&identity, inputs).await?;

        Ok(BootstrapReport {
            first_boot,
            identity,
            ca_fingerprint: pki.ca_fingerprint,
            server_fingerprint: pki.server_fingerprint,
            egress,
            masquerade,
            forwarding,
        })
    }

    /// Bootstrap, then hand off to the tunnel server. Returns its exit code.
    pub async fn run(&self, inputs: &EnvironmentInputs) -> BootstrapResult<i32> {
        let report = self.bootstrap(inputs).await?;
        info!(
            first_boot = report.first_boot,
            ca_fingerprint = %report.ca_fingerprint,
            interface = %report.egress,
            "bootstrap complete"
        );
        Ok(self.tunnel_server(inputs).launch(inputs.handoff).await?)
    }

    pub fn tunnel_server(&self, inputs: &EnvironmentInputs) -> TunnelServer {
        TunnelServer::openvpn(inputs.server_bin.clone(), self.layout.root(), SERVER_CONFIG)
    }

    fn provision(&self, inputs: &EnvironmentInputs) -> BootstrapResult<(ServerIdentity, PkiState)> {
        let store = self.store();
        if store.has_state()? {
            return Err(BootstrapError::inconsistent(
                store.dir(),
                "PKI material exists but the server configuration does not",
            ));
        }
        let identity_path = self.layout.identity();
        if identity_path.exists() {
            return Err(BootstrapError::inconsistent(
                &identity_path,
                "identity exists but the server configuration does not",
            ));
        }

        let identity = ServerIdentity::from_inputs(inputs);
        // Validate everything before the first write.
        let document = configgen::generate(&identity)?;

        let root = self.layout.root();
        fs::create_dir_all(root).map_err(|source| BootstrapError::Persist {
            path: root.to_path_buf(),
            source,
        })?;

        let pki = store.initialize(
            &identity,
            inputs.passphrase_policy,
            inputs.ca_passphrase.as_ref(),
        )?;
        identity.save(&identity_path)?;

        let config_path = self.layout.server_config();
        document
            .write_to(&config_path)
            .map_err(|source| BootstrapError::Persist {
                path: config_path.clone(),
                source,
            })?;
        info!(
            path = %config_path.display(),
            subnet = %identity.tunnel_subnet,
            endpoint = %identity.endpoint,
            "provisioned gateway"
        );
        Ok((identity, pki))
    }

    fn reuse(&self, inputs: &EnvironmentInputs) -> BootstrapResult<(ServerIdentity, PkiState)> {
        let store = self.store();
        match store.status()? {
            PkiStatus::Complete => {}
            PkiStatus::Empty => {
                return Err(BootstrapError::inconsistent(
                    store.dir(),
                    "server configuration exists but the PKI directory holds no state",
                ));
            }
            PkiStatus::Partial { missing } => {
                return Err(BootstrapError::inconsistent(
                    store.dir(),
                    format!("PKI is incomplete, missing {}", missing.join(", ")),
                ));
            }
        }

        let identity_path = self.layout.identity();
        if !identity_path.is_file() {
            return Err(BootstrapError::inconsistent(
                &identity_path,
                "server configuration exists but the identity file does not",
            ));
        }
        let identity = ServerIdentity::load(&identity_path)?;
        if identity != ServerIdentity::from_inputs(inputs) {
            warn!(
                path = %identity_path.display(),
                "configuration differs from the persisted identity; keeping the persisted \
                 values (remove the data directory to re-provision)"
            );
        }

        info!(
            path = %self.layout.server_config().display(),
            "reusing existing configuration and PKI"
        );
        Ok((identity, store.state()?))
    }

    async fn install_rules(
        &self,
        identity: &ServerIdentity,
        inputs: &EnvironmentInputs,
    ) -> BootstrapResult<(String, InstallOutcome, ForwardingReport)> {
        let subnet = configgen::parse_subnet(&identity.tunnel_subnet)?;
        let forwarding = self
            .installer
            .ensure_forwarding(true, inputs.ipv6_forwarding)
            .await?;

        let egress = match &inputs.egress_interface {
            EgressInterface::Named(name) => name.clone(),
            EgressInterface::Auto => {
                let detected = self.installer.detect_egress(EGRESS_PROBE).await?;
                info!(interface = %detected, probe = %EGRESS_PROBE, "detected egress interface");
                detected
            }
        };

        let rule = MasqueradeRule::new(IpNetwork::V4(subnet), egress.clone());
        let outcome = self.installer.ensure_masquerade(&rule).await?;
        info!(subnet = %rule.subnet, interface = %egress, ?outcome, "masquerade in place");
        Ok((egress, outcome, forwarding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_value_maps_to_missing_configuration() {
        let err: BootstrapError = ConfigError::MissingValue("dns".into()).into();
        assert!(matches!(err, BootstrapError::MissingConfiguration(ref f) if f == "dns"));
        assert_eq!(err.exit_code(), 10);
    }

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let errors = [
            BootstrapError::MissingConfiguration("x".into()),
            BootstrapError::InvalidConfiguration("x".into()),
            BootstrapError::inconsistent(Path::new("/x"), "x"),
            PkiError::AlreadyInitialized("/x".into()).into(),
            PkiError::WeakPassphrase("x".into()).into(),
            PkiError::DuplicateClientName("x".into()).into(),
            GenerateError::InvalidEndpoint { endpoint: "x".into(), reason: "x".into() }.into(),
            GenerateError::InvalidSubnet { subnet: "x".into(), reason: "x".into() }.into(),
            NetworkError::NoRouteFound { probe: EGRESS_PROBE }.into(),
            NetworkError::Malformed("x".into()).into(),
            PkiError::Certificate("x".into()).into(),
        ];
        let mut codes: Vec<i32> = errors.iter().map(BootstrapError::exit_code).collect();
        assert!(codes.iter().all(|&c| c != 0 && c != 1));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
