use super::{
    ForwardingReport, InstallOutcome, IptablesInstaller, MasqueradeRule, NetworkError,
    NetworkResult, NetworkRuleInstaller, RuleSet, SysctlForwarding,
};
use async_trait::async_trait;
use std::fmt;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

const DEFAULT_MODE: u32 = 0o640;

/// Edits an `iptables-restore` formatted rules file such as
/// `/etc/ufw/before.rules` so the rule survives firewall reloads, and applies
/// the same rule to the running tables so it is active before the tunnel
/// server starts.
pub struct RulesFileInstaller {
    path: PathBuf,
    forwarding: SysctlForwarding,
    live: Arc<dyn NetworkRuleInstaller>,
}

impl fmt::Debug for RulesFileInstaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RulesFileInstaller")
            .field("path", &self.path)
            .field("forwarding", &self.forwarding)
            .finish_non_exhaustive()
    }
}

impl RulesFileInstaller {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_forwarding(path, SysctlForwarding::default())
    }

    pub fn with_forwarding(path: impl Into<PathBuf>, forwarding: SysctlForwarding) -> Self {
        Self {
            path: path.into(),
            live: Arc::new(IptablesInstaller::new(forwarding.clone())),
            forwarding,
        }
    }

    /// Replace the installer that applies rules to the running tables.
    /// It also answers egress detection.
    pub fn with_live(mut self, live: Arc<dyn NetworkRuleInstaller>) -> Self {
        self.live = live;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_err(&self) -> impl FnOnce(std::io::Error) -> NetworkError + '_ {
        move |source| NetworkError::File {
            path: self.path.clone(),
            source,
        }
    }

    async fn read(&self) -> NetworkResult<(String, u32)> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => {
                let meta = fs::metadata(&self.path).await.map_err(self.file_err())?;
                Ok((text, meta.permissions().mode() & 0o7777))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok((String::new(), DEFAULT_MODE)),
            Err(err) => Err(self.file_err()(err)),
        }
    }

    /// Add `rule` to the file unless present. Returns whether it changed.
    async fn persist(&self, rule: &MasqueradeRule) -> NetworkResult<bool> {
        let (text, mode) = self.read().await?;
        let mut rules = RuleSet::parse(&text);
        if !rules.insert(rule)? {
            debug!(path = %self.path.display(), subnet = %rule.subnet, "masquerade rule already in rules file");
            return Ok(false);
        }

        let path = self.path.clone();
        let contents = rules.to_text();
        tokio::task::spawn_blocking(move || {
            crate::fsutil::write_atomic(&path, contents.as_bytes(), mode)
        })
        .await
        .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?
        .map_err(self.file_err())?;

        info!(
            path = %self.path.display(),
            subnet = %rule.subnet,
            interface = %rule.egress,
            "added masquerade rule to rules file"
        );
        Ok(true)
    }
}

#[async_trait]
impl NetworkRuleInstaller for RulesFileInstaller {
    async fn ensure_forwarding(&self, ipv4: bool, ipv6: bool) -> NetworkResult<ForwardingReport> {
        self.forwarding.ensure(ipv4, ipv6).await
    }

    async fn ensure_masquerade(&self, rule: &MasqueradeRule) -> NetworkResult<InstallOutcome> {
        let written = self.persist(rule).await?;
        let applied = self.live.ensure_masquerade(rule).await?;
        if written || applied == InstallOutcome::Inserted {
            Ok(InstallOutcome::Inserted)
        } else {
            Ok(InstallOutcome::AlreadyPresent)
        }
    }

    async fn detect_egress(&self, probe: IpAddr) -> NetworkResult<String> {
        self.live.detect_egress(probe).await
    }
}
