use super::{
    ForwardingReport, InstallOutcome, MasqueradeRule, NetworkError, NetworkResult,
    NetworkRuleInstaller, RuleSet, Toggle,
};
use async_trait::async_trait;
use std::net::IpAddr;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Default)]
struct MemoryState {
    rules: RuleSet,
    ipv4_forwarding: bool,
    ipv6_forwarding: bool,
    inserts: usize,
}

/// In-memory rule table for tests and dry runs. Nothing on the host is
/// touched.
#[derive(Debug, Default)]
pub struct MemoryInstaller {
    state: AsyncMutex<MemoryState>,
    egress: Option<String>,
}

impl MemoryInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing `iptables-save` style table.
    pub fn with_rules(text: &str) -> Self {
        Self {
            state: AsyncMutex::new(MemoryState {
                rules: RuleSet::parse(text),
                ..MemoryState::default()
            }),
            egress: None,
        }
    }

    /// Interface reported by egress detection. Without one, detection fails
    /// with `NoRouteFound`.
    pub fn with_egress(mut self, interface: impl Into<String>) -> Self {
        self.egress = Some(interface.into());
        self
    }

    pub async fn rules_text(&self) -> String {
        self.state.lock().await.rules.to_text()
    }

    pub async fn count_matching(&self, rule: &MasqueradeRule) -> usize {
        self.state.lock().await.rules.count_matching(rule)
    }

    /// Number of rules inserted so far.
    pub async fn inserts(&self) -> usize {
        self.state.lock().await.inserts
    }

    pub async fn forwarding(&self) -> (bool, bool) {
        let state = self.state.lock().await;
        (state.ipv4_forwarding, state.ipv6_forwarding)
    }

    /// Drop every rule, as a firewall reload would.
    pub async fn flush(&self) {
        self.state.lock().await.rules = RuleSet::default();
    }
}

fn toggle(flag: &mut bool, requested: bool) -> Toggle {
    match (requested, *flag) {
        (false, _) => Toggle::NotRequested,
        (true, true) => Toggle::AlreadyEnabled,
        (true, false) => {
            *flag = true;
            Toggle::Enabled
        }
    }
}

#[async_trait]
impl NetworkRuleInstaller for MemoryInstaller {
    async fn ensure_forwarding(&self, ipv4: bool, ipv6: bool) -> NetworkResult<ForwardingReport> {
        let mut state = self.state.lock().await;
        Ok(ForwardingReport {
            ipv4: toggle(&mut state.ipv4_forwarding, ipv4),
            ipv6: toggle(&mut state.ipv6_forwarding, ipv6),
        })
    }

    async fn ensure_masquerade(&self, rule: &MasqueradeRule) -> NetworkResult<InstallOutcome> {
        let mut state = self.state.lock().await;
        if state.rules.insert(rule)? {
            state.inserts += 1;
            Ok(InstallOutcome::Inserted)
        } else {
            Ok(InstallOutcome::AlreadyPresent)
        }
    }

    async fn detect_egress(&self, probe: IpAddr) -> NetworkResult<String> {
        self.egress
            .clone()
            .ok_or(NetworkError::NoRouteFound { probe })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn behaves_like_a_host_table() {
        let installer = MemoryInstaller::new().with_egress("eth0");
        let rule = MasqueradeRule::new("10.8.0.0/24".parse().unwrap(), "eth0");

        assert_eq!(installer.detect_egress("8.8.8.8".parse().unwrap()).await.unwrap(), "eth0");
        assert_eq!(installer.ensure_masquerade(&rule).await.unwrap(), InstallOutcome::Inserted);
        assert_eq!(
            installer.ensure_masquerade(&rule).await.unwrap(),
            InstallOutcome::AlreadyPresent
        );
        assert_eq!(installer.count_matching(&rule).await, 1);

        installer.flush().await;
        assert_eq!(installer.ensure_masquerade(&rule).await.unwrap(), InstallOutcome::Inserted);
        assert_eq!(installer.inserts().await, 2);
    }

    #[tokio::test]
    async fn no_egress_configured() {
        let installer = MemoryInstaller::new();
        assert!(matches!(
            installer.detect_egress("8.8.8.8".parse().unwrap()).await,
            Err(NetworkError::NoRouteFound { .. })
        ));
    }

    #[tokio::test]
    async fn forwarding_flags() {
        let installer = MemoryInstaller::new();
        let report = installer.ensure_forwarding(true, false).await.unwrap();
        assert_eq!(report.ipv4, Toggle::Enabled);
        assert_eq!(report.ipv6, Toggle::NotRequested);
        assert_eq!(installer.forwarding().await, (true, false));
    }
}
