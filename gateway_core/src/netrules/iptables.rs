use super::{
    ForwardingReport, InstallOutcome, MasqueradeRule, NetworkError, NetworkResult,
    NetworkRuleInstaller, RuleSet, SysctlForwarding,
};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tokio::process::Command as TokioCommand;
use tracing::{debug, info};

async fn run_command(command: &str, args: &[&str]) -> NetworkResult<String> {
    debug!(cmd = command, ?args, "running network command");
    let output = TokioCommand::new(command)
        .args(args)
        .output()
        .await
        .map_err(NetworkError::from)?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(NetworkError::CommandFailure {
            command: format!("{} {}", command, args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Extract the device from `ip -o route get` output.
pub fn parse_route_get(output: &str) -> Option<String> {
    let line = output.lines().next()?;
    let first = line.split_whitespace().next()?;
    if matches!(first, "unreachable" | "prohibit" | "blackhole" | "throw") {
        return None;
    }
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "dev" {
            return tokens.next().map(str::to_string);
        }
    }
    None
}

/// Resolve the interface the kernel would use to reach `probe`.
async fn route_get_device(probe: IpAddr) -> NetworkResult<String> {
    let probe_arg = probe.to_string();
    let family = if probe.is_ipv6() { "-6" } else { "-4" };
    let output = match run_command("ip", &[family, "-o", "route", "get", &probe_arg]).await {
        Ok(output) => output,
        Err(NetworkError::CommandFailure { stderr, .. }) => {
            debug!(%probe, %stderr, "route lookup failed");
            return Err(NetworkError::NoRouteFound { probe });
        }
        Err(err) => return Err(err),
    };
    parse_route_get(&output).ok_or(NetworkError::NoRouteFound { probe })
}

/// Installs rules into the live kernel tables via the iptables tools.
#[derive(Debug, Default)]
pub struct IptablesInstaller {
    forwarding: SysctlForwarding,
}

impl IptablesInstaller {
    pub fn new(forwarding: SysctlForwarding) -> Self {
        Self { forwarding }
    }

    fn tools(subnet: &IpNetwork) -> (&'static str, &'static str) {
        match subnet {
            IpNetwork::V4(_) => ("iptables", "iptables-save"),
            IpNetwork::V6(_) => ("ip6tables", "ip6tables-save"),
        }
    }
}

#[async_trait]
impl NetworkRuleInstaller for IptablesInstaller {
    async fn ensure_forwarding(&self, ipv4: bool, ipv6: bool) -> NetworkResult<ForwardingReport> {
        self.forwarding.ensure(ipv4, ipv6).await
    }

    async fn ensure_masquerade(&self, rule: &MasqueradeRule) -> NetworkResult<InstallOutcome> {
        let (iptables, save) = Self::tools(&rule.subnet);
        let current = RuleSet::parse(&run_command(save, &["-t", "nat"]).await?);
        if current.contains(rule) {
            debug!(subnet = %rule.subnet, interface = %rule.egress, "masquerade rule already present");
            return Ok(InstallOutcome::AlreadyPresent);
        }

        let match_args = rule.match_args();
        let mut args = vec!["-t", "nat", "-I", "POSTROUTING", "1"];
        args.extend(match_args.iter().map(String::as_str));
        run_command(iptables, &args).await?;
        info!(subnet = %rule.subnet, interface = %rule.egress, "inserted masquerade rule");
        Ok(InstallOutcome::Inserted)
    }

    async fn detect_egress(&self, probe: IpAddr) -> NetworkResult<String> {
        route_get_device(probe).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_get_output() {
        assert_eq!(
            parse_route_get(
                "8.8.8.8 via 192.168.1.1 dev eth0 src 192.168.1.20 uid 0 \\    cache \n"
            )
            .as_deref(),
            Some("eth0")
        );
        assert_eq!(
            parse_route_get("10.0.0.9 dev wg0 src 10.0.0.1 uid 1000 \\    cache").as_deref(),
            Some("wg0")
        );
        assert_eq!(parse_route_get("unreachable 8.8.8.8 uid 0 \\    cache"), None);
        assert_eq!(parse_route_get(""), None);
    }

    #[test]
    fn tool_selection_follows_family() {
        assert_eq!(
            IptablesInstaller::tools(&"10.8.0.0/24".parse().unwrap()).0,
            "iptables"
        );
        assert_eq!(
            IptablesInstaller::tools(&"fd00::/64".parse().unwrap()).1,
            "ip6tables-save"
        );
    }
}
