use anyhow::Result;
use gateway_core::bootstrap::Controller;
use gateway_core::layout::StateLayout;
use gateway_core::netrules::{
    InstallOutcome, MasqueradeRule, MemoryInstaller, RulesFileInstaller, SysctlForwarding,
};
use shared_utils::config::{
    EgressInterface, EnvironmentInputs, FirewallBackend, HandoffMode, PassphrasePolicy, Protocol,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const BEFORE_RULES: &str = "\
#
# rules.before
#
# Rules that should be run before the ufw command line added rules.
#

# Don't delete these required lines, otherwise there will be errors
*filter
:ufw-before-input - [0:0]
:ufw-before-output - [0:0]
:ufw-before-forward - [0:0]
:ufw-not-local - [0:0]
# End required lines

# allow all on loopback
-A ufw-before-input -i lo -j ACCEPT
-A ufw-before-output -o lo -j ACCEPT

# drop INVALID packets (logs these in loglevel medium and higher)
-A ufw-before-input -m conntrack --ctstate INVALID -j ufw-logging-deny
-A ufw-before-input -m conntrack --ctstate INVALID -j DROP

# don't delete the 'COMMIT' line or these rules won't be processed
COMMIT
";

fn fake_proc(root: &Path) -> Result<()> {
    let v4 = root.join("sys/net/ipv4");
    fs::create_dir_all(&v4)?;
    fs::write(v4.join("ip_forward"), "0\n")?;
    Ok(())
}

fn inputs(data_dir: &Path, rules: &Path) -> EnvironmentInputs {
    EnvironmentInputs {
        protocol: Protocol::Udp,
        public_endpoint: "203.0.113.5:1194".into(),
        passphrase_policy: PassphrasePolicy::None,
        ca_passphrase: None,
        tunnel_subnet: "10.8.0.0/24".into(),
        egress_interface: EgressInterface::Named("eth0".into()),
        dns: vec!["1.1.1.1".parse().unwrap()],
        routes: Vec::new(),
        data_dir: data_dir.to_path_buf(),
        firewall: FirewallBackend::RulesFile(rules.to_path_buf()),
        ipv6_forwarding: false,
        server_bin: "openvpn".into(),
        handoff: HandoffMode::Supervise,
    }
}

#[tokio::test]
async fn masquerade_lands_before_filter_exactly_once() -> Result<()> {
    let dir = tempdir()?;
    let data = dir.path().join("data");
    let proc_root = dir.path().join("proc");
    let rules = dir.path().join("before.rules");
    fake_proc(&proc_root)?;
    fs::write(&rules, BEFORE_RULES)?;

    let live = Arc::new(MemoryInstaller::new());
    let installer = Arc::new(
        RulesFileInstaller::with_forwarding(&rules, SysctlForwarding::new(&proc_root))
            .with_live(live.clone()),
    );
    let ctl = Controller::new(StateLayout::new(&data), installer);
    let nat = MasqueradeRule::new("10.8.0.0/24".parse()?, "eth0");

    let first = ctl.bootstrap(&inputs(&data, &rules)).await?;
    assert_eq!(first.masquerade, InstallOutcome::Inserted);
    assert_eq!(
        fs::read_to_string(proc_root.join("sys/net/ipv4/ip_forward"))?,
        "1\n"
    );

    let text = fs::read_to_string(&rules)?;
    let rule = "-A POSTROUTING -s 10.8.0.0/24 -o eth0 -j MASQUERADE\n";
    assert_eq!(text.matches(rule).count(), 1);
    assert!(text.find("*nat\n").unwrap() < text.find("*filter\n").unwrap());

    // Taking the inserted block out gives back the original file.
    let block = format!(
        "# NAT for the vpngate tunnel subnet\n*nat\n:POSTROUTING ACCEPT [0:0]\n{rule}COMMIT\n\n"
    );
    assert_eq!(text.replacen(&block, "", 1), BEFORE_RULES);

    // The rule is active before handoff, not only on disk.
    assert_eq!(live.count_matching(&nat).await, 1);

    let second = ctl.bootstrap(&inputs(&data, &rules)).await?;
    assert_eq!(second.masquerade, InstallOutcome::AlreadyPresent);
    assert_eq!(fs::read_to_string(&rules)?, text);
    assert_eq!(live.inserts().await, 1);
    Ok(())
}

#[tokio::test]
async fn firewall_reload_without_file_change_reapplies_rule() -> Result<()> {
    let dir = tempdir()?;
    let data = dir.path().join("data");
    let proc_root = dir.path().join("proc");
    let rules = dir.path().join("before.rules");
    fake_proc(&proc_root)?;
    fs::write(&rules, BEFORE_RULES)?;

    let live = Arc::new(MemoryInstaller::new());
    let installer = Arc::new(
        RulesFileInstaller::with_forwarding(&rules, SysctlForwarding::new(&proc_root))
            .with_live(live.clone()),
    );
    let ctl = Controller::new(StateLayout::new(&data), installer);
    ctl.bootstrap(&inputs(&data, &rules)).await?;
    let text = fs::read_to_string(&rules)?;

    live.flush().await;
    let report = ctl.bootstrap(&inputs(&data, &rules)).await?;
    assert_eq!(report.masquerade, InstallOutcome::Inserted);
    assert_eq!(fs::read_to_string(&rules)?, text);
    assert_eq!(
        live.count_matching(&MasqueradeRule::new("10.8.0.0/24".parse()?, "eth0")).await,
        1
    );
    Ok(())
}
