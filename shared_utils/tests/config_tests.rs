use shared_utils::config::{
    ConfigError, EgressInterface, FirewallBackend, HandoffMode, PassphrasePolicy, Protocol,
    Settings,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn test_load_settings_file() {
    let mut file = NamedTempFile::new().unwrap();

    let config_str = r#"
        protocol = "tcp"
        public_endpoint = "vpn.example.com:443"
        ca_passphrase_policy = "required"
        tunnel_subnet = "10.9.0.0/24"
        egress_interface = "auto"
        dns = ["1.1.1.1", "1.0.0.1"]
        routes = ["192.168.10.0/24"]
        data_dir = "/srv/vpngate"
        firewall = "rules-file:/etc/ufw/before.rules"
        handoff = "exec"

        [log]
        level = "debug"
        json = true
    "#;

    file.write_all(config_str.as_bytes()).unwrap();

    let settings = Settings::load(file.path()).unwrap();
    assert_eq!(settings.log.level, "debug");
    assert!(settings.log.json);

    let inputs = settings.to_inputs().unwrap();
    assert_eq!(inputs.protocol, Protocol::Tcp);
    assert_eq!(inputs.public_endpoint, "vpn.example.com:443");
    assert_eq!(inputs.passphrase_policy, PassphrasePolicy::Required);
    assert!(inputs.ca_passphrase.is_none());
    assert_eq!(inputs.egress_interface, EgressInterface::Auto);
    assert_eq!(inputs.routes, vec!["192.168.10.0/24".to_string()]);
    assert_eq!(inputs.data_dir, PathBuf::from("/srv/vpngate"));
    assert_eq!(
        inputs.firewall,
        FirewallBackend::RulesFile(PathBuf::from("/etc/ufw/before.rules"))
    );
    assert_eq!(inputs.handoff, HandoffMode::Exec);
}

#[test]
fn test_environment_overrides_file() {
    let mut file = NamedTempFile::new().unwrap();
    let config_str = r#"
        protocol = "tcp"
        public_endpoint = "vpn.example.com"
        ca_passphrase_policy = "none"
        tunnel_subnet = "10.9.0.0/24"
        egress_interface = "eth1"
        dns = ["1.1.1.1"]
    "#;
    file.write_all(config_str.as_bytes()).unwrap();
    let path = file.path().to_string_lossy().to_string();

    let settings = Settings::from_lookup(env(&[
        ("VPNGATE_CONFIG", path.as_str()),
        ("VPNGATE_PROTOCOL", "udp"),
        ("VPNGATE_EGRESS_INTERFACE", "ens3"),
        ("VPNGATE_CA_PASSPHRASE", "s3cret-pass"),
        ("VPNGATE_IPV6_FORWARDING", "true"),
    ]))
    .unwrap();

    let inputs = settings.to_inputs().unwrap();
    assert_eq!(inputs.protocol, Protocol::Udp);
    assert_eq!(inputs.public_endpoint, "vpn.example.com");
    assert_eq!(inputs.egress_interface, EgressInterface::Named("ens3".into()));
    assert_eq!(
        inputs.ca_passphrase.as_ref().map(|s| s.expose()),
        Some("s3cret-pass")
    );
    assert!(inputs.ipv6_forwarding);
}

#[test]
fn test_missing_settings_file() {
    let result = Settings::from_lookup(env(&[("VPNGATE_CONFIG", "/nonexistent/vpngate.toml")]));
    assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
}

#[test]
fn test_malformed_settings_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"protocol = [udp").unwrap();
    assert!(matches!(
        Settings::load(file.path()),
        Err(ConfigError::TomlError(_))
    ));
}

#[test]
fn test_empty_environment_reports_protocol_first() {
    let settings =
        Settings::from_lookup_or(env(&[]), Path::new("/nonexistent/vpngate.toml")).unwrap();
    match settings.to_inputs() {
        Err(ConfigError::MissingValue(field)) => assert_eq!(field, "protocol"),
        other => panic!("expected MissingValue, got {other:?}"),
    }
}

#[test]
fn test_settings_save_and_reload() {
    let settings = Settings::from_lookup(env(&[
        ("VPNGATE_PROTOCOL", "udp"),
        ("VPNGATE_DNS", "9.9.9.9"),
        ("VPNGATE_CA_PASSPHRASE", "never-written"),
    ]))
    .unwrap();

    let file = NamedTempFile::new().unwrap();
    settings.save(file.path()).unwrap();

    let written = std::fs::read_to_string(file.path()).unwrap();
    assert!(!written.contains("never-written"));

    let loaded = Settings::load(file.path()).unwrap();
    assert_eq!(loaded.protocol.as_deref(), Some("udp"));
    assert_eq!(loaded.dns, Some(vec!["9.9.9.9".to_string()]));
    assert!(loaded.ca_passphrase.is_none());
}

#[test]
fn test_fallback_file_used_without_config_variable() {
    let dir = tempfile::tempdir().unwrap();
    let fallback = dir.path().join("vpngate.toml");
    std::fs::write(&fallback, "protocol = \"tcp\"\ntunnel_subnet = \"10.7.0.0/24\"\n").unwrap();

    let settings =
        Settings::from_lookup_or(env(&[("VPNGATE_PROTOCOL", "udp")]), &fallback).unwrap();
    assert_eq!(settings.protocol.as_deref(), Some("udp"));
    assert_eq!(settings.tunnel_subnet.as_deref(), Some("10.7.0.0/24"));

    // An explicit VPNGATE_CONFIG wins over the fallback.
    let mut other = NamedTempFile::new().unwrap();
    other.write_all(b"tunnel_subnet = \"10.6.0.0/24\"\n").unwrap();
    let path = other.path().to_string_lossy().to_string();
    let settings = Settings::from_lookup_or(env(&[("VPNGATE_CONFIG", path.as_str())]), &fallback)
        .unwrap();
    assert_eq!(settings.tunnel_subnet.as_deref(), Some("10.6.0.0/24"));
    assert!(settings.protocol.is_none());
}

#[test]
fn test_default_path_names_vpngate_toml() {
    let path = Settings::default_path();
    assert!(path.ends_with("vpngate.toml"));
}
