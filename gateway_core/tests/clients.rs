use anyhow::Result;
use gateway_core::identity::ServerIdentity;
use gateway_core::pki::ledger::EntryStatus;
use gateway_core::pki::{PkiError, PkiStore};
use gateway_core::profile;
use shared_utils::config::{PassphrasePolicy, Protocol};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn identity() -> ServerIdentity {
    ServerIdentity {
        protocol: Protocol::Udp,
        endpoint: "203.0.113.5:1194".into(),
        tunnel_subnet: "10.8.0.0/24".into(),
        dns: vec!["1.1.1.1".parse().unwrap()],
        routes: Default::default(),
    }
}

fn initialized_store(root: &Path) -> Result<PkiStore> {
    let store = PkiStore::new(root.join("pki"));
    store.initialize(&identity(), PassphrasePolicy::None, None)?;
    Ok(store)
}

#[test]
fn duplicate_name_leaves_first_bundle_untouched() -> Result<()> {
    let dir = tempdir()?;
    let store = initialized_store(dir.path())?;

    store.issue_client("alice", false, None, &identity())?;
    let cert = fs::read(store.dir().join("issued/alice.crt"))?;
    let key = fs::read(store.dir().join("private/alice.key"))?;
    let ledger = fs::read(store.dir().join("index.json"))?;

    let err = store
        .issue_client("alice", false, None, &identity())
        .unwrap_err();
    assert!(matches!(err, PkiError::DuplicateClientName(ref n) if n == "alice"));

    assert_eq!(fs::read(store.dir().join("issued/alice.crt"))?, cert);
    assert_eq!(fs::read(store.dir().join("private/alice.key"))?, key);
    assert_eq!(fs::read(store.dir().join("index.json"))?, ledger);
    Ok(())
}

#[test]
fn forced_reissue_retires_previous_bundle() -> Result<()> {
    let dir = tempdir()?;
    let store = initialized_store(dir.path())?;

    let first = store.issue_client("alice", false, None, &identity())?;
    let bob = store.issue_client("bob", false, None, &identity())?;
    let bob_cert = fs::read(store.dir().join("issued/bob.crt"))?;

    let second = store.issue_client("alice", true, None, &identity())?;
    assert_ne!(second.fingerprint, first.fingerprint);
    assert_ne!(second.key_pem, first.key_pem);
    assert_eq!(second.ca_cert_pem, first.ca_cert_pem);

    // The old material is kept, not revoked.
    let retired: Vec<String> = fs::read_dir(store.dir().join("retired"))?
        .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<Result<_, _>>()?;
    assert_eq!(retired.len(), 2);
    assert!(retired.iter().all(|name| name.starts_with("alice-")));

    assert_eq!(fs::read(store.dir().join("issued/bob.crt"))?, bob_cert);
    assert_eq!(
        store.client_bundle("bob", &identity())?.fingerprint,
        bob.fingerprint
    );

    let ledger = store.ledger()?;
    let alice: Vec<_> = ledger
        .entries()
        .iter()
        .filter(|e| e.name == "alice")
        .collect();
    assert_eq!(alice.len(), 2);
    assert_eq!(alice[0].status, EntryStatus::Superseded);
    assert_eq!(alice[0].fingerprint, first.fingerprint);
    assert_eq!(alice[1].status, EntryStatus::Active);
    assert_eq!(ledger.active_clients().count(), 2);
    Ok(())
}

#[test]
fn issued_profile_is_self_contained() -> Result<()> {
    let dir = tempdir()?;
    let store = initialized_store(dir.path())?;
    let bundle = store.issue_client("laptop", false, None, &identity())?;

    let text = profile::render(&bundle)?;
    assert!(text.contains("remote 203.0.113.5 1194\n"));
    assert!(text.contains(&bundle.cert_pem));
    assert!(text.contains(bundle.key_pem.expose().trim_end()));
    assert!(text.contains("BEGIN OpenVPN Static key V1"));
    assert_eq!(text.matches("BEGIN CERTIFICATE").count(), 2);

    let again = profile::render(&store.client_bundle("laptop", &identity())?)?;
    assert_eq!(again, text);
    Ok(())
}

#[test]
fn path_like_names_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let store = initialized_store(dir.path())?;
    for name in ["../escape", "server", ".hidden", ""] {
        assert!(matches!(
            store.issue_client(name, false, None, &identity()),
            Err(PkiError::InvalidClientName { .. })
        ));
    }
    Ok(())
}
