use crate::cli::Command;
use anyhow::{Context, Result, anyhow};
use gateway_core::bootstrap::{BootstrapError, Controller};
use gateway_core::fsutil::write_atomic;
use gateway_core::identity::ServerIdentity;
use gateway_core::layout::StateLayout;
use gateway_core::netrules::build_installer;
use gateway_core::pki::ledger::LedgerEntry;
use gateway_core::pki::{PkiError, PkiStatus, PkiStore};
use gateway_core::profile;
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use shared_utils::config::Settings;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info};

/// Execute `command`. The returned code becomes the process exit status.
pub async fn dispatch(command: Command, settings: &Settings) -> Result<i32> {
    match command {
        Command::Run => run(settings).await,
        Command::IssueClient {
            name,
            force,
            output,
        } => issue_client(settings, &name, force, output.as_deref()),
        Command::GetClient { name, output } => get_client(settings, &name, output.as_deref()),
        Command::ListClients { json } => list_clients(settings, json),
        Command::Status { json } => status(settings, json),
    }
}

async fn run(settings: &Settings) -> Result<i32> {
    let inputs = settings.to_inputs().map_err(BootstrapError::from)?;
    let controller = Controller::new(
        StateLayout::new(&inputs.data_dir),
        build_installer(&inputs.firewall),
    );
    Ok(controller.run(&inputs).await?)
}

/// Issuance lock on `<data_dir>/.pki.lock`, held until dropped.
fn lock_pki(layout: &StateLayout, arg: FlockArg) -> Result<Flock<File>> {
    let path = layout.pki_lock();
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .mode(0o600)
        .open(&path)
        .with_context(|| format!("failed to open lock file {}", path.display()))?;
    debug!(path = %path.display(), "waiting for PKI lock");
    Flock::lock(file, arg).map_err(|(_, errno)| anyhow!("failed to lock {}: {errno}", path.display()))
}

/// Identity of an initialized gateway.
fn load_identity(layout: &StateLayout) -> Result<ServerIdentity> {
    if !layout.is_initialized() {
        return Err(BootstrapError::from(PkiError::NotInitialized(layout.root().to_path_buf())).into());
    }
    Ok(ServerIdentity::load(&layout.identity()).map_err(BootstrapError::from)?)
}

fn emit_profile(text: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            write_atomic(path, text.as_bytes(), 0o600)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "wrote client profile");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn issue_client(settings: &Settings, name: &str, force: bool, output: Option<&Path>) -> Result<i32> {
    let layout = StateLayout::new(settings.data_dir());
    let identity = load_identity(&layout)?;
    let _lock = lock_pki(&layout, FlockArg::LockExclusive)?;

    let store = PkiStore::new(layout.pki_dir());
    let bundle = store
        .issue_client(name, force, settings.passphrase().as_ref(), &identity)
        .map_err(BootstrapError::from)?;
    let text = profile::render(&bundle).map_err(BootstrapError::from)?;
    emit_profile(&text, output)?;
    Ok(0)
}

fn get_client(settings: &Settings, name: &str, output: Option<&Path>) -> Result<i32> {
    let layout = StateLayout::new(settings.data_dir());
    let identity = load_identity(&layout)?;
    let _lock = lock_pki(&layout, FlockArg::LockShared)?;

    let bundle = PkiStore::new(layout.pki_dir())
        .client_bundle(name, &identity)
        .map_err(BootstrapError::from)?;
    let text = profile::render(&bundle).map_err(BootstrapError::from)?;
    emit_profile(&text, output)?;
    Ok(0)
}

fn format_time(unix: i64) -> String {
    OffsetDateTime::from_unix_timestamp(unix)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| unix.to_string())
}

fn list_clients(settings: &Settings, json: bool) -> Result<i32> {
    let layout = StateLayout::new(settings.data_dir());
    load_identity(&layout)?;
    let ledger = PkiStore::new(layout.pki_dir())
        .ledger()
        .map_err(BootstrapError::from)?;
    let clients: Vec<&LedgerEntry> = ledger.active_clients().collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&clients)?);
        return Ok(0);
    }
    if clients.is_empty() {
        println!("no clients issued");
        return Ok(0);
    }
    println!("{:<24} {:<25} FINGERPRINT", "NAME", "ISSUED");
    for entry in clients {
        println!(
            "{:<24} {:<25} {}",
            entry.name,
            format_time(entry.issued_at),
            entry.fingerprint
        );
    }
    Ok(0)
}

#[derive(Debug, Serialize)]
struct StatusReport {
    data_dir: PathBuf,
    initialized: bool,
    pki: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pki_missing: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    identity: Option<ServerIdentity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ca_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ca_key_sealed: Option<bool>,
    clients: usize,
}

fn collect_status(layout: &StateLayout) -> Result<StatusReport> {
    let store = PkiStore::new(layout.pki_dir());
    let pki_status = store.status().map_err(BootstrapError::from)?;
    let mut report = StatusReport {
        data_dir: layout.root().to_path_buf(),
        initialized: layout.is_initialized(),
        pki: "empty",
        pki_missing: Vec::new(),
        identity: None,
        ca_fingerprint: None,
        ca_key_sealed: None,
        clients: 0,
    };

    match pki_status {
        PkiStatus::Empty => {}
        PkiStatus::Partial { missing } => {
            report.pki = "partial";
            report.pki_missing = missing;
        }
        PkiStatus::Complete => {
            let state = store.state().map_err(BootstrapError::from)?;
            report.pki = "complete";
            report.ca_fingerprint = Some(state.ca_fingerprint);
            report.ca_key_sealed = Some(state.ca_key_sealed);
            report.clients = state.clients.len();
        }
    }
    if layout.identity().is_file() {
        report.identity = Some(ServerIdentity::load(&layout.identity()).map_err(BootstrapError::from)?);
    }
    Ok(report)
}

fn status(settings: &Settings, json: bool) -> Result<i32> {
    let report = collect_status(&StateLayout::new(settings.data_dir()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(0);
    }

    println!("data dir:     {}", report.data_dir.display());
    println!("initialized:  {}", if report.initialized { "yes" } else { "no" });
    if report.pki_missing.is_empty() {
        println!("pki:          {}", report.pki);
    } else {
        println!("pki:          {} (missing {})", report.pki, report.pki_missing.join(", "));
    }
    if let Some(identity) = &report.identity {
        println!("endpoint:     {}://{}", identity.protocol, identity.endpoint);
        println!("subnet:       {}", identity.tunnel_subnet);
    }
    if let Some(fp) = &report.ca_fingerprint {
        println!("ca sha256:    {fp}");
    }
    if let Some(sealed) = report.ca_key_sealed {
        println!("ca key:       {}", if sealed { "sealed" } else { "plaintext" });
    }
    println!("clients:      {}", report.clients);
    Ok(0)
}
