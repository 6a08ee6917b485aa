//! On-disk PKI store: certificate authority, server identity and issued
//! client certificates.
//!
//! ```text
//! pki/
//!   ca.crt
//!   ta.key                      tls-auth static key
//!   index.json                  issuance ledger
//!   private/ca.key              or private/ca.key.sealed with a passphrase
//!   private/server.key
//!   private/<client>.key
//!   issued/server.crt
//!   issued/<client>.crt
//!   retired/                    superseded client material
//! ```
//!
//! The CA key exists if and only if any certificate exists. Initialization
//! builds the whole tree in a staging directory and renames it into place,
//! so a crash never leaves a half-initialized store behind.

mod certs;
pub mod ledger;
mod tls_auth;

use crate::configgen;
use crate::fsutil::{create_private_dir, write_new};
use crate::identity::ServerIdentity;
use ledger::{CertKind, EntryStatus, Ledger, LedgerEntry};
use shared_utils::config::{PassphrasePolicy, Secret};
use shared_utils::crypto::{self, SealError};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const CA_CERT: &str = "ca.crt";
pub const CA_KEY: &str = "private/ca.key";
pub const CA_KEY_SEALED: &str = "private/ca.key.sealed";
pub const SERVER_CERT: &str = "issued/server.crt";
pub const SERVER_KEY: &str = "private/server.key";
pub const TLS_AUTH_KEY: &str = "ta.key";
pub const LEDGER_FILE: &str = "index.json";

const PRIVATE_DIR: &str = "private";
const ISSUED_DIR: &str = "issued";
const RETIRED_DIR: &str = "retired";
const SERVER_NAME: &str = "server";
const RESERVED_NAMES: &[&str] = &[SERVER_NAME, "ca"];
const MAX_CLIENT_NAME_LEN: usize = 64;

/// Shortest passphrase accepted for sealing the CA key.
pub const MIN_PASSPHRASE_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("PKI already initialized at {0}")]
    AlreadyInitialized(PathBuf),

    #[error("PKI at {0} is not initialized")]
    NotInitialized(PathBuf),

    #[error("PKI at {dir} is incomplete, missing: {missing}")]
    Incomplete { dir: PathBuf, missing: String },

    #[error("weak CA passphrase: {0}")]
    WeakPassphrase(String),

    #[error("the CA key is sealed; set VPNGATE_CA_PASSPHRASE to use it")]
    PassphraseRequired,

    #[error("client {0:?} already has a certificate; use --force to re-issue")]
    DuplicateClientName(String),

    #[error("invalid client name {name:?}: {reason}")]
    InvalidClientName { name: String, reason: String },

    #[error("no active certificate for client {0:?}")]
    UnknownClient(String),

    #[error("invalid server identity: {0}")]
    InvalidIdentity(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("CA key: {0}")]
    Seal(#[from] SealError),

    #[error("issuance ledger is corrupt: {0}")]
    Ledger(#[from] serde_json::Error),

    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> PkiError + '_ {
    move |source| PkiError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Result type for PKI operations
pub type PkiResult<T> = Result<T, PkiError>;

/// What the store currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PkiStatus {
    Empty,
    Complete,
    /// Some material exists but the store is unusable.
    Partial { missing: Vec<&'static str> },
}

/// Snapshot of an initialized store. Contains no private key material.
#[derive(Debug, Clone)]
pub struct PkiState {
    pub ca_cert_pem: String,
    pub ca_fingerprint: String,
    pub ca_key_sealed: bool,
    pub server_cert_pem: String,
    pub server_fingerprint: String,
    pub clients: Vec<LedgerEntry>,
}

/// Everything a client needs to connect, in one place.
#[derive(Debug, Clone)]
pub struct ClientBundle {
    pub name: String,
    pub key_pem: Secret,
    pub cert_pem: String,
    pub ca_cert_pem: String,
    pub tls_auth_key: Secret,
    pub fingerprint: String,
    pub identity: ServerIdentity,
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Reject names that would escape the PKI directories or clash with
/// server material.
pub fn validate_client_name(name: &str) -> PkiResult<()> {
    let invalid = |reason: &str| {
        Err(PkiError::InvalidClientName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };
    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.len() > MAX_CLIENT_NAME_LEN {
        return invalid("name is longer than 64 characters");
    }
    if name.starts_with('.') || name.starts_with('-') {
        return invalid("name must not start with '.' or '-'");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return invalid("only letters, digits, '.', '_' and '-' are allowed");
    }
    if RESERVED_NAMES.contains(&name) {
        return invalid("name is reserved");
    }
    Ok(())
}

fn check_passphrase(
    policy: PassphrasePolicy,
    passphrase: Option<&Secret>,
) -> PkiResult<Option<&Secret>> {
    match (policy, passphrase) {
        (_, Some(p)) if p.len() < MIN_PASSPHRASE_LEN => Err(PkiError::WeakPassphrase(format!(
            "must be at least {MIN_PASSPHRASE_LEN} characters"
        ))),
        (PassphrasePolicy::Required, None) => Err(PkiError::WeakPassphrase(
            "policy requires a CA passphrase but none was supplied".to_string(),
        )),
        (_, p) => Ok(p),
    }
}

#[derive(Debug, Clone)]
pub struct PkiStore {
    dir: PathBuf,
}

impl PkiStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.join(rel)
    }

    fn staging_dir(&self) -> PathBuf {
        let mut name = OsString::from(".");
        name.push(self.dir.file_name().unwrap_or_default());
        name.push("-staging");
        self.dir.with_file_name(name)
    }

    fn client_cert(&self, name: &str) -> PathBuf {
        self.dir.join(ISSUED_DIR).join(format!("{name}.crt"))
    }

    fn client_key(&self, name: &str) -> PathBuf {
        self.dir.join(PRIVATE_DIR).join(format!("{name}.key"))
    }

    fn any_issued_cert(&self) -> PkiResult<bool> {
        let issued = self.dir.join(ISSUED_DIR);
        let entries = match fs::read_dir(&issued) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(io_err(&issued)(err)),
        };
        for entry in entries {
            let entry = entry.map_err(io_err(&issued))?;
            if entry.path().extension().is_some_and(|ext| ext == "crt") {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Classify what is on disk.
    /// A truncated or garbled `ta.key` counts as missing.
    pub fn status(&self) -> PkiResult<PkiStatus> {
        let ca_key_present = self.path(CA_KEY).is_file() || self.path(CA_KEY_SEALED).is_file();
        let ta_key = self.path(TLS_AUTH_KEY);
        let ta_key_valid = fs::read_to_string(&ta_key).is_ok_and(|text| tls_auth::is_valid(&text));
        let checks: [(&'static str, bool); 5] = [
            (CA_CERT, self.path(CA_CERT).is_file()),
            (CA_KEY, ca_key_present),
            (SERVER_CERT, self.path(SERVER_CERT).is_file()),
            (SERVER_KEY, self.path(SERVER_KEY).is_file()),
            (TLS_AUTH_KEY, ta_key_valid),
        ];

        let missing: Vec<&'static str> = checks
            .iter()
            .filter(|(_, present)| !present)
            .map(|(name, _)| *name)
            .collect();

        if missing.is_empty() {
            return Ok(PkiStatus::Complete);
        }
        if missing.len() == checks.len() && !ta_key.exists() && !self.any_issued_cert()? {
            return Ok(PkiStatus::Empty);
        }
        Ok(PkiStatus::Partial { missing })
    }

    /// Whether any CA or certificate material exists.
    pub fn has_state(&self) -> PkiResult<bool> {
        Ok(self.status()? != PkiStatus::Empty)
    }

    fn require_complete(&self) -> PkiResult<()> {
        match self.status()? {
            PkiStatus::Complete => Ok(()),
            PkiStatus::Empty => Err(PkiError::NotInitialized(self.dir.clone())),
            PkiStatus::Partial { missing } => Err(PkiError::Incomplete {
                dir: self.dir.clone(),
                missing: missing.join(", "),
            }),
        }
    }

    /// Create the CA, the server certificate and the tls-auth key.
    pub fn initialize(
        &self,
        identity: &ServerIdentity,
        policy: PassphrasePolicy,
        passphrase: Option<&Secret>,
    ) -> PkiResult<PkiState> {
        if self.has_state()? {
            return Err(PkiError::AlreadyInitialized(self.dir.clone()));
        }
        let passphrase = check_passphrase(policy, passphrase)?;
        let endpoint = configgen::parse_endpoint(&identity.endpoint)
            .map_err(|e| PkiError::InvalidIdentity(e.to_string()))?;

        let (ca, ca_pair) = certs::new_ca(&format!("vpngate CA {}", endpoint.host))?;
        let server = certs::issue_leaf(
            &ca,
            SERVER_NAME,
            certs::LeafRole::Server,
            Some(&endpoint.host),
        )?;
        let (ca_key_file, ca_key_bytes) = match passphrase {
            Some(p) => (CA_KEY_SEALED, crypto::seal(p.expose(), ca_pair.key_pem.as_bytes())?),
            None => (CA_KEY, ca_pair.key_pem.clone().into_bytes()),
        };

        let staging = self.staging_dir();
        if staging.exists() {
            debug!(path = %staging.display(), "removing leftover PKI staging directory");
            fs::remove_dir_all(&staging).map_err(io_err(&staging))?;
        }
        create_private_dir(&staging.join(PRIVATE_DIR)).map_err(io_err(&staging))?;
        for dir in [ISSUED_DIR, RETIRED_DIR] {
            fs::create_dir_all(staging.join(dir)).map_err(io_err(&staging))?;
        }

        let tls_key = tls_auth::generate();
        let files: [(&str, &[u8], u32); 5] = [
            (CA_CERT, ca_pair.cert_pem.as_bytes(), 0o644),
            (ca_key_file, &ca_key_bytes, 0o600),
            (SERVER_CERT, server.cert_pem.as_bytes(), 0o644),
            (SERVER_KEY, server.key_pem.as_bytes(), 0o600),
            (TLS_AUTH_KEY, tls_key.as_bytes(), 0o600),
        ];
        for (rel, contents, mode) in files {
            let path = staging.join(rel);
            write_new(&path, contents, mode).map_err(io_err(&path))?;
        }

        let mut ledger = Ledger::empty(staging.join(LEDGER_FILE));
        ledger.record(LedgerEntry {
            name: SERVER_NAME.to_string(),
            kind: CertKind::Server,
            fingerprint: server.fingerprint.clone(),
            issued_at: now_unix(),
            status: EntryStatus::Active,
        });
        ledger.save()?;

        // Renaming onto an existing empty directory is allowed; anything
        // else in the way makes this fail instead of clobbering it.
        fs::rename(&staging, &self.dir).map_err(io_err(&self.dir))?;

        info!(
            path = %self.dir.display(),
            ca_fingerprint = %ca_pair.fingerprint,
            sealed = passphrase.is_some(),
            "initialized PKI"
        );
        self.state()
    }

    /// Read the current store contents.
    pub fn state(&self) -> PkiResult<PkiState> {
        self.require_complete()?;
        let ca_cert_pem = self.read_string(CA_CERT)?;
        let server_cert_pem = self.read_string(SERVER_CERT)?;
        let ledger = self.ledger()?;
        Ok(PkiState {
            ca_fingerprint: certs::fingerprint_pem(&ca_cert_pem)?,
            server_fingerprint: certs::fingerprint_pem(&server_cert_pem)?,
            ca_cert_pem,
            server_cert_pem,
            ca_key_sealed: self.path(CA_KEY_SEALED).is_file(),
            clients: ledger.active_clients().cloned().collect(),
        })
    }

    pub fn ledger(&self) -> PkiResult<Ledger> {
        Ledger::load(&self.path(LEDGER_FILE))
    }

    fn read_string(&self, rel: &str) -> PkiResult<String> {
        let path = self.path(rel);
        fs::read_to_string(&path).map_err(io_err(&path))
    }

    fn read_ca_key(&self, passphrase: Option<&Secret>) -> PkiResult<String> {
        let sealed = self.path(CA_KEY_SEALED);
        if !sealed.is_file() {
            return self.read_string(CA_KEY);
        }
        let passphrase = passphrase.ok_or(PkiError::PassphraseRequired)?;
        let bytes = fs::read(&sealed).map_err(io_err(&sealed))?;
        let key = crypto::open(passphrase.expose(), &bytes)?;
        String::from_utf8(key)
            .map_err(|_| PkiError::Certificate("CA key is not valid PEM".to_string()))
    }

    /// Move the client's files to `retired/<name>-<tag>.{crt,key}`.
    fn retire(&self, name: &str, tag: &str) -> PkiResult<()> {
        let retired = self.dir.join(RETIRED_DIR);
        fs::create_dir_all(&retired).map_err(io_err(&retired))?;
        for (from, ext) in [(self.client_cert(name), "crt"), (self.client_key(name), "key")] {
            if from.exists() {
                let to = retired.join(format!("{name}-{tag}.{ext}"));
                fs::rename(&from, &to).map_err(io_err(&from))?;
            }
        }
        Ok(())
    }

    /// Issue a certificate for a new client.
    ///
    /// An existing name is rejected unless `force` is set, in which case the
    /// previous material is moved to `retired/` and superseded in the ledger.
    /// It is not revoked.
    pub fn issue_client(
        &self,
        name: &str,
        force: bool,
        passphrase: Option<&Secret>,
        identity: &ServerIdentity,
    ) -> PkiResult<ClientBundle> {
        validate_client_name(name)?;
        self.require_complete()?;

        let mut ledger = self.ledger()?;
        let cert_path = self.client_cert(name);
        let key_path = self.client_key(name);
        let exists = ledger.active(name).is_some() || cert_path.exists() || key_path.exists();
        if exists && !force {
            return Err(PkiError::DuplicateClientName(name.to_string()));
        }

        // Sign before touching anything so a bad passphrase leaves the old
        // bundle in place.
        let ca_cert_pem = self.read_string(CA_CERT)?;
        let ca = certs::load_ca(&ca_cert_pem, &self.read_ca_key(passphrase)?)?;
        let pair = certs::issue_leaf(&ca, name, certs::LeafRole::Client, None)?;

        if exists {
            let previous = match ledger.supersede(name) {
                Some(fp) => Some(fp),
                None if cert_path.is_file() => Some(certs::fingerprint_pem(
                    &fs::read_to_string(&cert_path).map_err(io_err(&cert_path))?,
                )?),
                None => None,
            };
            match previous {
                Some(fp) => {
                    let tag: String = fp.chars().take(16).collect();
                    self.retire(name, &tag)?;
                    info!(client = name, fingerprint = %fp, "retired previous client certificate");
                }
                None => {
                    // Key left behind by an issuance that never wrote its certificate.
                    self.retire(name, &format!("incomplete-{}", now_unix()))?;
                    warn!(client = name, "retired leftover client key without certificate");
                }
            }
        }

        write_new(&key_path, pair.key_pem.as_bytes(), 0o600).map_err(io_err(&key_path))?;
        if let Err(err) = write_new(&cert_path, pair.cert_pem.as_bytes(), 0o644) {
            let _ = fs::remove_file(&key_path);
            return Err(io_err(&cert_path)(err));
        }

        ledger.record(LedgerEntry {
            name: name.to_string(),
            kind: CertKind::Client,
            fingerprint: pair.fingerprint.clone(),
            issued_at: now_unix(),
            status: EntryStatus::Active,
        });
        ledger.save()?;
        info!(client = name, fingerprint = %pair.fingerprint, "issued client certificate");

        Ok(ClientBundle {
            name: name.to_string(),
            key_pem: Secret::new(pair.key_pem),
            cert_pem: pair.cert_pem,
            ca_cert_pem,
            tls_auth_key: Secret::new(self.read_string(TLS_AUTH_KEY)?),
            fingerprint: pair.fingerprint,
            identity: identity.clone(),
        })
    }

    /// Bundle for a client that was issued earlier.
    pub fn client_bundle(&self, name: &str, identity: &ServerIdentity) -> PkiResult<ClientBundle> {
        validate_client_name(name)?;
        self.require_complete()?;

        let ledger = self.ledger()?;
        let cert_path = self.client_cert(name);
        let key_path = self.client_key(name);
        if ledger.active(name).is_none() || !cert_path.is_file() || !key_path.is_file() {
            return Err(PkiError::UnknownClient(name.to_string()));
        }

        let cert_pem = fs::read_to_string(&cert_path).map_err(io_err(&cert_path))?;
        let key_pem = fs::read_to_string(&key_path).map_err(io_err(&key_path))?;
        Ok(ClientBundle {
            name: name.to_string(),
            fingerprint: certs::fingerprint_pem(&cert_pem)?,
            key_pem: Secret::new(key_pem),
            cert_pem,
            ca_cert_pem: self.read_string(CA_CERT)?,
            tls_auth_key: Secret::new(self.read_string(TLS_AUTH_KEY)?),
            identity: identity.clone(),
        })
    }
}
