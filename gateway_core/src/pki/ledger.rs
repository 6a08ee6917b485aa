//! Issuance ledger persisted as `pki/index.json`.
//!
//! Append-only: forced re-issuance marks the previous entry as superseded
//! instead of dropping it.

use super::PkiError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertKind {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Active,
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub name: String,
    pub kind: CertKind,
    /// Hex SHA-256 of the certificate DER.
    pub fingerprint: String,
    /// Unix seconds.
    pub issued_at: i64,
    pub status: EntryStatus,
}

#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
        }
    }

    /// Load the ledger; a missing file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self, PkiError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::empty(path)),
            Err(source) => {
                return Err(PkiError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let entries = serde_json::from_slice(&bytes)?;
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn save(&self) -> Result<(), PkiError> {
        let json = serde_json::to_vec_pretty(&self.entries)?;
        crate::fsutil::write_atomic(&self.path, &json, 0o644).map_err(|source| PkiError::Io {
            path: self.path.clone(),
            source,
        })
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn active(&self, name: &str) -> Option<&LedgerEntry> {
        self.entries
            .iter()
            .find(|e| e.name == name && e.status == EntryStatus::Active)
    }

    pub fn active_clients(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries
            .iter()
            .filter(|e| e.kind == CertKind::Client && e.status == EntryStatus::Active)
    }

    pub fn record(&mut self, entry: LedgerEntry) {
        self.entries.push(entry);
    }

    /// Mark the active entry for `name` as superseded. Returns its fingerprint.
    pub fn supersede(&mut self, name: &str) -> Option<String> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.name == name && e.status == EntryStatus::Active)?;
        entry.status = EntryStatus::Superseded;
        Some(entry.fingerprint.clone())
    }
}
