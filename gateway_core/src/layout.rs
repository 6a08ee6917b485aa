//! Persisted state layout under the gateway data directory.
//!
//! ```text
//! <data_dir>/
//!   server.conf      generated server configuration (bootstrap marker)
//!   identity.toml    server identity the configuration was generated from
//!   pki/             CA, server and client material (see `pki`)
//!   .pki.lock        advisory lock serialising client issuance
//! ```

use std::path::{Path, PathBuf};

/// File name of the generated server configuration, relative to the data dir.
pub const SERVER_CONFIG: &str = "server.conf";
/// File name of the persisted server identity.
pub const IDENTITY_FILE: &str = "identity.toml";
/// Directory holding PKI material, relative to the data dir.
pub const PKI_DIR: &str = "pki";
const PKI_LOCK: &str = ".pki.lock";

#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn server_config(&self) -> PathBuf {
        self.root.join(SERVER_CONFIG)
    }

    pub fn identity(&self) -> PathBuf {
        self.root.join(IDENTITY_FILE)
    }

    pub fn pki_dir(&self) -> PathBuf {
        self.root.join(PKI_DIR)
    }

    pub fn pki_lock(&self) -> PathBuf {
        self.root.join(PKI_LOCK)
    }

    /// Whether first-time initialization has already completed.
    ///
    /// The generated server configuration is the one and only marker; it is
    /// written last during initialization.
    pub fn is_initialized(&self) -> bool {
        self.server_config().is_file()
    }
}
