//! The server identity every generated artifact derives from.

use serde::{Deserialize, Serialize};
use shared_utils::config::{EnvironmentInputs, Protocol};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to access identity file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to parse identity file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize identity: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Public face of the gateway: how clients reach it and what it pushes to
/// them. Created once at first boot and never rewritten afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub protocol: Protocol,
    /// `host` or `host:port` exactly as configured.
    pub endpoint: String,
    pub tunnel_subnet: String,
    /// Resolvers in push order.
    pub dns: Vec<IpAddr>,
    #[serde(default)]
    pub routes: BTreeSet<String>,
}

impl ServerIdentity {
    pub fn from_inputs(inputs: &EnvironmentInputs) -> Self {
        Self {
            protocol: inputs.protocol,
            endpoint: inputs.public_endpoint.trim().to_string(),
            tunnel_subnet: inputs.tunnel_subnet.trim().to_string(),
            dns: inputs.dns.clone(),
            routes: inputs
                .routes
                .iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let content = fs::read_to_string(path).map_err(|source| IdentityError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| IdentityError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let content = toml::to_string_pretty(self)?;
        crate::fsutil::write_atomic(path, content.as_bytes(), 0o644).map_err(|source| {
            IdentityError::Io {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}
