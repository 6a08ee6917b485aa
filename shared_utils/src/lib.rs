//! Shared utilities for vpngate components.
//!
//! Settings loading, structured logging setup, and the passphrase sealing
//! used for the CA key at rest.

pub mod config;
pub mod crypto;
pub mod logging;

pub use config::{EnvironmentInputs, Settings};
