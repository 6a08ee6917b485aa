//! Gateway bootstrap: PKI, server configuration, host network rules and the
//! handoff to the tunnel server.

pub mod bootstrap;
pub mod configgen;
pub mod fsutil;
pub mod handoff;
pub mod identity;
pub mod layout;
pub mod netrules;
pub mod pki;
pub mod profile;

pub use bootstrap::{BootstrapError, BootstrapReport, Controller};
pub use identity::ServerIdentity;
pub use layout::StateLayout;
pub use pki::{ClientBundle, PkiError, PkiStore};
