//! Cryptographic helpers shared across vpngate crates.

pub mod seal;

pub use seal::{SealError, open, seal};
