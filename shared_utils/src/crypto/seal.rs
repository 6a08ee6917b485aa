//! Passphrase sealing for private key material at rest.
//!
//! Sealed blobs are laid out as `MAGIC | salt | nonce | ciphertext+tag` and
//! encrypted with AES-256-GCM under a key derived from the passphrase with
//! PBKDF2-HMAC-SHA256.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

const MAGIC: &[u8; 8] = b"VGSEAL2\n";
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12; // AES-GCM standard nonce size (96 bits)
const KDF_ROUNDS: u32 = 210_000;

/// Errors returned when sealing or opening a blob.
#[derive(Debug, Error)]
pub enum SealError {
    #[error("sealed data is truncated or has an unknown format")]
    Malformed,

    /// Wrong passphrase or tampered data; AES-GCM cannot tell them apart.
    #[error("unable to open sealed data: wrong passphrase or corrupted file")]
    Unseal,

    #[error("encryption failed")]
    Encrypt,
}

fn derive_key(passphrase: &str, salt: &[u8], rounds: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, rounds, &mut key);
    key
}

/// Encrypt `plaintext` under `passphrase`.
pub fn seal(passphrase: &str, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt, KDF_ROUNDS);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| SealError::Encrypt)?;

    let mut out = Vec::with_capacity(MAGIC.len() + SALT_SIZE + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a blob produced by [`seal`].
pub fn open(passphrase: &str, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
    let body = sealed.strip_prefix(MAGIC.as_slice()).ok_or(SealError::Malformed)?;
    if body.len() < SALT_SIZE + NONCE_SIZE {
        return Err(SealError::Malformed);
    }
    let (salt, rest) = body.split_at(SALT_SIZE);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

    let key = derive_key(passphrase, salt, KDF_ROUNDS);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| SealError::Unseal)
}
