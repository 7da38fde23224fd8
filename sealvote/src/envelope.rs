//! Symmetric envelope for vote payloads.
//!
//! Every envelope is `nonce (12 bytes) || ciphertext || tag (16 bytes)` under AES-256-GCM
//! with a single server-held master key.
//!
//! A nonce must never repeat under the same key. Each call to `seal` draws a fresh nonce from
//! the OS RNG, so two identical ballots produce unrelated envelopes.

use crate::*;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

pub const NONCE_LENGTH: usize = 12;
pub const TAG_LENGTH: usize = 16;
pub const MASTER_KEY_LENGTH: usize = 32;

/// The server-held AES-256 key.
///
/// Loaded once at startup and zeroed when dropped. Deliberately not `Clone`.
pub struct MasterKey([u8; MASTER_KEY_LENGTH]);

impl MasterKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != MASTER_KEY_LENGTH {
            return Err(Error::Keystore(format!(
                "master key must be {} bytes, got {}",
                MASTER_KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut key = [0u8; MASTER_KEY_LENGTH];
        key.copy_from_slice(bytes);
        Ok(MasterKey(key))
    }

    /// Generate a fresh random master key
    pub fn generate() -> Self {
        let mut key = [0u8; MASTER_KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        MasterKey(key)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; MASTER_KEY_LENGTH] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "MasterKey(<redacted>)")
    }
}

/// Encrypt and authenticate `plaintext`, returning `nonce || ciphertext || tag`.
pub fn seal(plaintext: &[u8], key: &MasterKey) -> Result<Vec<u8>, Error> {
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::EncryptionFailure)?;

    let mut envelope = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    envelope.extend_from_slice(&nonce);
    envelope.extend(ciphertext);

    Ok(envelope)
}

/// Verify and decrypt an envelope produced by `seal`.
pub fn open(envelope: &[u8], key: &MasterKey) -> Result<Vec<u8>, Error> {
    if envelope.len() < NONCE_LENGTH + TAG_LENGTH {
        return Err(Error::AuthenticationFailure);
    }

    let (nonce, ciphertext) = envelope.split_at(NONCE_LENGTH);

    key.cipher()
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::AuthenticationFailure)
}
