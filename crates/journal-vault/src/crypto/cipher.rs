//! AES-256-GCM encryption and decryption of individual string fields.
//!
//! **Nonces are never reused.** Every call to [`encrypt_data`] draws a fresh
//! 96-bit nonce from the OS CSPRNG; GCM nonce reuse under one key breaks both
//! confidentiality and authentication.

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of the AES-GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// A parsed envelope: the nonce and the ciphertext it was produced with.
///
/// The string representation is `base64(nonce ‖ ciphertext+tag)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Raw nonce bytes.
    pub nonce: [u8; NONCE_LEN],
    /// Raw ciphertext + authentication tag bytes.
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Encode this envelope to its canonical string representation.
    pub fn encode(&self) -> String {
        let mut blob = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        blob.extend_from_slice(&self.nonce);
        blob.extend_from_slice(&self.ciphertext);
        STANDARD.encode(blob)
    }

    /// Parse an envelope string back into its nonce and ciphertext.
    ///
    /// The string must be exactly what [`Self::encode`] produced; surrounding
    /// whitespace is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`DecryptionFailure::InvalidEncoding`] if `s` is not base64 and
    /// [`DecryptionFailure::TooShort`] if the decoded blob cannot hold a nonce
    /// and a tag.
    pub fn decode(s: &str) -> Result<Self, DecryptionFailure> {
        let blob = STANDARD
            .decode(s)
            .map_err(|_| DecryptionFailure::InvalidEncoding)?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(DecryptionFailure::TooShort(blob.len()));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&blob[..NONCE_LEN]);
        Ok(Self {
            nonce,
            ciphertext: blob[NONCE_LEN..].to_vec(),
        })
    }
}

/// Why an envelope could not be turned back into plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecryptionFailure {
    /// The envelope is not valid base64.
    #[error("envelope is not valid base64")]
    InvalidEncoding,

    /// The decoded envelope is too short to contain a nonce and a tag.
    #[error("envelope too short: {0} bytes")]
    TooShort(usize),

    /// The authentication tag did not verify: tampered data or a different key.
    #[error("authentication failed")]
    Authentication,

    /// The authenticated plaintext is not UTF-8.
    #[error("plaintext is not valid UTF-8")]
    InvalidUtf8,
}

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,

    /// AES-GCM rejected the encrypt request.
    #[error("encryption failed")]
    Encryption,

    /// The envelope is malformed or failed authentication.
    #[error("decryption failed: {0}")]
    Decryption(#[from] DecryptionFailure),
}

/// Encrypt `plaintext` into an envelope string.
///
/// Identical inputs produce different envelopes on every call.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes
/// and [`CipherError::Encryption`] on an internal AEAD error.
pub fn encrypt_data(plaintext: &str, key: &[u8]) -> Result<String, CipherError> {
    let cipher = build_cipher(key)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|_| CipherError::Encryption)?;

    Ok(Envelope { nonce, ciphertext }.encode())
}

/// Decrypt an envelope string produced by [`encrypt_data`] under the same key.
///
/// # Errors
///
/// Returns [`CipherError::Decryption`] when the envelope is malformed, fails
/// authentication, or does not hold UTF-8 text.
pub fn decrypt_data(envelope: &str, key: &[u8]) -> Result<String, CipherError> {
    let cipher = build_cipher(key)?;
    let envelope = Envelope::decode(envelope)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&envelope.nonce), &envelope.ciphertext[..])
        .map_err(|_| DecryptionFailure::Authentication)?;
    String::from_utf8(plaintext).map_err(|_| DecryptionFailure::InvalidUtf8.into())
}

/// Structural check: `s` is base64 and long enough to be an envelope.
///
/// A `true` result says nothing about authenticity.
pub fn looks_like_envelope(s: &str) -> bool {
    Envelope::decode(s).is_ok()
}

fn build_cipher(key: &[u8]) -> Result<Aes256Gcm, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength);
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength)
}
