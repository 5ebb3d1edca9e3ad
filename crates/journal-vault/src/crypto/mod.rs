//! AES-256-GCM field encryption primitives.
//!
//! This module is free of storage and HTTP dependencies. It provides the
//! low-level encrypt/decrypt operations used by the field helpers.
//!
//! # Envelope format
//!
//! ```text
//! base64-standard( nonce[12] ‖ ciphertext ‖ tag[16] )
//! ```
//!
//! Each envelope is self-describing: the nonce travels with the ciphertext, so
//! only the key is needed to decrypt it.

pub mod cipher;

pub use cipher::{decrypt_data, encrypt_data, CipherError, DecryptionFailure, KEY_LEN};
