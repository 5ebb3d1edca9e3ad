//! Request and response types exchanged over the public HTTP API.

use serde::{Deserialize, Serialize};

/// A JSON object whose designated fields may be encrypted.
pub type Record = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Encrypt / decrypt endpoints
// ---------------------------------------------------------------------------

/// Request body for `POST /encrypt` and `POST /decrypt`.
///
/// The record kind (and therefore the set of sensitive fields) is taken from
/// the `X-Record-Kind` request header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordRequest {
    /// Record to transform. Non-sensitive fields are returned untouched.
    pub record: Record,
}

/// Successful response body for `POST /encrypt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptResponse {
    /// The record with sensitive string fields replaced by envelopes.
    pub record: Record,
}

/// Successful response body for `POST /decrypt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptResponse {
    /// The record with sensitive fields restored to plaintext.
    pub record: Record,
    /// Fields replaced by a placeholder because they could not be decrypted.
    ///
    /// Always empty unless the service runs with the placeholder policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unrecoverable: Vec<String>,
}

// ---------------------------------------------------------------------------
// Single-value endpoints
// ---------------------------------------------------------------------------

/// Request body for `POST /data/encrypt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptDataRequest {
    /// Text to encrypt. May be empty.
    pub plaintext: String,
}

/// Response body for `POST /data/encrypt`; request body for `POST /data/decrypt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeBody {
    /// Base64 of `nonce ‖ ciphertext ‖ tag`.
    pub envelope: String,
}

/// Response body for `POST /data/decrypt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptDataResponse {
    /// The recovered text.
    pub plaintext: String,
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Response body for `GET /entries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryList {
    /// Decrypted entries, newest first.
    pub entries: Vec<Record>,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"bad_request"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status: `"ok"` or `"degraded"`.
    pub status: String,
    /// Whether the encryption key could be loaded or created.
    pub key_ready: bool,
    /// Short SHA-256 fingerprint of the active key, when ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_fingerprint: Option<String>,
    /// Record kinds with a registered field policy.
    pub record_kinds: Vec<String>,
}
