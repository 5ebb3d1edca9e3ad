//! Field-level encryption of JSON records.
//!
//! [`FieldEncryptor`] applies the envelope codec to the designated sensitive
//! fields of a record, leaving ids, timestamps, mood scores and every other
//! field untouched. Transforms are pure: the input record is never mutated and
//! a failure on any field fails the whole call.
//!
//! # Undecryptable fields
//!
//! Stored values that are not valid envelopes (legacy plaintext written before
//! encryption was introduced, corrupted data, or envelopes from a lost key)
//! are handled according to [`LegacyFieldPolicy`], fixed for the lifetime of
//! the encryptor.

pub mod policy;

pub use policy::{FieldPolicies, PolicyError, SensitiveFields};

use common::Record;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::{self, CipherError, DecryptionFailure};
use crate::keystore::{KeyStore, KeyStoreError};

/// Value substituted for an unrecoverable field under
/// [`LegacyFieldPolicy::Placeholder`].
pub const UNRECOVERABLE_PLACEHOLDER: &str = "[unrecoverable]";

/// What to do when a sensitive field cannot be decrypted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyFieldPolicy {
    /// Fail the whole call with [`VaultError::FieldDecryption`].
    #[default]
    Reject,
    /// Replace the field with [`UNRECOVERABLE_PLACEHOLDER`] and report it.
    Placeholder,
}

/// Why a single field could not be transformed.
#[derive(Debug, Error)]
pub enum FieldFailure {
    /// The codec rejected the value.
    #[error(transparent)]
    Cipher(#[from] CipherError),

    /// Only strings can be stored as envelopes.
    #[error("value is {0}, not a string")]
    NotAString(&'static str),
}

/// Errors from the field encryptor.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The encryption key could not be loaded or created.
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// The AEAD primitive rejected an encrypt request.
    #[error("encryption failed")]
    Encryption,

    /// An envelope was malformed or failed authentication.
    #[error("decryption failed: {0}")]
    Decryption(DecryptionFailure),

    /// A sensitive field could not be encrypted; the record must not be persisted.
    #[error("failed to encrypt field {field}: {source}")]
    FieldEncryption {
        /// Name of the offending field.
        field: String,
        /// Underlying failure.
        #[source]
        source: FieldFailure,
    },

    /// A sensitive field could not be decrypted.
    #[error("failed to decrypt field {field}: {source}")]
    FieldDecryption {
        /// Name of the offending field.
        field: String,
        /// Underlying failure.
        #[source]
        source: FieldFailure,
    },
}

impl From<CipherError> for VaultError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::Decryption(reason) => VaultError::Decryption(reason),
            CipherError::Encryption | CipherError::InvalidKeyLength => VaultError::Encryption,
        }
    }
}

/// Output of [`FieldEncryptor::decrypt_sensitive_fields`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedRecord {
    /// The record with sensitive fields restored.
    pub record: Record,
    /// Fields replaced by [`UNRECOVERABLE_PLACEHOLDER`], in policy order.
    pub unrecoverable: Vec<String>,
}

/// Encrypts and decrypts strings and sensitive record fields with the
/// deployment key.
#[derive(Clone, Debug, Default)]
pub struct FieldEncryptor {
    keys: KeyStore,
    legacy_policy: LegacyFieldPolicy,
}

impl FieldEncryptor {
    /// Create an encryptor over `keys` using `legacy_policy` for undecryptable fields.
    pub fn new(keys: KeyStore, legacy_policy: LegacyFieldPolicy) -> Self {
        Self {
            keys,
            legacy_policy,
        }
    }

    /// The key store backing this encryptor.
    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// Encrypt one string into an envelope.
    pub async fn encrypt_data(&self, plaintext: &str) -> Result<String, VaultError> {
        let key = self.keys.get_encryption_key().await?;
        Ok(crypto::encrypt_data(plaintext, &key.0[..])?)
    }

    /// Decrypt one envelope back into its string.
    pub async fn decrypt_data(&self, envelope: &str) -> Result<String, VaultError> {
        let key = self.keys.get_encryption_key().await?;
        Ok(crypto::decrypt_data(envelope, &key.0[..])?)
    }

    /// Return a copy of `record` with every present, non-null field in
    /// `fields` replaced by its envelope.
    ///
    /// # Errors
    ///
    /// Fails with [`VaultError::KeyStore`] if no key is available and with
    /// [`VaultError::FieldEncryption`] if any designated field holds a
    /// non-string value or cannot be encrypted. No partially encrypted record
    /// is ever returned.
    pub async fn encrypt_sensitive_fields(
        &self,
        record: &Record,
        fields: &[String],
    ) -> Result<Record, VaultError> {
        let key = self.keys.get_encryption_key().await?;
        let mut out = record.clone();

        for field in fields {
            let Some(value) = out.get_mut(field) else {
                continue;
            };
            let envelope = match value {
                Value::Null => continue,
                Value::String(s) => crypto::encrypt_data(s, &key.0[..]).map_err(|e| {
                    VaultError::FieldEncryption {
                        field: field.clone(),
                        source: e.into(),
                    }
                })?,
                other => {
                    return Err(VaultError::FieldEncryption {
                        field: field.clone(),
                        source: FieldFailure::NotAString(json_type(other)),
                    })
                }
            };
            *value = Value::String(envelope);
        }

        Ok(out)
    }

    /// Return a copy of `record` with every present, non-null field in
    /// `fields` decrypted.
    ///
    /// # Errors
    ///
    /// Fails with [`VaultError::KeyStore`] if no key is available. Under
    /// [`LegacyFieldPolicy::Reject`], fails with [`VaultError::FieldDecryption`]
    /// on the first field that is not a valid envelope for the current key.
    pub async fn decrypt_sensitive_fields(
        &self,
        record: &Record,
        fields: &[String],
    ) -> Result<DecryptedRecord, VaultError> {
        let key = self.keys.get_encryption_key().await?;
        let mut out = record.clone();
        let mut unrecoverable = Vec::new();

        for field in fields {
            let Some(value) = out.get_mut(field) else {
                continue;
            };
            let result = match &*value {
                Value::Null => continue,
                Value::String(s) => {
                    crypto::decrypt_data(s, &key.0[..]).map_err(|e| {
                        if !crypto::cipher::looks_like_envelope(s) {
                            debug!(field = %field, "stored value is not an envelope; likely legacy plaintext");
                        }
                        FieldFailure::from(e)
                    })
                }
                other => Err(FieldFailure::NotAString(json_type(other))),
            };

            match (result, self.legacy_policy) {
                (Ok(plaintext), _) => *value = Value::String(plaintext),
                (Err(source), LegacyFieldPolicy::Reject) => {
                    warn!(field = %field, error = %source, "sensitive field is not decryptable");
                    return Err(VaultError::FieldDecryption {
                        field: field.clone(),
                        source,
                    });
                }
                (Err(source), LegacyFieldPolicy::Placeholder) => {
                    warn!(field = %field, error = %source, "substituting placeholder for undecryptable field");
                    *value = Value::String(UNRECOVERABLE_PLACEHOLDER.to_owned());
                    unrecoverable.push(field.clone());
                }
            }
        }

        Ok(DecryptedRecord {
            record: out,
            unrecoverable,
        })
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Record {
        match v {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn data_round_trip_through_key_store() {
        let enc = FieldEncryptor::default();
        for s in ["", "hello", "今日はいい日 🌞"] {
            let env = enc.encrypt_data(s).await.unwrap();
            assert_eq!(enc.decrypt_data(&env).await.unwrap(), s);
        }
    }

    #[tokio::test]
    async fn only_designated_fields_change() {
        let enc = FieldEncryptor::default();
        let input = record(json!({"id": "1", "mood": 3, "content": "hello"}));
        let out = enc
            .encrypt_sensitive_fields(&input, &fields(&["content"]))
            .await
            .unwrap();

        assert_eq!(out["id"], input["id"]);
        assert_eq!(out["mood"], input["mood"]);
        assert_ne!(out["content"], "hello");
        assert!(out["content"].is_string());
        // input untouched
        assert_eq!(input["content"], "hello");
    }

    #[tokio::test]
    async fn absent_fields_are_not_added() {
        let enc = FieldEncryptor::default();
        let designated = fields(&["content", "aiInsight"]);
        let input = record(json!({"content": "hello"}));

        let encrypted = enc.encrypt_sensitive_fields(&input, &designated).await.unwrap();
        assert!(!encrypted.contains_key("aiInsight"));

        let decrypted = enc
            .decrypt_sensitive_fields(&encrypted, &designated)
            .await
            .unwrap();
        assert!(!decrypted.record.contains_key("aiInsight"));
        assert_eq!(decrypted.record.len(), 1);
    }

    #[tokio::test]
    async fn null_fields_pass_through() {
        let enc = FieldEncryptor::default();
        let input = record(json!({"content": null}));
        let out = enc
            .encrypt_sensitive_fields(&input, &fields(&["content"]))
            .await
            .unwrap();
        assert!(out["content"].is_null());
    }

    #[tokio::test]
    async fn journal_entry_end_to_end() {
        let enc = FieldEncryptor::default();
        let designated = fields(&policy::JOURNAL_ENTRY_FIELDS);
        let input = record(json!({
            "content": "Feeling anxious about tomorrow",
            "aiInsight": "Try breathing exercises",
        }));

        let encrypted = enc.encrypt_sensitive_fields(&input, &designated).await.unwrap();
        let content = encrypted["content"].as_str().unwrap();
        let insight = encrypted["aiInsight"].as_str().unwrap();
        assert_ne!(content, "Feeling anxious about tomorrow");
        assert_ne!(insight, "Try breathing exercises");
        assert_ne!(content, insight);
        assert!(crypto::cipher::looks_like_envelope(content));

        let decrypted = enc
            .decrypt_sensitive_fields(&encrypted, &designated)
            .await
            .unwrap();
        assert_eq!(decrypted.record, input);
        assert!(decrypted.unrecoverable.is_empty());
    }

    #[tokio::test]
    async fn non_string_sensitive_field_fails_whole_call() {
        let enc = FieldEncryptor::default();
        let input = record(json!({"content": "fine", "question": 42}));
        let err = enc
            .encrypt_sensitive_fields(&input, &fields(&["content", "question"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::FieldEncryption { ref field, source: FieldFailure::NotAString(_) } if field == "question"
        ));
    }

    #[tokio::test]
    async fn legacy_plaintext_rejected_by_default() {
        let enc = FieldEncryptor::default();
        let input = record(json!({"content": "written before encryption"}));
        let err = enc
            .decrypt_sensitive_fields(&input, &fields(&["content"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::FieldDecryption { ref field, .. } if field == "content"
        ));
    }

    #[tokio::test]
    async fn legacy_plaintext_replaced_under_placeholder_policy() {
        let enc = FieldEncryptor::new(KeyStore::default(), LegacyFieldPolicy::Placeholder);
        let designated = fields(&["content", "aiInsight"]);
        let good = enc
            .encrypt_sensitive_fields(&record(json!({"aiInsight": "rest well"})), &designated)
            .await
            .unwrap();
        let mut mixed = good.clone();
        mixed.insert("content".into(), json!("legacy plaintext"));

        let out = enc.decrypt_sensitive_fields(&mixed, &designated).await.unwrap();
        assert_eq!(out.record["content"], UNRECOVERABLE_PLACEHOLDER);
        assert_eq!(out.record["aiInsight"], "rest well");
        assert_eq!(out.unrecoverable, vec!["content".to_string()]);
    }

    #[tokio::test]
    async fn envelope_from_other_key_is_a_field_failure() {
        let writer = FieldEncryptor::default();
        let reader = FieldEncryptor::default();
        let designated = fields(&["content"]);
        let encrypted = writer
            .encrypt_sensitive_fields(&record(json!({"content": "lost key"})), &designated)
            .await
            .unwrap();
        let err = reader
            .decrypt_sensitive_fields(&encrypted, &designated)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::FieldDecryption {
                source: FieldFailure::Cipher(CipherError::Decryption(DecryptionFailure::Authentication)),
                ..
            }
        ));
    }

    #[test]
    fn legacy_policy_parses_lowercase() {
        let p: LegacyFieldPolicy = serde_json::from_value(json!("placeholder")).unwrap();
        assert_eq!(p, LegacyFieldPolicy::Placeholder);
        assert_eq!(LegacyFieldPolicy::default(), LegacyFieldPolicy::Reject);
    }
}
