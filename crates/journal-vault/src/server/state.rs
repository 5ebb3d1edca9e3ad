//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use crate::entries::EntryStore;
use crate::fields::{FieldEncryptor, FieldPolicies};

/// Application state shared across all request handlers.
///
/// All fields are cheaply cloneable (`Arc`-wrapped or already `Arc`-backed) so
/// that Axum can clone the state for each request without copying expensive data.
#[derive(Clone)]
pub struct AppState {
    /// Field encryptor backed by the deployment key.
    pub encryptor: FieldEncryptor,
    /// Lock-free registry of sensitive fields per record kind.
    pub policies: FieldPolicies,
    /// Journal entries, held encrypted.
    pub entries: EntryStore,
    /// Name of the HTTP header used to identify the record kind.
    pub record_kind_header: Arc<String>,
}

impl AppState {
    /// Create a new [`AppState`]; the entry store shares `encryptor` and `policies`.
    pub fn new(
        encryptor: FieldEncryptor,
        policies: FieldPolicies,
        record_kind_header: String,
    ) -> Self {
        Self {
            entries: EntryStore::new(encryptor.clone(), policies.clone()),
            encryptor,
            policies,
            record_kind_header: Arc::new(record_kind_header),
        }
    }
}

impl Default for AppState {
    /// Creates a default [`AppState`] with an in-memory key, suitable for tests.
    fn default() -> Self {
        Self::new(
            FieldEncryptor::default(),
            FieldPolicies::default(),
            "X-Record-Kind".into(),
        )
    }
}
