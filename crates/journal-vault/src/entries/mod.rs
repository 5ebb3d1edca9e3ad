//! In-memory journal entry repository that only ever holds ciphertext.
//!
//! Entries are stored with their sensitive fields as envelopes; every read
//! decrypts on the way out. The store assigns `id`, `createdAt` and
//! `updatedAt` itself and ignores client-supplied values for them.

use std::{collections::HashMap, sync::Arc};

use chrono::{SecondsFormat, Utc};
use common::Record;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::fields::{policy::JOURNAL_ENTRY, FieldEncryptor, FieldPolicies, PolicyError, VaultError};

/// Fields owned by the store; never taken from client input.
const RESERVED_FIELDS: [&str; 3] = ["id", "createdAt", "updatedAt"];

/// Errors from the entry store.
#[derive(Debug, Error)]
pub enum EntryError {
    /// No entry exists with the given id.
    #[error("entry {0} not found")]
    NotFound(Uuid),

    /// The journal entry policy was removed from the registry.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Encrypting or decrypting the entry failed.
    #[error(transparent)]
    Vault(#[from] VaultError),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    seq: u64,
    record: Record,
}

#[derive(Debug, Default)]
struct Rows {
    next_seq: u64,
    by_id: HashMap<Uuid, StoredEntry>,
}

/// Shared journal entry repository.
#[derive(Clone, Debug)]
pub struct EntryStore {
    rows: Arc<RwLock<Rows>>,
    encryptor: FieldEncryptor,
    policies: FieldPolicies,
}

impl EntryStore {
    /// Create an empty store encrypting with `encryptor` under the
    /// `journal-entry` policy from `policies`.
    pub fn new(encryptor: FieldEncryptor, policies: FieldPolicies) -> Self {
        Self {
            rows: Arc::new(RwLock::new(Rows::default())),
            encryptor,
            policies,
        }
    }

    /// Store a new entry and return its decrypted view.
    pub async fn create(&self, input: Record) -> Result<Record, EntryError> {
        let fields = self.policies.get(JOURNAL_ENTRY)?;
        let id = Uuid::new_v4();
        let now = timestamp();

        let mut plain = strip_reserved(input);
        plain.insert("id".into(), Value::String(id.to_string()));
        plain.insert("createdAt".into(), Value::String(now.clone()));
        plain.insert("updatedAt".into(), Value::String(now));

        let sealed = self.encryptor.encrypt_sensitive_fields(&plain, &fields).await?;

        let mut rows = self.rows.write().await;
        let seq = rows.next_seq;
        rows.next_seq += 1;
        rows.by_id.insert(id, StoredEntry { seq, record: sealed });
        info!(entry_id = %id, "journal entry created");

        Ok(plain)
    }

    /// Decrypted view of one entry.
    pub async fn get(&self, id: Uuid) -> Result<Record, EntryError> {
        let sealed = self.raw(id).await?;
        self.open(&sealed).await
    }

    /// Decrypted views of all entries, newest first.
    pub async fn list(&self) -> Result<Vec<Record>, EntryError> {
        let mut sealed: Vec<StoredEntry> = self.rows.read().await.by_id.values().cloned().collect();
        sealed.sort_by(|a, b| b.seq.cmp(&a.seq));

        let mut out = Vec::with_capacity(sealed.len());
        for entry in &sealed {
            out.push(self.open(&entry.record).await?);
        }
        Ok(out)
    }

    /// Shallow-merge `patch` into an entry and return the updated view.
    ///
    /// Sensitive fields in the patch are encrypted before they touch the
    /// stored row. If the merged entry cannot be decrypted the stored row is
    /// left unchanged.
    pub async fn update(&self, id: Uuid, patch: Record) -> Result<Record, EntryError> {
        let fields = self.policies.get(JOURNAL_ENTRY)?;
        let mut patch = strip_reserved(patch);
        patch.insert("updatedAt".into(), Value::String(timestamp()));
        let sealed_patch = self.encryptor.encrypt_sensitive_fields(&patch, &fields).await?;

        let mut rows = self.rows.write().await;
        let entry = rows.by_id.get_mut(&id).ok_or(EntryError::NotFound(id))?;
        let mut merged = entry.record.clone();
        merged.extend(sealed_patch);

        // The row is only replaced once the merged form decrypts.
        let view = self.open(&merged).await?;
        entry.record = merged;
        debug!(entry_id = %id, "journal entry updated");

        Ok(view)
    }

    /// Remove an entry.
    pub async fn delete(&self, id: Uuid) -> Result<(), EntryError> {
        let removed = self.rows.write().await.by_id.remove(&id);
        if removed.is_none() {
            return Err(EntryError::NotFound(id));
        }
        info!(entry_id = %id, "journal entry deleted");
        Ok(())
    }

    /// The at-rest form of an entry, with sensitive fields still encrypted.
    pub async fn raw(&self, id: Uuid) -> Result<Record, EntryError> {
        self.rows
            .read()
            .await
            .by_id
            .get(&id)
            .map(|e| e.record.clone())
            .ok_or(EntryError::NotFound(id))
    }

    async fn open(&self, sealed: &Record) -> Result<Record, EntryError> {
        let fields = self.policies.get(JOURNAL_ENTRY)?;
        Ok(self
            .encryptor
            .decrypt_sensitive_fields(sealed, &fields)
            .await?
            .record)
    }
}

impl Default for EntryStore {
    fn default() -> Self {
        Self::new(FieldEncryptor::default(), FieldPolicies::default())
    }
}

fn strip_reserved(mut record: Record) -> Record {
    for f in RESERVED_FIELDS {
        record.remove(f);
    }
    record
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
