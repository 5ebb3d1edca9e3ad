//! Registry of which fields are sensitive for each record kind.
//!
//! The registry uses `arc-swap` for lock-free reads on the hot path and can be
//! replaced atomically when a policy file is loaded.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use arc_swap::ArcSwap;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Record kind used when a request does not name one.
pub const JOURNAL_ENTRY: &str = "journal-entry";

/// Fields of a journal entry that are stored encrypted.
pub const JOURNAL_ENTRY_FIELDS: [&str; 4] = ["content", "aiInsight", "recommendation", "question"];

/// Errors from the policy registry.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// No policy is registered for the requested record kind.
    #[error("unknown record kind: {0}")]
    UnknownKind(String),

    /// The policy file could not be read.
    #[error("failed to read policy file: {0}")]
    Io(#[from] std::io::Error),

    /// The policy file is not valid YAML of the expected shape.
    #[error("failed to parse policy file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The policy file parsed but names an empty kind or field.
    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// Ordered, de-duplicated list of sensitive field names for one record kind.
pub type SensitiveFields = Arc<[String]>;

/// On-disk shape of a policy file.
///
/// ```yaml
/// kinds:
///   journal-entry: [content, aiInsight, recommendation, question]
///   chat-message: [content]
/// ```
#[derive(Debug, Deserialize)]
struct PolicyFile {
    kinds: BTreeMap<String, Vec<String>>,
}

/// Shared, lock-free map of record kind → sensitive fields.
#[derive(Clone, Debug)]
pub struct FieldPolicies {
    inner: Arc<ArcSwap<BTreeMap<String, SensitiveFields>>>,
}

impl FieldPolicies {
    /// Create a registry holding only the built-in `journal-entry` policy.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(builtin())),
        }
    }

    /// Look up the sensitive fields for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::UnknownKind`] if `kind` has no policy.
    pub fn get(&self, kind: &str) -> Result<SensitiveFields, PolicyError> {
        self.inner
            .load()
            .get(kind)
            .cloned()
            .ok_or_else(|| PolicyError::UnknownKind(kind.to_owned()))
    }

    /// Registered record kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        self.inner.load().keys().cloned().collect()
    }

    /// Parse YAML policies, merge them over the built-ins, and swap them in.
    ///
    /// A kind named in the YAML replaces the built-in entry of the same name.
    /// On error the current registry is left untouched.
    pub fn load_yaml(&self, text: &str) -> Result<(), PolicyError> {
        let file: PolicyFile = serde_yaml::from_str(text)?;
        let mut map = builtin();
        for (kind, fields) in file.kinds {
            if kind.trim().is_empty() {
                return Err(PolicyError::Invalid("record kind must not be empty".into()));
            }
            if fields.iter().any(|f| f.trim().is_empty()) {
                return Err(PolicyError::Invalid(format!(
                    "record kind {kind} names an empty field"
                )));
            }
            map.insert(kind, dedup(fields));
        }
        info!(kinds = map.len(), "field policies loaded");
        self.inner.store(Arc::new(map));
        Ok(())
    }

    /// Read a YAML policy file from disk and apply it with [`Self::load_yaml`].
    pub fn load_file(&self, path: &Path) -> Result<(), PolicyError> {
        let text = std::fs::read_to_string(path)?;
        self.load_yaml(&text)
    }
}

impl Default for FieldPolicies {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin() -> BTreeMap<String, SensitiveFields> {
    let fields: SensitiveFields = JOURNAL_ENTRY_FIELDS.iter().map(|f| f.to_string()).collect();
    BTreeMap::from([(JOURNAL_ENTRY.to_owned(), fields)])
}

fn dedup(fields: Vec<String>) -> SensitiveFields {
    let mut out: Vec<String> = Vec::with_capacity(fields.len());
    for f in fields {
        if !out.contains(&f) {
            out.push(f);
        }
    }
    out.into()
}
