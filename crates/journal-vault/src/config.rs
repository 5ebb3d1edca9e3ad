//! Configuration loading and validation for the journal-vault service.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any variable is invalid.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::fields::LegacyFieldPolicy;
use crate::keystore::{FileKeyStorage, KeyMaterialStorage, MemoryKeyStorage};

/// Where KeyMaterial is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyBackend {
    /// One file per key name under `KEY_DIR`.
    #[default]
    File,
    /// Process memory only; every restart creates a new key.
    Memory,
}

/// Validated service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port the HTTP server listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Storage backend for the encryption key.
    #[serde(default)]
    pub key_backend: KeyBackend,

    /// Directory holding the key file when `KEY_BACKEND=file`.
    #[serde(default = "default_key_dir")]
    pub key_dir: String,

    /// Fixed storage name of the KeyMaterial entry.
    #[serde(default = "default_key_name")]
    pub key_name: String,

    /// HTTP header naming the record kind for `/encrypt` and `/decrypt`.
    #[serde(default = "default_record_kind_header")]
    pub record_kind_header: String,

    /// Optional YAML file with additional field policies.
    #[serde(default)]
    pub field_policy_path: Option<String>,

    /// Handling of stored fields that cannot be decrypted.
    #[serde(default)]
    pub legacy_field_policy: LegacyFieldPolicy,

    /// OTLP endpoint for span export. Spans are only exported when set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_port() -> u16 {
    8080
}
fn default_key_dir() -> String {
    ".journal-vault".into()
}
fn default_key_name() -> String {
    "journal-vault.encryption-key".into()
}
fn default_record_kind_header() -> String {
    "X-Record-Kind".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Build the key storage selected by `KEY_BACKEND`.
    pub fn key_storage(&self) -> Arc<dyn KeyMaterialStorage> {
        match self.key_backend {
            KeyBackend::File => Arc::new(FileKeyStorage::new(PathBuf::from(&self.key_dir))),
            KeyBackend::Memory => Arc::new(MemoryKeyStorage::new()),
        }
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.key_name, "KEY_NAME")?;
        if self.key_name.contains(['/', '\\']) || self.key_name.starts_with('.') {
            anyhow::bail!("KEY_NAME must be a plain file name");
        }
        if self.key_backend == KeyBackend::File {
            ensure_non_empty(&self.key_dir, "KEY_DIR")?;
        }
        axum::http::HeaderName::from_bytes(self.record_kind_header.as_bytes())
            .context("RECORD_KIND_HEADER must be a valid HTTP header name")?;
        if let Some(path) = &self.field_policy_path {
            ensure_non_empty(path, "FIELD_POLICY_PATH")?;
        }
        if let Some(endpoint) = &self.otel_exporter_otlp_endpoint {
            ensure_non_empty(endpoint, "OTEL_EXPORTER_OTLP_ENDPOINT")?;
        }
        Ok(())
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} must not be empty");
    }
    Ok(())
}
