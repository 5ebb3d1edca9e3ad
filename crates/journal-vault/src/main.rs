//! `journal-vault` service binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise logging (and OTLP span export when configured).
//! 3. Open the key store and load or create the encryption key.
//! 4. Load field policies, merging any YAML overrides over the built-ins.
//! 5. Build the Axum router and serve until Ctrl-C.

mod config;
mod crypto;
mod entries;
mod fields;
mod keystore;
mod server;
mod telemetry;

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::fields::{FieldEncryptor, FieldPolicies};
use crate::keystore::KeyStore;
use crate::server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_port = cfg.listen_port,
        key_backend = ?cfg.key_backend,
        legacy_field_policy = ?cfg.legacy_field_policy,
        "journal-vault starting"
    );

    // -----------------------------------------------------------------------
    // 3. Encryption key
    // -----------------------------------------------------------------------
    let keys = KeyStore::new(cfg.key_storage(), cfg.key_name.as_str());
    let fingerprint = keys
        .fingerprint()
        .await
        .context("encryption key could not be loaded; refusing to start")?;
    info!(fingerprint = %fingerprint, "encryption key ready");

    // -----------------------------------------------------------------------
    // 4. Field policies
    // -----------------------------------------------------------------------
    let policies = FieldPolicies::new();
    if let Some(path) = &cfg.field_policy_path {
        policies
            .load_file(Path::new(path))
            .with_context(|| format!("failed to load field policies from {path}"))?;
    }
    info!(kinds = ?policies.kinds(), "field policies ready");

    // -----------------------------------------------------------------------
    // 5. HTTP server
    // -----------------------------------------------------------------------
    let encryptor = FieldEncryptor::new(keys, cfg.legacy_field_policy);
    let state = AppState::new(encryptor, policies, cfg.record_kind_header.clone());
    let router = server::router::build(state);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("journal-vault stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
