//! Axum request handlers for all service endpoints.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::{
    protocol::{
        DecryptDataResponse, DecryptResponse, EncryptDataRequest, EncryptResponse, EntryList,
        EnvelopeBody, ErrorResponse, HealthResponse, RecordRequest,
    },
    Record, ServiceError,
};
use tracing::{error, warn};
use uuid::Uuid;

use super::state::AppState;
use crate::entries::EntryError;
use crate::fields::{policy::JOURNAL_ENTRY, FieldFailure, PolicyError, SensitiveFields, VaultError};

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// A [`ServiceError`] that renders as a JSON [`ErrorResponse`].
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &self.0 {
            ServiceError::BadRequest(m)
            | ServiceError::NotFound(m)
            | ServiceError::Unprocessable(m)
            | ServiceError::EncryptionFailure(m)
            | ServiceError::Unavailable(m)
            | ServiceError::Internal(m) => m.clone(),
        };
        (status, Json(ErrorResponse::new(self.0.code(), message))).into_response()
    }
}

impl From<VaultError> for ApiError {
    fn from(e: VaultError) -> Self {
        let err = match &e {
            VaultError::KeyStore(inner) => {
                error!(error = %inner, "encryption key unavailable");
                ServiceError::Unavailable("encryption key unavailable".into())
            }
            VaultError::Encryption => {
                error!("encryption failed");
                ServiceError::EncryptionFailure("encryption failed".into())
            }
            VaultError::FieldEncryption {
                field,
                source: FieldFailure::NotAString(kind),
            } => ServiceError::BadRequest(format!("field {field} must be a string, got {kind}")),
            VaultError::FieldEncryption { field, .. } => {
                error!(field = %field, "field encryption failed");
                ServiceError::EncryptionFailure(format!("field {field} could not be encrypted"))
            }
            VaultError::Decryption(reason) => {
                ServiceError::Unprocessable(format!("value could not be decrypted: {reason}"))
            }
            VaultError::FieldDecryption { field, .. } => {
                ServiceError::Unprocessable(format!("field {field} could not be decrypted"))
            }
        };
        ApiError(err)
    }
}

impl From<PolicyError> for ApiError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::UnknownKind(kind) => {
                ApiError(ServiceError::BadRequest(format!("unknown record kind: {kind}")))
            }
            other => ApiError(ServiceError::Internal(other.to_string())),
        }
    }
}

impl From<EntryError> for ApiError {
    fn from(e: EntryError) -> Self {
        match e {
            EntryError::NotFound(id) => ApiError(ServiceError::NotFound(format!("entry {id}"))),
            EntryError::Policy(e) => {
                warn!(error = %e, "journal entry policy missing");
                ApiError(ServiceError::Internal("journal entry policy missing".into()))
            }
            EntryError::Vault(e) => e.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Record encryption
// ---------------------------------------------------------------------------

/// Resolve the sensitive fields for the record kind named in the request headers.
///
/// A missing header means `journal-entry`.
fn sensitive_fields(state: &AppState, headers: &HeaderMap) -> Result<SensitiveFields, ApiError> {
    let kind = match headers.get(state.record_kind_header.as_str()) {
        Some(v) => v.to_str().map_err(|_| {
            ApiError(ServiceError::BadRequest(format!(
                "{} header contains non-ASCII characters",
                state.record_kind_header
            )))
        })?,
        None => JOURNAL_ENTRY,
    };
    Ok(state.policies.get(kind)?)
}

/// `POST /encrypt` — encrypt the sensitive fields of a record.
pub async fn encrypt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RecordRequest>,
) -> Result<Json<EncryptResponse>, ApiError> {
    let fields = sensitive_fields(&state, &headers)?;
    let record = state
        .encryptor
        .encrypt_sensitive_fields(&req.record, &fields)
        .await?;
    Ok(Json(EncryptResponse { record }))
}

/// `POST /decrypt` — decrypt the sensitive fields of a record.
pub async fn decrypt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RecordRequest>,
) -> Result<Json<DecryptResponse>, ApiError> {
    let fields = sensitive_fields(&state, &headers)?;
    let out = state
        .encryptor
        .decrypt_sensitive_fields(&req.record, &fields)
        .await?;
    Ok(Json(DecryptResponse {
        record: out.record,
        unrecoverable: out.unrecoverable,
    }))
}

/// `POST /data/encrypt` — encrypt a single string.
pub async fn encrypt_data(
    State(state): State<AppState>,
    Json(req): Json<EncryptDataRequest>,
) -> Result<Json<EnvelopeBody>, ApiError> {
    let envelope = state.encryptor.encrypt_data(&req.plaintext).await?;
    Ok(Json(EnvelopeBody { envelope }))
}

/// `POST /data/decrypt` — decrypt a single envelope.
pub async fn decrypt_data(
    State(state): State<AppState>,
    Json(req): Json<EnvelopeBody>,
) -> Result<Json<DecryptDataResponse>, ApiError> {
    let plaintext = state.encryptor.decrypt_data(&req.envelope).await?;
    Ok(Json(DecryptDataResponse { plaintext }))
}

// ---------------------------------------------------------------------------
// Journal entries
// ---------------------------------------------------------------------------

/// `POST /entries` — store a new journal entry.
pub async fn create_entry(
    State(state): State<AppState>,
    Json(record): Json<Record>,
) -> Result<(StatusCode, Json<Record>), ApiError> {
    let created = state.entries.create(record).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /entries` — all entries, newest first.
pub async fn list_entries(State(state): State<AppState>) -> Result<Json<EntryList>, ApiError> {
    let entries = state.entries.list().await?;
    Ok(Json(EntryList { entries }))
}

/// `GET /entries/{id}`
pub async fn get_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Record>, ApiError> {
    Ok(Json(state.entries.get(id).await?))
}

/// `PUT /entries/{id}` — shallow-merge the body into the entry.
pub async fn update_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<Record>,
) -> Result<Json<Record>, ApiError> {
    Ok(Json(state.entries.update(id, patch).await?))
}

/// `DELETE /entries/{id}`
pub async fn delete_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.entries.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// `GET /health` — liveness and readiness check.
///
/// Returns `200 OK` when the encryption key is available, `503` otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let (status_code, key_fingerprint) = match state.encryptor.keys().fingerprint().await {
        Ok(fp) => (StatusCode::OK, Some(fp)),
        Err(e) => {
            warn!(error = %e, "health check: encryption key unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, None)
        }
    };

    let key_ready = key_fingerprint.is_some();
    let status = if key_ready { "ok" } else { "degraded" };
    let body = HealthResponse {
        status: status.into(),
        key_ready,
        key_fingerprint,
        record_kinds: state.policies.kinds(),
    };
    (status_code, Json(body)).into_response()
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}
