use crate::services::{
    blob_store::BlobError, catalog::CatalogError, ingest::IngestError, streaming::ServeError,
};
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};

/// Error kinds reported to clients in the `error` field.
pub mod kind {
    pub const NOT_FOUND: &str = "NotFound";
    pub const VALIDATION: &str = "ValidationError";
    pub const INVALID_RANGE: &str = "InvalidRange";
    pub const RANGE_NOT_SATISFIABLE: &str = "RangeNotSatisfiable";
    pub const PAYLOAD_TOO_LARGE: &str = "PayloadTooLarge";
    pub const IO_FAILURE: &str = "IOFailure";
    pub const CONFLICT: &str = "Conflict";
    pub const TIMEOUT: &str = "Timeout";
}

/// A structured HTTP error: status, kind and a human-readable message.
/// Byte-range errors also carry the object size.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    pub total_size: Option<u64>,
}

impl AppError {
    /// Create a new AppError with a specific status, kind and message.
    pub fn new(status: StatusCode, kind: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: msg.into(),
            total_size: None,
        }
    }

    /// Shortcut for a 500 storage failure
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, kind::IO_FAILURE, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, kind::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, kind::VALIDATION, msg)
    }

    fn with_total_size(mut self, total: u64) -> Self {
        self.total_size = Some(total);
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(kind = self.kind, "request failed: {}", self.message);
        }

        let mut body = json!({
            "error": self.kind,
            "message": self.message,
            "status": self.status.as_u16()
        });
        if let Some(total) = self.total_size {
            body["total_size"] = json!(total);
        }

        let mut response = (self.status, Json(body)).into_response();
        if self.status == StatusCode::RANGE_NOT_SATISFIABLE {
            if let Some(total) = self.total_size {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", total)) {
                    response.headers_mut().insert(header::CONTENT_RANGE, value);
                }
            }
        }
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        let status = err.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::new(status, kind::PAYLOAD_TOO_LARGE, err.body_text())
        } else {
            AppError::validation(err.body_text())
        }
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        let message = err.to_string();
        match err {
            BlobError::NotFound(_) => AppError::not_found(message),
            BlobError::InvalidRange { total, .. } => {
                AppError::new(StatusCode::RANGE_NOT_SATISFIABLE, kind::INVALID_RANGE, message)
                    .with_total_size(total)
            }
            BlobError::RangeNotSatisfiable { total, .. } => AppError::new(
                StatusCode::RANGE_NOT_SATISFIABLE,
                kind::RANGE_NOT_SATISFIABLE,
                message,
            )
            .with_total_size(total),
            BlobError::PayloadTooLarge { .. } => {
                AppError::new(StatusCode::PAYLOAD_TOO_LARGE, kind::PAYLOAD_TOO_LARGE, message)
            }
            BlobError::IdleTimeout(_) => {
                AppError::new(StatusCode::REQUEST_TIMEOUT, kind::TIMEOUT, message)
            }
            BlobError::Source(source) => interrupted(source),
            BlobError::Io(_) => AppError::internal(message),
        }
    }
}

impl From<CatalogError> for AppError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(_) => AppError::not_found(err.to_string()),
            CatalogError::Validation(msg) => AppError::validation(msg),
            CatalogError::Conflict(_) => {
                AppError::new(StatusCode::CONFLICT, kind::CONFLICT, err.to_string())
            }
            CatalogError::Blob(blob) => blob.into(),
            CatalogError::Sqlx(_) => AppError::internal(err.to_string()),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(msg) => AppError::validation(msg),
            IngestError::PayloadTooLarge { .. } => AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                kind::PAYLOAD_TOO_LARGE,
                err.to_string(),
            ),
            IngestError::Timeout(_) => {
                AppError::new(StatusCode::REQUEST_TIMEOUT, kind::TIMEOUT, err.to_string())
            }
            IngestError::Interrupted(source) => interrupted(source),
            IngestError::Blob(blob) => blob.into(),
            IngestError::Catalog(catalog) => catalog.into(),
        }
    }
}

impl From<ServeError> for AppError {
    fn from(err: ServeError) -> Self {
        match err {
            ServeError::NotFound(_) | ServeError::NoThumbnail(_) => {
                AppError::not_found(err.to_string())
            }
            ServeError::Blob(blob) => blob.into(),
            ServeError::Catalog(catalog) => catalog.into(),
        }
    }
}

/// The client's upload stream broke off. Body-limit violations surface here
/// as `FileTooLarge`.
fn interrupted(source: io::Error) -> AppError {
    if source.kind() == io::ErrorKind::FileTooLarge {
        AppError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            kind::PAYLOAD_TOO_LARGE,
            source.to_string(),
        )
    } else {
        AppError::validation(format!("upload stream interrupted: {}", source))
    }
}
