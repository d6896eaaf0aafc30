//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness ("ok")
//! - GET /readyz   -> catalog connectivity plus writability of the blob root
//!   and of the upload staging directory

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

const MARKER: &[u8] = b"readyz";

type CheckResult = Result<(), String>;

/// `GET /healthz`
///
/// Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`
///
/// Runs `SELECT 1` against the catalog and round-trips a small file through
/// both the blob root and `.staging`, since uploads fail if either one is
/// read-only. Also reports how many blob read streams are open.
/// HTTP 200 when every check passes, 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("sqlite", CheckStatus::from(check_catalog(&state.db).await));
    checks.insert(
        "blobs",
        CheckStatus::from(check_writable(&state.blobs.base_path).await),
    );
    checks.insert(
        "staging",
        CheckStatus::from(check_writable(&state.blobs.staging_dir()).await),
    );

    let ready = checks.values().all(|check| check.ok);
    if !ready {
        tracing::warn!(?checks, "not ready");
    }

    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" },
        open_readers: state.blobs.open_readers(),
        checks,
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn check_catalog(db: &SqlitePool) -> CheckResult {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(db).await {
        Ok(1) => Ok(()),
        Ok(v) => Err(format!("unexpected result: {}", v)),
        Err(e) => Err(format!("error: {}", e)),
    }
}

/// Create `dir` if needed, then write, read back and remove a marker file.
async fn check_writable(dir: &Path) -> CheckResult {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| format!("could not create {}: {}", dir.display(), e))?;

    let marker = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    fs::write(&marker, MARKER)
        .await
        .map_err(|e| format!("could not write {}: {}", marker.display(), e))?;
    let read = fs::read(&marker).await;
    // Removal failures are logged only; the directory is still usable.
    if let Err(e) = fs::remove_file(&marker).await {
        tracing::warn!(path = %marker.display(), "could not remove readiness marker: {}", e);
    }
    match read {
        Ok(bytes) if bytes == MARKER => Ok(()),
        Ok(_) => Err(format!("content mismatch in {}", marker.display())),
        Err(e) => Err(format!("could not read {}: {}", marker.display(), e)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    open_readers: usize,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Debug, Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl From<CheckResult> for CheckStatus {
    fn from(result: CheckResult) -> Self {
        match result {
            Ok(()) => Self { ok: true, error: None },
            Err(error) => Self {
                ok: false,
                error: Some(error),
            },
        }
    }
}
