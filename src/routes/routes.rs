//! Defines routes for media upload, listing, metadata and streaming.
//!
//! ## Structure
//! - **Collection endpoints**
//!   - `GET    /media`: list summaries (supports uploader, limit, continuation-token)
//!   - `POST   /media`: multipart upload
//!
//! - **Item endpoints**
//!   - `GET    /media/{id}`: metadata only
//!   - `PATCH  /media/{id}`: update descriptive fields
//!   - `DELETE /media/{id}`: delete and collect unreferenced blobs
//!   - `GET    /media/{id}/content`: payload, honours `Range`
//!   - `GET    /media/{id}/thumbnail`: thumbnail payload
//!
//! `GET` routes answer `HEAD` with the same headers and no body.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        media_handlers::{
            delete_media, get_content, get_media, get_thumbnail, list_media, update_media,
            upload_media,
        },
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::get,
};

/// Build the router. `body_limit` caps the multipart upload request body.
pub fn routes(body_limit: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/media",
            get(list_media)
                .post(upload_media)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .route(
            "/media/{id}",
            get(get_media).patch(update_media).delete(delete_media),
        )
        .route("/media/{id}/content", get(get_content))
        .route("/media/{id}/thumbnail", get(get_thumbnail))
}
