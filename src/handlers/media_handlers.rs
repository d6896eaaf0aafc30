//! HTTP handlers for media upload, listing, metadata and streaming.
//! Payload bytes are streamed in both directions; nothing buffers a whole
//! object in memory.

use crate::{
    errors::AppError,
    models::media::{DescriptiveFields, MediaObject, MediaSummary, MediaUpdate},
    services::{catalog::ListQuery, ingest::IngestError},
    state::AppState,
};
use axum::{
    Json,
    extract::{
        Multipart, Path, Query, State,
        multipart::{Field, MultipartError},
    },
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{future::Future, io, time::Duration};
use tokio::time;
use tracing::{debug, warn};

/// Response header carrying the token for the next listing page.
pub const NEXT_CONTINUATION_TOKEN: &str = "x-next-continuation-token";

/// Query params accepted by `GET /media`.
#[derive(Debug, Default, Deserialize)]
pub struct ListMediaQuery {
    pub uploader: Option<String>,
    pub limit: Option<usize>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedMedia {
    pub id: String,
}

/// POST `/media`: multipart upload with `title`, `description`,
/// `uploaderRef`, `file` and an optional `thumbnail`.
///
/// File parts are streamed into the Blob Store as they arrive; the catalog
/// entry is written once the whole form has been read. Every read from the
/// form is bounded by the idle timeout, so a stalled client gets a 408 and
/// its partially received parts are released.
pub async fn upload_media(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let idle = state.ingest.limits().idle_timeout;
    let mut session = state.ingest.begin();
    let mut fields = DescriptiveFields::default();

    while let Some(field) = within(idle, multipart.next_field()).await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let content_type = field.content_type().map(str::to_string);
                session
                    .receive_primary(content_type, part_stream(field))
                    .await?;
            }
            "thumbnail" => {
                let content_type = field.content_type().map(str::to_string);
                session
                    .receive_thumbnail(content_type, part_stream(field))
                    .await?;
            }
            "title" => fields.title = within(idle, field.text()).await?,
            "description" => fields.description = within(idle, field.text()).await?,
            "uploaderRef" | "uploader_ref" => {
                fields.uploader_ref = within(idle, field.text()).await?
            }
            other => debug!(field = other, "ignoring unknown form field"),
        }
    }

    let media = session.commit(fields).await?;

    let mut headers = HeaderMap::new();
    if let Ok(location) = HeaderValue::from_str(&format!("/media/{}", media.id)) {
        headers.insert(header::LOCATION, location);
    }
    Ok((
        StatusCode::CREATED,
        headers,
        Json(CreatedMedia { id: media.id }),
    ))
}

/// GET `/media`: summaries in creation order, supports
/// `?uploader=&limit=&continuation-token=`
pub async fn list_media(
    State(state): State<AppState>,
    Query(q): Query<ListMediaQuery>,
) -> Result<Response, AppError> {
    let after = q
        .continuation_token
        .as_deref()
        .map(decode_continuation_token)
        .transpose()?;
    let query = ListQuery {
        uploader_ref: q.uploader.filter(|u| !u.is_empty()),
        after,
        limit: q.limit,
    };

    let page = state.catalog.list(&query).await?;
    let summaries: Vec<MediaSummary> = page.items.iter().map(MediaObject::summary).collect();

    let mut response = Json(summaries).into_response();
    if let Some(cursor) = page.next_cursor {
        if let Ok(value) = HeaderValue::from_str(&encode_continuation_token(cursor)) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(NEXT_CONTINUATION_TOKEN), value);
        }
    }
    Ok(response)
}

/// GET `/media/{id}`: metadata only.
pub async fn get_media(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MediaObject>, AppError> {
    Ok(Json(state.catalog.get_by_id(&id).await?))
}

/// PATCH `/media/{id}`: change descriptive fields.
pub async fn update_media(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<MediaUpdate>,
) -> Result<Json<MediaObject>, AppError> {
    Ok(Json(state.catalog.update(&id, update).await?))
}

/// DELETE `/media/{id}`: remove the entry and collect unreferenced blobs.
pub async fn delete_media(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.reaper.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/media/{id}/content`: whole payload or a single `Range`.
/// HEAD is answered by the same handler with the body stripped.
pub async fn get_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let range = headers.get(header::RANGE).map(|value| value.to_str());
    let range = match range {
        // Non-ASCII header values are treated as malformed.
        Some(Err(_)) => Some(""),
        Some(Ok(value)) => Some(value),
        None => None,
    };
    Ok(state.engine.stream(&id, range).await?.into_response())
}

/// GET `/media/{id}/thumbnail`
pub async fn get_thumbnail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    Ok(state.engine.thumbnail(&id).await?.into_response())
}

/// Await one read from the multipart form, giving up after `idle`.
async fn within<T, F>(idle: Duration, read: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, MultipartError>>,
{
    match time::timeout(idle, read).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!(?idle, "upload form stalled");
            Err(IngestError::Timeout(idle).into())
        }
    }
}

fn part_stream<'a>(field: Field<'a>) -> impl Stream<Item = io::Result<Bytes>> + Send + 'a {
    field.map(|chunk| chunk.map_err(multipart_io_error))
}

fn multipart_io_error(err: MultipartError) -> io::Error {
    let kind = if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        io::ErrorKind::FileTooLarge
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, err.body_text())
}

fn encode_continuation_token(seq: i64) -> String {
    general_purpose::STANDARD.encode(seq.to_string())
}

fn decode_continuation_token(token: &str) -> Result<i64, AppError> {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| AppError::validation("invalid continuation token"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_tokens_wrap_the_sequence() {
        let token = encode_continuation_token(42);
        assert_eq!(decode_continuation_token(&token).unwrap(), 42);
        assert!(decode_continuation_token("not base64!").is_err());
        let not_a_number = general_purpose::STANDARD.encode("abc");
        assert!(decode_continuation_token(&not_a_number).is_err());
    }
}
