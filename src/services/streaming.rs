//! src/services/streaming.rs
//!
//! RangeServingEngine: resolves a media id through the catalog and streams
//! either the whole payload or a single requested byte range straight from
//! the Blob Store. The body is a pull-driven [`BlobReadStream`]: the next
//! chunk is read only after the transport has taken the previous one, and a
//! disconnecting client drops the stream, which closes the file.

use crate::{
    models::{
        digest::Digest,
        media::{DEFAULT_THUMBNAIL_CONTENT_TYPE, MediaObject},
    },
    services::{
        blob_store::{BlobError, BlobReadStream, BlobStore},
        catalog::{Catalog, CatalogError},
        range::{ByteWindow, parse_range_header, unsatisfied_content_range},
    },
};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("media `{0}` not found")]
    NotFound(String),
    #[error("media `{0}` has no thumbnail")]
    NoThumbnail(String),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Catalog(CatalogError),
}

impl From<CatalogError> for ServeError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(id) => Self::NotFound(id),
            other => Self::Catalog(other),
        }
    }
}

pub type ServeResult<T> = Result<T, ServeError>;

/// Status, headers and (for 200/206) a lazily read body.
pub struct MediaStream {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<BlobReadStream>,
}

impl IntoResponse for MediaStream {
    fn into_response(self) -> Response {
        let body = match self.body {
            Some(stream) => Body::from_stream(stream),
            None => Body::empty(),
        };
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[derive(Clone)]
pub struct RangeServingEngine {
    catalog: Catalog,
    blobs: BlobStore,
}

impl RangeServingEngine {
    pub fn new(catalog: Catalog, blobs: BlobStore) -> Self {
        Self { catalog, blobs }
    }

    /// Serve the primary payload of `id`, honouring an optional `Range`
    /// header value.
    ///
    /// - no range: 200 with the whole object
    /// - satisfiable single range: 206 with `Content-Range`
    /// - anything else (past the end, malformed, multiple ranges): 416 with
    ///   `Content-Range: bytes */{total}` and no body
    #[tracing::instrument(skip(self))]
    pub async fn stream(&self, id: &str, range: Option<&str>) -> ServeResult<MediaStream> {
        let media = self.catalog.get_by_id(id).await?;
        let total = media.byte_length.max(0) as u64;
        let mut headers = object_headers(&media.content_type, &media.digest, media.created_at);

        let Some(range) = range else {
            let body = self.open(&media, &media.digest, 0, total).await?;
            set_content_length(&mut headers, total);
            return Ok(MediaStream {
                status: StatusCode::OK,
                headers,
                body: Some(body),
            });
        };

        let window = match parse_range_header(range).and_then(|spec| spec.resolve(total)) {
            Ok(window) => window,
            Err(err) => {
                debug!(id, range, total, "refusing range: {}", err);
                insert_header(&mut headers, header::CONTENT_RANGE, &unsatisfied_content_range(total));
                return Ok(MediaStream {
                    status: StatusCode::RANGE_NOT_SATISFIABLE,
                    headers,
                    body: None,
                });
            }
        };

        let body = self.open(&media, &media.digest, window.start, window.end).await?;
        set_partial_headers(&mut headers, window, total);
        Ok(MediaStream {
            status: StatusCode::PARTIAL_CONTENT,
            headers,
            body: Some(body),
        })
    }

    /// Serve the thumbnail of `id` with its stored content type.
    pub async fn thumbnail(&self, id: &str) -> ServeResult<MediaStream> {
        let media = self.catalog.get_by_id(id).await?;
        let Some(digest) = media.thumbnail_digest.clone() else {
            return Err(ServeError::NoThumbnail(id.to_string()));
        };
        let content_type = media
            .thumbnail_content_type
            .clone()
            .unwrap_or_else(|| DEFAULT_THUMBNAIL_CONTENT_TYPE.into());

        let total = match self.blobs.size(&digest).await {
            Ok(total) => total,
            Err(BlobError::NotFound(_)) => return Err(ServeError::NotFound(id.to_string())),
            Err(err) => return Err(err.into()),
        };
        let body = self.open(&media, &digest, 0, total).await?;

        let mut headers = object_headers(&content_type, &digest, media.created_at);
        set_content_length(&mut headers, total);
        Ok(MediaStream {
            status: StatusCode::OK,
            headers,
            body: Some(body),
        })
    }

    async fn open(&self, media: &MediaObject, digest: &Digest, start: u64, end: u64) -> ServeResult<BlobReadStream> {
        match self.blobs.open_range(digest, start, end).await {
            Ok(stream) => Ok(stream),
            // Metadata resolved but the blob is gone: the object was deleted
            // between the two lookups.
            Err(BlobError::NotFound(_)) => Err(ServeError::NotFound(media.id.clone())),
            Err(err) => Err(err.into()),
        }
    }
}

fn object_headers(content_type: &str, digest: &Digest, created_at: DateTime<Utc>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CONTENT_DISPOSITION, HeaderValue::from_static("inline"));
    insert_header(&mut headers, header::ETAG, &format!("\"{}\"", digest.hex()));
    insert_header(
        &mut headers,
        header::LAST_MODIFIED,
        &created_at.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
    );
    headers
}

fn set_content_length(headers: &mut HeaderMap, len: u64) {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
}

fn set_partial_headers(headers: &mut HeaderMap, window: ByteWindow, total: u64) {
    set_content_length(headers, window.len());
    insert_header(headers, header::CONTENT_RANGE, &window.content_range(total));
}

fn insert_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        models::media::DescriptiveFields,
        services::{
            blob_store::BlobStoreOptions,
            ingest::{IngestLimits, IngestPipeline, Upload},
        },
    };
    use bytes::Bytes;
    use futures::{TryStreamExt, stream};
    use std::{io, sync::Arc};
    use tempfile::TempDir;

    type Chunks = stream::Iter<std::vec::IntoIter<io::Result<Bytes>>>;

    fn upload(data: &'static [u8], content_type: &str) -> Upload<Chunks> {
        Upload {
            content_type: Some(content_type.into()),
            stream: stream::iter(vec![Ok(Bytes::from_static(data))]),
        }
    }

    async fn setup(dir: &TempDir) -> (RangeServingEngine, IngestPipeline) {
        let pool = Arc::new(db::connect_in_memory().await.unwrap());
        let blobs = BlobStore::new(
            dir.path(),
            BlobStoreOptions {
                chunk_size: 3,
                ..BlobStoreOptions::default()
            },
        );
        let catalog = Catalog::new(pool, blobs.clone());
        let pipeline = IngestPipeline::new(blobs.clone(), catalog.clone(), IngestLimits::default());
        (RangeServingEngine::new(catalog, blobs), pipeline)
    }

    async fn ingest(pipeline: &IngestPipeline, data: &'static [u8], thumb: Option<&'static [u8]>) -> MediaObject {
        pipeline
            .ingest(
                DescriptiveFields {
                    title: "t".into(),
                    description: String::new(),
                    uploader_ref: "alice".into(),
                },
                upload(data, "video/mp4"),
                thumb.map(|t| upload(t, "image/png")),
            )
            .await
            .unwrap()
    }

    async fn body_of(stream: MediaStream) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.body.unwrap().try_collect().await.unwrap();
        chunks.concat()
    }

    fn header_str<'a>(stream: &'a MediaStream, name: header::HeaderName) -> &'a str {
        stream.headers.get(name).unwrap().to_str().unwrap()
    }

    #[tokio::test]
    async fn single_range_is_partial_content() {
        let dir = TempDir::new().unwrap();
        let (engine, pipeline) = setup(&dir).await;
        let media = ingest(&pipeline, b"0123456789", None).await;

        let stream = engine.stream(&media.id, Some("bytes=2-5")).await.unwrap();

        assert_eq!(stream.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(header_str(&stream, header::CONTENT_RANGE), "bytes 2-5/10");
        assert_eq!(header_str(&stream, header::CONTENT_LENGTH), "4");
        assert_eq!(header_str(&stream, header::CONTENT_TYPE), "video/mp4");
        assert_eq!(body_of(stream).await, b"2345".to_vec());
    }

    #[tokio::test]
    async fn full_body_equals_open_ended_range() {
        let dir = TempDir::new().unwrap();
        let (engine, pipeline) = setup(&dir).await;
        let media = ingest(&pipeline, b"0123456789", None).await;

        let full = engine.stream(&media.id, None).await.unwrap();
        assert_eq!(full.status, StatusCode::OK);
        assert_eq!(header_str(&full, header::CONTENT_LENGTH), "10");
        assert_eq!(header_str(&full, header::ACCEPT_RANGES), "bytes");
        let from_zero = engine.stream(&media.id, Some("bytes=0-")).await.unwrap();
        assert_eq!(from_zero.status, StatusCode::PARTIAL_CONTENT);

        assert_eq!(body_of(full).await, body_of(from_zero).await);
    }

    #[tokio::test]
    async fn every_window_matches_the_slice() {
        let dir = TempDir::new().unwrap();
        let (engine, pipeline) = setup(&dir).await;
        let payload = b"abcdefghij";
        let media = ingest(&pipeline, payload, None).await;

        for start in 0..10usize {
            for last in start..10usize {
                let range = format!("bytes={}-{}", start, last);
                let stream = engine.stream(&media.id, Some(&range)).await.unwrap();
                assert_eq!(body_of(stream).await, payload[start..=last].to_vec(), "{range}");
            }
        }
    }

    #[tokio::test]
    async fn unsatisfiable_ranges_get_416() {
        let dir = TempDir::new().unwrap();
        let (engine, pipeline) = setup(&dir).await;
        let media = ingest(&pipeline, b"0123456789", None).await;

        for range in ["bytes=10-", "bytes=20-30", "bytes=0-1,3-4", "bytes=oops"] {
            let stream = engine.stream(&media.id, Some(range)).await.unwrap();
            assert_eq!(stream.status, StatusCode::RANGE_NOT_SATISFIABLE, "{range}");
            assert_eq!(header_str(&stream, header::CONTENT_RANGE), "bytes */10");
            assert!(stream.body.is_none());
        }
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = setup(&dir).await;

        assert!(matches!(
            engine.stream("unknown-id", None).await,
            Err(ServeError::NotFound(id)) if id == "unknown-id"
        ));
        assert!(matches!(
            engine.thumbnail("unknown-id").await,
            Err(ServeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn thumbnail_keeps_its_content_type() {
        let dir = TempDir::new().unwrap();
        let (engine, pipeline) = setup(&dir).await;
        let with_thumb = ingest(&pipeline, b"video", Some(b"png bytes")).await;
        let without = ingest(&pipeline, b"other video", None).await;

        let thumb = engine.thumbnail(&with_thumb.id).await.unwrap();
        assert_eq!(thumb.status, StatusCode::OK);
        assert_eq!(header_str(&thumb, header::CONTENT_TYPE), "image/png");
        assert_eq!(body_of(thumb).await, b"png bytes".to_vec());

        assert!(matches!(
            engine.thumbnail(&without.id).await,
            Err(ServeError::NoThumbnail(_))
        ));
    }
}
