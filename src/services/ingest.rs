//! src/services/ingest.rs
//!
//! IngestPipeline: turns an upload (descriptive fields, a primary payload
//! stream, an optional thumbnail stream) into a registered media object with
//! all-or-nothing visibility.
//!
//! A session moves `Receiving -> Writing -> Registering -> Committed`, or to
//! `Failed` from any state. Payloads are written to the Blob Store first; the
//! catalog row is inserted only after every blob is durable, and the caller
//! gets the new id only after the row is committed. Blobs written by a failed
//! session stay behind unreferenced: they are content-addressed, so a retry
//! with the same bytes reuses them, and `sweep` removes them otherwise.

use crate::{
    models::media::{
        DEFAULT_CONTENT_TYPE, DEFAULT_THUMBNAIL_CONTENT_TYPE, DescriptiveFields, MediaObject,
        ThumbnailRef,
    },
    services::{
        blob_store::{BlobError, BlobReceipt, BlobStore, PutLimits},
        catalog::{Catalog, CatalogError, NewMedia},
    },
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::{fmt, io, time::Duration};
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}")]
    Validation(String),
    #[error("payload exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: u64 },
    #[error("no data received within {0:?}, upload aborted")]
    Timeout(Duration),
    #[error("upload stream interrupted: {0}")]
    Interrupted(io::Error),
    #[error(transparent)]
    Blob(BlobError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl From<BlobError> for IngestError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::PayloadTooLarge { limit } => Self::PayloadTooLarge { limit },
            BlobError::IdleTimeout(idle) => Self::Timeout(idle),
            BlobError::Source(source) => Self::Interrupted(source),
            other => Self::Blob(other),
        }
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestState {
    Receiving,
    Writing,
    Registering,
    Committed,
    Failed,
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Receiving => "receiving",
            Self::Writing => "writing",
            Self::Registering => "registering",
            Self::Committed => "committed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct IngestLimits {
    pub max_upload_bytes: u64,
    pub max_thumbnail_bytes: u64,
    /// Longest allowed pause between two received chunks.
    pub idle_timeout: Duration,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_upload_bytes: 2 * 1024 * 1024 * 1024,
            max_thumbnail_bytes: 10 * 1024 * 1024,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// A payload stream with its declared content type.
pub struct Upload<S> {
    pub content_type: Option<String>,
    pub stream: S,
}

#[derive(Clone)]
pub struct IngestPipeline {
    blobs: BlobStore,
    catalog: Catalog,
    limits: IngestLimits,
}

impl IngestPipeline {
    pub fn new(blobs: BlobStore, catalog: Catalog, limits: IngestLimits) -> Self {
        Self {
            blobs,
            catalog,
            limits,
        }
    }

    pub fn limits(&self) -> &IngestLimits {
        &self.limits
    }

    /// Start a session that receives parts one at a time.
    pub fn begin(&self) -> IngestSession {
        IngestSession {
            pipeline: self.clone(),
            state: IngestState::Receiving,
            primary: None,
            thumbnail: None,
        }
    }

    /// Run a whole upload whose parts are all at hand.
    pub async fn ingest<P, T>(
        &self,
        fields: DescriptiveFields,
        primary: Upload<P>,
        thumbnail: Option<Upload<T>>,
    ) -> IngestResult<MediaObject>
    where
        P: Stream<Item = io::Result<Bytes>> + Send,
        T: Stream<Item = io::Result<Bytes>> + Send,
    {
        let mut session = self.begin();
        session
            .receive_primary(primary.content_type, primary.stream)
            .await?;
        if let Some(thumb) = thumbnail {
            session
                .receive_thumbnail(thumb.content_type, thumb.stream)
                .await?;
        }
        session.commit(fields).await
    }
}

struct StoredPart {
    receipt: BlobReceipt,
    content_type: String,
}

/// One upload in progress.
///
/// Blob pins taken while receiving are held until the session is committed
/// or dropped, so the payloads cannot be collected before registration.
pub struct IngestSession {
    pipeline: IngestPipeline,
    state: IngestState,
    primary: Option<StoredPart>,
    thumbnail: Option<StoredPart>,
}

impl IngestSession {
    pub fn state(&self) -> IngestState {
        self.state
    }

    /// Stream the primary payload into the Blob Store.
    pub async fn receive_primary<S>(&mut self, content_type: Option<String>, stream: S) -> IngestResult<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_open()?;
        if self.primary.is_some() {
            return self.fail(IngestError::Validation("more than one file part".into()));
        }

        let max_bytes = self.pipeline.limits.max_upload_bytes;
        let receipt = match self.write(stream, max_bytes).await {
            Ok(Some(receipt)) if receipt.byte_length > 0 => receipt,
            Ok(_) => return self.fail(IngestError::Validation("file part is empty".into())),
            Err(err) => return self.fail(err),
        };

        self.primary = Some(StoredPart {
            receipt,
            content_type: non_empty(content_type).unwrap_or_else(|| DEFAULT_CONTENT_TYPE.into()),
        });
        self.transition(IngestState::Receiving);
        Ok(())
    }

    /// Stream the thumbnail into the Blob Store. An empty thumbnail part is
    /// treated as absent.
    pub async fn receive_thumbnail<S>(&mut self, content_type: Option<String>, stream: S) -> IngestResult<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_open()?;
        if self.thumbnail.is_some() {
            return self.fail(IngestError::Validation("more than one thumbnail part".into()));
        }

        let max_bytes = self.pipeline.limits.max_thumbnail_bytes;
        match self.write(stream, max_bytes).await {
            Ok(Some(receipt)) if receipt.byte_length > 0 => {
                self.thumbnail = Some(StoredPart {
                    receipt,
                    content_type: non_empty(content_type)
                        .unwrap_or_else(|| DEFAULT_THUMBNAIL_CONTENT_TYPE.into()),
                });
            }
            Ok(_) => debug!("empty thumbnail part ignored"),
            Err(err) => return self.fail(err),
        }
        self.transition(IngestState::Receiving);
        Ok(())
    }

    /// Register the received payloads. On success the returned object is
    /// immediately readable and streamable.
    pub async fn commit(mut self, fields: DescriptiveFields) -> IngestResult<MediaObject> {
        self.ensure_open()?;
        let (digest, content_type) = match self.primary.as_ref() {
            Some(primary) => (primary.receipt.digest.clone(), primary.content_type.clone()),
            None => return self.fail(IngestError::Validation("file part is required".into())),
        };

        let new = NewMedia {
            fields,
            content_type,
            digest,
            thumbnail: self.thumbnail.as_ref().map(|t| ThumbnailRef {
                digest: t.receipt.digest.clone(),
                content_type: t.content_type.clone(),
            }),
        };

        self.transition(IngestState::Registering);
        match self.pipeline.catalog.create(new).await {
            Ok(media) => {
                self.transition(IngestState::Committed);
                info!(id = %media.id, digest = %media.digest, "ingest committed");
                Ok(media)
            }
            Err(err) => self.fail(err.into()),
        }
    }

    /// Write one part. `None` when the stream ended before its first byte.
    async fn write<S>(&mut self, stream: S, max_bytes: u64) -> IngestResult<Option<BlobReceipt>>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let idle = self.pipeline.limits.idle_timeout;
        let mut stream = Box::pin(stream.peekable());
        match time::timeout(idle, stream.as_mut().peek()).await {
            Err(_) => return Err(IngestError::Timeout(idle)),
            Ok(None) => return Ok(None),
            Ok(Some(_)) => {}
        }

        self.transition(IngestState::Writing);
        let limits = PutLimits {
            max_bytes: Some(max_bytes),
            idle_timeout: Some(idle),
        };
        let receipt = self.pipeline.blobs.put_with_limits(stream, &limits).await?;
        Ok(Some(receipt))
    }

    fn ensure_open(&self) -> IngestResult<()> {
        match self.state {
            IngestState::Committed | IngestState::Failed => Err(IngestError::Validation(format!(
                "upload session is already {}",
                self.state
            ))),
            _ => Ok(()),
        }
    }

    fn transition(&mut self, next: IngestState) {
        debug!(from = %self.state, to = %next, "ingest state");
        self.state = next;
    }

    fn fail<T>(&mut self, err: IngestError) -> IngestResult<T> {
        warn!(state = %self.state, "ingest failed: {}", err);
        self.state = IngestState::Failed;
        Err(err)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
