//! src/services/catalog.rs
//!
//! Catalog: the Metadata Catalog. Maps server-generated media ids to their
//! descriptive fields and to Blob Store digests, persisted in SQLite.
//!
//! Registration holds the Blob Store lock for every digest it references
//! while it checks that the blobs exist and inserts the row, so a concurrent
//! garbage collection of the same digest either runs entirely before (and the
//! registration fails validation) or entirely after (and sees the reference).

use crate::{
    models::{
        digest::Digest,
        media::{DescriptiveFields, MediaObject, MediaUpdate, ThumbnailRef},
    },
    services::blob_store::{BlobError, BlobStore},
};
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

macro_rules! media_columns {
    () => {
        "seq, id, digest, byte_length, content_type, title, description, uploader_ref, \
         thumbnail_digest, thumbnail_content_type, created_at, updated_at"
    };
}

const MAX_TITLE_LEN: usize = 512;
const MAX_DESCRIPTION_LEN: usize = 16 * 1024;
const MAX_UPLOADER_REF_LEN: usize = 320;
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("media `{0}` not found")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("media `{0}` is already registered")]
    Conflict(String),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Everything needed to register a new media object.
#[derive(Clone, Debug)]
pub struct NewMedia {
    pub fields: DescriptiveFields,
    pub content_type: String,
    pub digest: Digest,
    pub thumbnail: Option<ThumbnailRef>,
}

/// Listing filter and cursor.
#[derive(Clone, Debug, Default)]
pub struct ListQuery {
    pub uploader_ref: Option<String>,
    /// Only entries created after this sequence number.
    pub after: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug)]
pub struct MediaPage {
    pub items: Vec<MediaObject>,
    /// Cursor for the next page, present when more entries follow.
    pub next_cursor: Option<i64>,
}

#[derive(Clone)]
pub struct Catalog {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    blobs: BlobStore,
}

impl Catalog {
    pub fn new(db: Arc<SqlitePool>, blobs: BlobStore) -> Self {
        Self { db, blobs }
    }

    /// Register a media object whose payloads are already in the Blob Store.
    ///
    /// `byte_length` is taken from the stored blob, not from the caller.
    #[tracing::instrument(skip(self, new), fields(digest = %new.digest))]
    pub async fn create(&self, new: NewMedia) -> CatalogResult<MediaObject> {
        ensure_fields(&new.fields)?;
        if new.content_type.trim().is_empty() {
            return Err(CatalogError::Validation("content type must not be empty".into()));
        }

        let mut digests = vec![new.digest.clone()];
        if let Some(thumb) = &new.thumbnail {
            digests.push(thumb.digest.clone());
        }
        digests.sort();
        digests.dedup();
        let mut guards = Vec::with_capacity(digests.len());
        for digest in &digests {
            guards.push(self.blobs.lock(digest).await);
        }

        let byte_length = match self.blobs.size(&new.digest).await {
            Ok(len) => len,
            Err(BlobError::NotFound(digest)) => {
                return Err(CatalogError::Validation(format!(
                    "digest `{}` does not exist in the blob store",
                    digest
                )));
            }
            Err(err) => return Err(err.into()),
        };
        if let Some(thumb) = &new.thumbnail {
            if !self.blobs.exists(&thumb.digest).await? {
                return Err(CatalogError::Validation(format!(
                    "thumbnail digest `{}` does not exist in the blob store",
                    thumb.digest
                )));
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let inserted = sqlx::query_as::<_, MediaObject>(concat!(
            "INSERT INTO media (id, digest, byte_length, content_type, title, description, \
             uploader_ref, thumbnail_digest, thumbnail_content_type, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING ",
            media_columns!()
        ))
        .bind(&id)
        .bind(&new.digest)
        .bind(byte_length as i64)
        .bind(&new.content_type)
        .bind(&new.fields.title)
        .bind(&new.fields.description)
        .bind(&new.fields.uploader_ref)
        .bind(new.thumbnail.as_ref().map(|t| t.digest.clone()))
        .bind(new.thumbnail.as_ref().map(|t| t.content_type.clone()))
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await;
        drop(guards);

        match inserted {
            Ok(media) => {
                info!(id = %media.id, byte_length, "registered media");
                Ok(media)
            }
            Err(err) if is_unique_violation(&err) => Err(CatalogError::Conflict(id)),
            Err(err) => Err(CatalogError::Sqlx(err)),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> CatalogResult<MediaObject> {
        sqlx::query_as::<_, MediaObject>(concat!(
            "SELECT ",
            media_columns!(),
            " FROM media WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    /// All entries, oldest first.
    pub async fn list_all(&self) -> CatalogResult<Vec<MediaObject>> {
        Ok(self.list(&ListQuery::default()).await?.items)
    }

    /// Entries of one uploader, oldest first.
    pub async fn list_by_uploader(&self, uploader_ref: &str) -> CatalogResult<Vec<MediaObject>> {
        let query = ListQuery {
            uploader_ref: Some(uploader_ref.to_string()),
            ..ListQuery::default()
        };
        Ok(self.list(&query).await?.items)
    }

    /// Filtered, paginated listing in creation order.
    ///
    /// Ties on creation time are broken by the insertion sequence, so the
    /// order is stable across calls.
    pub async fn list(&self, query: &ListQuery) -> CatalogResult<MediaPage> {
        let mut builder =
            QueryBuilder::<Sqlite>::new(concat!("SELECT ", media_columns!(), " FROM media WHERE 1 = 1"));

        if let Some(uploader) = &query.uploader_ref {
            builder.push(" AND uploader_ref = ");
            builder.push_bind(uploader.clone());
        }
        if let Some(after) = query.after {
            builder.push(" AND seq > ");
            builder.push_bind(after);
        }
        builder.push(" ORDER BY seq ASC");

        let limit = query.limit.map(|l| l.clamp(1, MAX_PAGE_SIZE));
        if let Some(limit) = limit {
            builder.push(" LIMIT ");
            builder.push_bind((limit + 1) as i64);
        }

        let mut items: Vec<MediaObject> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut next_cursor = None;
        if let Some(limit) = limit {
            if items.len() > limit {
                items.truncate(limit);
                next_cursor = items.last().map(|m| m.seq);
            }
        }
        debug!(count = items.len(), more = next_cursor.is_some(), "listed media");

        Ok(MediaPage { items, next_cursor })
    }

    /// Change descriptive fields. Storage references are never touched.
    pub async fn update(&self, id: &str, update: MediaUpdate) -> CatalogResult<MediaObject> {
        if let Some(title) = &update.title {
            ensure_title(title)?;
        }
        if let Some(description) = &update.description {
            ensure_description(description)?;
        }
        if let Some(uploader) = &update.uploader_ref {
            ensure_uploader(uploader)?;
        }

        sqlx::query_as::<_, MediaObject>(concat!(
            "UPDATE media SET title = COALESCE(?, title), \
             description = COALESCE(?, description), \
             uploader_ref = COALESCE(?, uploader_ref), \
             updated_at = ? WHERE id = ? RETURNING ",
            media_columns!()
        ))
        .bind(update.title)
        .bind(update.description)
        .bind(update.uploader_ref)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    /// Remove the catalog entry and return it. Blob bytes are left alone.
    pub async fn unlink(&self, id: &str) -> CatalogResult<MediaObject> {
        let removed = sqlx::query_as::<_, MediaObject>(concat!(
            "DELETE FROM media WHERE id = ? RETURNING ",
            media_columns!()
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;

        info!(id, digest = %removed.digest, "unlinked media");
        Ok(removed)
    }

    /// Number of catalog entries referencing `digest` as payload or thumbnail.
    pub async fn count_references(&self, digest: &Digest) -> CatalogResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM media WHERE digest = ? OR thumbnail_digest = ?",
        )
        .bind(digest)
        .bind(digest)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }
}

fn ensure_fields(fields: &DescriptiveFields) -> CatalogResult<()> {
    ensure_title(&fields.title)?;
    ensure_description(&fields.description)?;
    ensure_uploader(&fields.uploader_ref)
}

fn ensure_title(title: &str) -> CatalogResult<()> {
    if title.trim().is_empty() {
        return Err(CatalogError::Validation("title must not be empty".into()));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(CatalogError::Validation(format!(
            "title must be at most {} bytes",
            MAX_TITLE_LEN
        )));
    }
    Ok(())
}

fn ensure_description(description: &str) -> CatalogResult<()> {
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(CatalogError::Validation(format!(
            "description must be at most {} bytes",
            MAX_DESCRIPTION_LEN
        )));
    }
    Ok(())
}

fn ensure_uploader(uploader_ref: &str) -> CatalogResult<()> {
    if uploader_ref.trim().is_empty() {
        return Err(CatalogError::Validation("uploaderRef must not be empty".into()));
    }
    if uploader_ref.len() > MAX_UPLOADER_REF_LEN {
        return Err(CatalogError::Validation(format!(
            "uploaderRef must be at most {} bytes",
            MAX_UPLOADER_REF_LEN
        )));
    }
    Ok(())
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
