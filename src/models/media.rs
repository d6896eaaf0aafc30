//! Represents a media object registered in the Metadata Catalog.

use super::digest::Digest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Content type assumed for thumbnails uploaded without one.
pub const DEFAULT_THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

/// Content type assumed for primary payloads uploaded without one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A catalog entry describing one uploaded media payload.
///
/// The struct stores references into the Blob Store, never the bytes
/// themselves. `id`, `digest`, `byte_length` and `content_type` are fixed at
/// registration; only the descriptive fields change afterwards.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct MediaObject {
    /// Monotonic creation sequence. Internal ordering key.
    #[serde(skip)]
    pub seq: i64,

    /// Externally visible identifier (server-generated UUID).
    pub id: String,

    /// Content address of the primary payload.
    pub digest: Digest,

    /// Size of the primary payload in bytes.
    pub byte_length: i64,

    /// MIME type of the primary payload.
    pub content_type: String,

    pub title: String,
    pub description: String,

    /// Opaque, already-authenticated uploader reference.
    pub uploader_ref: String,

    /// Content address of the thumbnail, if one was uploaded.
    pub thumbnail_digest: Option<Digest>,

    pub thumbnail_content_type: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MediaObject {
    /// Digests this entry holds a reference on, deduplicated.
    pub fn referenced_digests(&self) -> Vec<Digest> {
        let mut digests = vec![self.digest.clone()];
        if let Some(thumb) = &self.thumbnail_digest {
            if *thumb != self.digest {
                digests.push(thumb.clone());
            }
        }
        digests
    }

    pub fn summary(&self) -> MediaSummary {
        MediaSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            uploader_ref: self.uploader_ref.clone(),
            content_type: self.content_type.clone(),
            byte_length: self.byte_length,
            has_thumbnail: self.thumbnail_digest.is_some(),
            created_at: self.created_at,
        }
    }
}

/// Listing view of a [`MediaObject`], without storage addresses.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MediaSummary {
    pub id: String,
    pub title: String,
    pub description: String,
    pub uploader_ref: String,
    pub content_type: String,
    pub byte_length: i64,
    pub has_thumbnail: bool,
    pub created_at: DateTime<Utc>,
}

/// Mutable descriptive metadata supplied at upload time.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DescriptiveFields {
    pub title: String,
    pub description: String,
    pub uploader_ref: String,
}

/// Partial update of descriptive metadata. Absent fields are left as-is.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MediaUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(alias = "uploaderRef")]
    pub uploader_ref: Option<String>,
}

/// A secondary payload attached to a media object.
#[derive(Clone, Debug)]
pub struct ThumbnailRef {
    pub digest: Digest,
    pub content_type: String,
}
