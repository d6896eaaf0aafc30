//! Media deletion and blob garbage collection.
//!
//! Deleting a media object unlinks its catalog row first, then collects each
//! digest it referenced. The keep-or-remove decision for a digest is made
//! under that digest's Blob Store lock, the same lock catalog registration
//! holds while inserting, so a blob is never removed while a registration
//! that references it is in flight. Pins held by running ingests are checked
//! under the lock as well.

use crate::{
    models::{digest::Digest, media::MediaObject},
    services::{
        blob_store::BlobStore,
        catalog::{Catalog, CatalogError},
    },
};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub staging_removed: usize,
}

#[derive(Clone)]
pub struct BlobReaper {
    blobs: BlobStore,
    catalog: Catalog,
}

impl BlobReaper {
    pub fn new(blobs: BlobStore, catalog: Catalog) -> Self {
        Self { blobs, catalog }
    }

    /// Delete a media object and synchronously collect blobs nobody else
    /// references.
    pub async fn remove(&self, id: &str) -> Result<MediaObject, CatalogError> {
        let removed = self.catalog.unlink(id).await?;
        for digest in removed.referenced_digests() {
            self.collect(&digest).await?;
        }
        Ok(removed)
    }

    /// Remove `digest` if no catalog entry references it and no ingest pins
    /// it. Returns whether bytes were removed.
    pub async fn collect(&self, digest: &Digest) -> Result<bool, CatalogError> {
        let guard = self.blobs.lock(digest).await;
        let references = self.catalog.count_references(digest).await?;
        if references > 0 {
            debug!(%digest, references, "blob still referenced");
            return Ok(false);
        }
        Ok(self.blobs.delete(&guard).await?)
    }

    /// Mark-and-sweep over the whole Blob Store.
    ///
    /// Removes blobs left unreferenced by failed ingests and staging files
    /// older than `stale_after`.
    pub async fn sweep(&self, stale_after: Duration) -> Result<SweepReport, CatalogError> {
        let mut report = SweepReport::default();
        for digest in self.blobs.digests().await? {
            report.scanned += 1;
            if self.collect(&digest).await? {
                report.removed += 1;
            }
        }
        report.staging_removed = self.blobs.clean_staging(stale_after).await?;

        info!(
            scanned = report.scanned,
            removed = report.removed,
            staging_removed = report.staging_removed,
            "blob sweep finished"
        );
        Ok(report)
    }
}
