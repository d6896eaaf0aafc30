//! Shared handler state: one instance of each service over a common pool and
//! blob directory.

use crate::{
    config::AppConfig,
    services::{
        blob_store::{BlobStore, BlobStoreOptions},
        catalog::Catalog,
        ingest::{IngestLimits, IngestPipeline},
        reaper::BlobReaper,
        streaming::RangeServingEngine,
    },
};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub blobs: BlobStore,
    pub catalog: Catalog,
    pub ingest: IngestPipeline,
    pub engine: RangeServingEngine,
    pub reaper: BlobReaper,
}

impl AppState {
    pub fn new(
        db: Arc<SqlitePool>,
        storage_dir: impl Into<PathBuf>,
        options: BlobStoreOptions,
        limits: IngestLimits,
    ) -> Self {
        let blobs = BlobStore::new(storage_dir, options);
        let catalog = Catalog::new(db.clone(), blobs.clone());
        Self {
            ingest: IngestPipeline::new(blobs.clone(), catalog.clone(), limits),
            engine: RangeServingEngine::new(catalog.clone(), blobs.clone()),
            reaper: BlobReaper::new(blobs.clone(), catalog.clone()),
            db,
            blobs,
            catalog,
        }
    }

    pub fn from_config(db: Arc<SqlitePool>, cfg: &AppConfig) -> Self {
        Self::new(
            db,
            &cfg.storage_dir,
            cfg.blob_store_options(),
            cfg.ingest_limits(),
        )
    }
}
