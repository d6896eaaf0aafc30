//! Storage, catalog, ingest and streaming services behind the HTTP layer.

pub mod blob_store;
pub mod catalog;
pub mod ingest;
pub mod range;
pub mod reaper;
pub mod streaming;
