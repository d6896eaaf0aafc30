//! Core data models for the media store.
//!
//! `MediaObject` maps to the `media` table via `sqlx::FromRow` and serializes
//! as JSON via `serde`. `Digest` is the content address shared by the Blob
//! Store and the catalog.

pub mod digest;
pub mod media;
