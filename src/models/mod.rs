//! Core data models for the file ingestion service.
//!
//! Records map to the `file_records` table via `sqlx::FromRow` and serialize
//! as JSON via `serde`. Presets are deserialized from the external preset
//! table.

pub mod file_record;
pub mod preset;
pub mod upload;
