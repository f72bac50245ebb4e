//! Represents a stored file and the derivatives generated from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Variant key (e.g. `resize_150x150`) to the derivative's relative path.
pub type DerivativeMap = BTreeMap<String, String>;

/// Coarse media classification. Only `Image` changes downstream behavior.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ViewType {
    Image,
    Video,
    Audio,
    Pdf,
    File,
}

impl ViewType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewType::Image => "image",
            ViewType::Video => "video",
            ViewType::Audio => "audio",
            ViewType::Pdf => "pdf",
            ViewType::File => "file",
        }
    }
}

/// One persisted asset.
///
/// Created once per uploaded file at batch-insert time. The only in-place
/// update is the `perceptual_hash` backfill.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    /// System-assigned identifier.
    pub file_id: Uuid,

    /// Principal that uploaded the file.
    pub owner_id: String,

    pub created_at: DateTime<Utc>,

    /// Name the client sent.
    pub client_filename: String,

    /// Globally unique name generated at intake; the lookup key for every
    /// other operation.
    pub server_filename: String,

    /// Logical bucket, `default` unless the caller chose one.
    #[sqlx(rename = "file_group")]
    pub group: String,

    pub view_type: ViewType,

    /// Extension without the leading dot, possibly empty.
    pub extension: String,

    /// Size of the stored base file in bytes.
    pub size_bytes: i64,

    pub mime_type: String,

    /// Directory of the base file relative to the storage root,
    /// e.g. `2025-06` or `2025-06/avatar`.
    pub storage_path: String,

    /// Empty for anything that is not an image.
    pub derivative_map: Json<DerivativeMap>,

    /// BlurHash placeholder; may be missing until backfilled.
    pub perceptual_hash: Option<String>,
}

impl FileRecord {
    /// Public path of the base file: `/{storage_path}/{server_filename}`.
    pub fn url(&self) -> String {
        relative_url(&self.storage_path, &self.server_filename)
    }

    pub fn needs_hash(&self) -> bool {
        self.view_type == ViewType::Image
            && self.perceptual_hash.as_deref().is_none_or(str::is_empty)
    }
}

/// A record as returned to clients, with its public addressing resolved.
#[derive(Serialize, Clone, Debug)]
pub struct FileView {
    #[serde(flatten)]
    pub record: FileRecord,
    pub domain: String,
    pub url: String,
}

impl FileView {
    pub fn new(record: FileRecord, domain: &str) -> Self {
        let url = record.url();
        Self {
            record,
            domain: domain.to_string(),
            url,
        }
    }
}

pub fn relative_url(storage_path: &str, file_name: &str) -> String {
    let dir = storage_path.trim_matches('/');
    if dir.is_empty() {
        format!("/{}", file_name)
    } else {
        format!("/{}/{}", dir, file_name)
    }
}
