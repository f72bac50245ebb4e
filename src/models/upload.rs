//! Upload batch request, the per-file descriptor that flows through the
//! pipeline, and the upload response.

use crate::models::file_record::{DerivativeMap, ViewType};
use bytes::Bytes;
use serde::Serialize;

/// A file as delivered by the transport layer.
#[derive(Debug, Clone)]
pub struct RawFile {
    pub client_filename: String,
    pub mime_type: String,
    pub content: Bytes,
}

impl RawFile {
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// One upload call: an already-authenticated owner, the options applied to
/// every file, and the files themselves in client order.
#[derive(Debug, Clone, Default)]
pub struct UploadBatchRequest {
    pub owner_id: String,
    /// Applied to files whose name carries no extension.
    pub extension_override: Option<String>,
    pub resize_options: Vec<String>,
    pub scale_options: Vec<String>,
    /// Optional storage category, honoured only if configured.
    pub folder_type: Option<String>,
    pub group: Option<String>,
    pub files: Vec<RawFile>,
}

/// Immutable per-file descriptor. Pipeline steps return new descriptors
/// instead of mutating this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub client_filename: String,
    /// Name on disk, `{stem}.{extension}` (or just the stem when the
    /// extension is empty).
    pub server_filename: String,
    /// Without the leading dot.
    pub extension: String,
    pub mime_type: String,
    pub view_type: ViewType,
}

impl StagedFile {
    /// Same file under a different extension.
    pub fn with_extension(&self, extension: &str) -> Self {
        let extension = extension.trim_start_matches('.').to_string();
        let stem = match self.extension.is_empty() {
            true => self.server_filename.as_str(),
            false => self
                .server_filename
                .strip_suffix(&format!(".{}", self.extension))
                .unwrap_or(&self.server_filename),
        };
        let server_filename = if extension.is_empty() {
            stem.to_string()
        } else {
            format!("{}.{}", stem, extension)
        };
        Self {
            server_filename,
            extension,
            ..self.clone()
        }
    }
}

/// Output of the derivative pipeline for one file, ready to persist.
#[derive(Debug, Clone)]
pub struct ProcessedFile {
    pub staged: StagedFile,
    pub group: String,
    pub storage_path: String,
    pub size_bytes: i64,
    pub derivative_map: DerivativeMap,
    pub perceptual_hash: Option<String>,
}

/// Per-file entry of the upload response.
#[derive(Serialize, Debug, Clone)]
pub struct UploadedFile {
    pub domain: String,
    pub server_filename: String,
    pub file_url: String,
    pub file_name: String,
    pub file_hash: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct UploadResponse {
    pub files: Vec<UploadedFile>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(name: &str, ext: &str) -> StagedFile {
        StagedFile {
            client_filename: "photo".into(),
            server_filename: name.into(),
            extension: ext.into(),
            mime_type: "image/png".into(),
            view_type: ViewType::Image,
        }
    }

    #[test]
    fn with_extension_replaces_existing_suffix() {
        let original = staged("file_abc_1.png", "png");
        let webp = original.with_extension("webp");
        assert_eq!(webp.server_filename, "file_abc_1.webp");
        assert_eq!(webp.extension, "webp");
        assert_eq!(original.server_filename, "file_abc_1.png");
    }

    #[test]
    fn with_extension_appends_when_missing() {
        let bare = staged("file_abc_1", "");
        assert_eq!(bare.with_extension(".jpg").server_filename, "file_abc_1.jpg");
    }
}
