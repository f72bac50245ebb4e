//! Addressing for base files and their derivatives on local disk.
//!
//! Layout beneath the storage root:
//! - base file: `{YYYY-MM}[/{category}]/{server_filename}`
//! - derivative: `{YYYY-MM}[/{category}]/{variant_key}/{server_filename}`
//!
//! Variant keys are pure functions of a preset's parameters, so identical
//! parameters always land in the same directory whatever the request.

use crate::{
    errors::{PipelineError, PipelineResult},
    models::{
        file_record::relative_url,
        preset::{Fit, ResizePreset, ScalePreset},
    },
};
use chrono::{DateTime, Utc};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// `scale_r{ratio}` when a ratio drives the output, `scale_w{width}`
/// otherwise.
pub fn scale_key(preset: &ScalePreset) -> String {
    match preset.effective_ratio() {
        Some(ratio) => format!("scale_r{}", ratio),
        None => format!("scale_w{}", preset.width.unwrap_or_default()),
    }
}

/// `resize_{w}x{h}` for the default `cover` fit, `resize_{w}x{h}_{fit}`
/// for the others so two fits of one box never share a directory.
pub fn resize_key(preset: &ResizePreset) -> String {
    match preset.fit {
        Fit::Cover => format!("resize_{}x{}", preset.width, preset.height),
        fit => format!(
            "resize_{}x{}_{}",
            preset.width,
            preset.height,
            fit.as_str()
        ),
    }
}

#[derive(Clone, Debug)]
pub struct StorageLayout {
    root: PathBuf,
    folder_types: Vec<String>,
}

impl StorageLayout {
    /// `folder_types` lists the categories callers may request; anything
    /// else is stored without a category.
    pub fn new(root: impl Into<PathBuf>, folder_types: Vec<String>) -> Self {
        Self {
            root: root.into(),
            folder_types,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory (relative to the root) for files uploaded at `now`.
    pub fn storage_path(&self, now: DateTime<Utc>, folder_type: Option<&str>) -> String {
        let month = now.format("%Y-%m").to_string();
        match folder_type.filter(|f| self.folder_types.iter().any(|known| known == f)) {
            Some(category) => format!("{}/{}", month, category),
            None => month,
        }
    }

    pub fn dir(&self, storage_path: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in storage_path.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }

    pub fn base_file(&self, storage_path: &str, server_filename: &str) -> PathBuf {
        self.dir(storage_path).join(server_filename)
    }

    pub fn derivative_dir(&self, storage_path: &str, variant_key: &str) -> PathBuf {
        self.dir(storage_path).join(variant_key)
    }

    pub fn derivative_file(
        &self,
        storage_path: &str,
        variant_key: &str,
        server_filename: &str,
    ) -> PathBuf {
        self.derivative_dir(storage_path, variant_key)
            .join(server_filename)
    }

    /// Public path of a derivative, the value stored in `derivative_map`.
    pub fn derivative_url(storage_path: &str, variant_key: &str, server_filename: &str) -> String {
        relative_url(
            &format!("{}/{}", storage_path.trim_matches('/'), variant_key),
            server_filename,
        )
    }

    /// Create a directory tree. Concurrent creators racing on the same path
    /// all succeed.
    pub async fn ensure_dir(&self, path: &Path) -> PipelineResult<()> {
        if fs::metadata(path).await.is_ok_and(|m| m.is_dir()) {
            return Ok(());
        }
        match fs::create_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
            Err(err) => Err(PipelineError::storage(path, err)),
        }
    }

    /// Write `bytes` to `path` through a temporary sibling and an atomic
    /// rename. A parent directory removed by a concurrent prune is
    /// recreated once.
    pub async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> PipelineResult<()> {
        let parent = path.parent().unwrap_or(&self.root);

        let mut result = write_via_temp(parent, path, bytes).await;
        if matches!(&result, Err(err) if err.kind() == ErrorKind::NotFound) {
            debug!("parent {} vanished, recreating", parent.display());
            self.ensure_dir(parent).await?;
            result = write_via_temp(parent, path, bytes).await;
        }

        result.map_err(|err| PipelineError::storage(path, err))?;
        debug!("wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    /// Resolve the base file for download, failing with `NotFound` when the
    /// bytes are gone.
    pub async fn resolve_download(
        &self,
        storage_path: &str,
        server_filename: &str,
    ) -> PipelineResult<PathBuf> {
        ensure_name_safe(server_filename)?;
        let path = self.base_file(storage_path, server_filename);
        match fs::try_exists(&path).await {
            Ok(true) => Ok(path),
            Ok(false) => Err(PipelineError::NotFound(server_filename.to_string())),
            Err(err) => Err(PipelineError::storage(&path, err)),
        }
    }

    /// Remove a file, treating an already-missing file as success.
    pub async fn remove_file(&self, path: &Path) -> PipelineResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!("removed file {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", path.display());
                Ok(())
            }
            Err(err) => Err(PipelineError::storage(path, err)),
        }
    }

    /// Recursively remove empty directories up to the storage root.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    pub async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

async fn write_via_temp(parent: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let written = async {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, path).await
    }
    .await;
    if written.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    written
}

/// Reject names that could escape their directory.
fn ensure_name_safe(name: &str) -> PipelineResult<()> {
    let unsafe_name = name.is_empty()
        || name.contains("..")
        || name
            .bytes()
            .any(|b| b == b'/' || b == b'\\' || b == b'\0' || b.is_ascii_control());
    if unsafe_name {
        return Err(PipelineError::NotFound(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn june() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 3, 12, 0, 0).unwrap()
    }

    #[test]
    fn variant_keys_depend_only_on_parameters() {
        let half = ScalePreset {
            width: None,
            ratio: Some(0.5),
        };
        let w720 = ScalePreset {
            width: Some(720),
            ratio: None,
        };
        let w720_unit_ratio = ScalePreset {
            width: Some(720),
            ratio: Some(1.0),
        };
        assert_eq!(scale_key(&half), "scale_r0.5");
        assert_eq!(scale_key(&w720), "scale_w720");
        assert_eq!(scale_key(&w720), scale_key(&w720_unit_ratio));

        let cover = ResizePreset {
            width: 150,
            height: 100,
            fit: Fit::Cover,
        };
        let contain = ResizePreset {
            fit: Fit::Contain,
            ..cover
        };
        assert_eq!(resize_key(&cover), "resize_150x100");
        assert_eq!(resize_key(&contain), "resize_150x100_contain");
    }

    #[test]
    fn storage_path_partitions_by_month_and_known_category() {
        let layout = StorageLayout::new("/data", vec!["avatar".into()]);
        assert_eq!(layout.storage_path(june(), None), "2025-06");
        assert_eq!(layout.storage_path(june(), Some("avatar")), "2025-06/avatar");
        assert_eq!(layout.storage_path(june(), Some("../etc")), "2025-06");
    }

    #[test]
    fn derivative_paths_nest_under_base_directory() {
        let layout = StorageLayout::new("/data", vec![]);
        assert_eq!(
            layout.derivative_file("2025-06", "resize_10x10", "f.webp"),
            PathBuf::from("/data/2025-06/resize_10x10/f.webp")
        );
        assert_eq!(
            StorageLayout::derivative_url("2025-06", "resize_10x10", "f.webp"),
            "/2025-06/resize_10x10/f.webp"
        );
    }

    #[tokio::test]
    async fn ensure_dir_is_idempotent_under_concurrency() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), vec![]);
        let target = layout.dir("2025-06/avatar");

        let (a, b) = tokio::join!(layout.ensure_dir(&target), layout.ensure_dir(&target));
        a.unwrap();
        b.unwrap();
        layout.ensure_dir(&target).await.unwrap();
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn resolve_download_requires_existing_bytes() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), vec![]);

        let missing = layout.resolve_download("2025-06", "nope.txt").await;
        assert!(matches!(missing, Err(PipelineError::NotFound(_))));

        let traversal = layout.resolve_download("2025-06", "../secret").await;
        assert!(matches!(traversal, Err(PipelineError::NotFound(_))));

        let base = layout.dir("2025-06");
        layout.ensure_dir(&base).await.unwrap();
        fs::write(base.join("here.txt"), b"x").await.unwrap();
        let found = layout.resolve_download("2025-06", "here.txt").await.unwrap();
        assert_eq!(found, base.join("here.txt"));
    }

    #[tokio::test]
    async fn write_atomic_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), vec![]);
        let base = layout.dir("2025-06");
        layout.ensure_dir(&base).await.unwrap();

        let target = base.join("f.txt");
        layout.write_atomic(&target, b"hello").await.unwrap();
        assert_eq!(fs::read(&target).await.unwrap(), b"hello");

        let mut entries = fs::read_dir(&base).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["f.txt"]);

        let under_a_file = target.join("nested.txt");
        assert!(matches!(
            layout.write_atomic(&under_a_file, b"x").await,
            Err(PipelineError::StorageIo { .. })
        ));
    }

    #[tokio::test]
    async fn write_atomic_recreates_a_pruned_parent() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), vec![]);
        let month = layout.dir("2025-06");
        layout.ensure_dir(&month).await.unwrap();

        layout.prune_empty_dirs(&month).await;
        assert!(!month.exists());

        let target = month.join("b.webp");
        layout.write_atomic(&target, b"late").await.unwrap();
        assert_eq!(fs::read(&target).await.unwrap(), b"late");
    }

    #[tokio::test]
    async fn prune_stops_at_root() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), vec![]);
        let nested = layout.derivative_dir("2025-06", "resize_1x1");
        layout.ensure_dir(&nested).await.unwrap();

        layout.prune_empty_dirs(&nested).await;
        assert!(!layout.dir("2025-06").exists());
        assert!(dir.path().exists());
    }
}
