//! Upload, retrieval, download and delete operations shared by every HTTP
//! handler.
//!
//! Upload is all-or-nothing: the whole batch is validated before anything
//! touches disk, every path written is tracked, and any failure (including
//! the metadata insert) removes what was written before the error is
//! returned.

use crate::{
    errors::{PipelineError, PipelineResult},
    models::{
        file_record::{DerivativeMap, FileRecord, FileView, ViewType, relative_url},
        preset::PresetTable,
        upload::{
            ProcessedFile, RawFile, StagedFile, UploadBatchRequest, UploadResponse, UploadedFile,
        },
    },
    services::{
        derivatives::{ImageDerivativePipeline, RenderedImage},
        intake::{self, AcceptedBatch, IntakeLimits, IntakeValidator},
        layout::StorageLayout,
        metadata_store::MetadataStore,
        presets::PresetSource,
        retrieval::RetrievalService,
        sessions::{SessionEvent, SessionHub},
    },
};
use chrono::{DateTime, Utc};
use futures::Stream;
use sqlx::SqlitePool;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::fs::File;
use tracing::{debug, info, warn};

/// Everything `FileService` needs besides the pool and the storage root.
#[derive(Clone, Debug)]
pub struct ServiceSettings {
    /// Public base URL returned next to every relative file URL.
    pub domain: String,
    pub file_prefix: String,
    pub preset_path: PathBuf,
    pub folder_types: Vec<String>,
    pub limits: IntakeLimits,
    pub stream_idle: Duration,
}

#[derive(Clone)]
pub struct FileService {
    pub store: MetadataStore,
    pub layout: StorageLayout,
    pub retrieval: RetrievalService,
    presets: PresetSource,
    intake: IntakeValidator,
    domain: String,
    file_prefix: String,
}

impl FileService {
    pub fn new(
        db: Arc<SqlitePool>,
        storage_root: impl Into<PathBuf>,
        settings: ServiceSettings,
    ) -> Self {
        let store = MetadataStore::new(db);
        let layout = StorageLayout::new(storage_root, settings.folder_types);
        let retrieval = RetrievalService::new(
            store.clone(),
            layout.clone(),
            SessionHub::new(),
            settings.domain.clone(),
            settings.stream_idle,
        );
        Self {
            store,
            layout,
            retrieval,
            presets: PresetSource::new(settings.preset_path),
            intake: IntakeValidator::new(settings.limits),
            domain: settings.domain,
            file_prefix: settings.file_prefix,
        }
    }

    /// Current preset table, read fresh from its source.
    pub async fn preset_table(&self) -> PipelineResult<Arc<PresetTable>> {
        self.presets.load().await
    }

    /// Validate, store, derive and record a batch of files.
    pub async fn upload(&self, request: UploadBatchRequest) -> PipelineResult<UploadResponse> {
        let presets = self.preset_table().await?;
        let batch = self.intake.validate(request, &presets)?;

        let now = Utc::now();
        let storage_path = self
            .layout
            .storage_path(now, batch.folder_type.as_deref());
        let mut written = Vec::new();

        let processed = match self
            .store_batch(&batch, &storage_path, now, &mut written)
            .await
        {
            Ok(processed) => processed,
            Err(err) => {
                warn!(owner = %batch.owner_id, error = %err, "upload failed, rolling back");
                self.rollback(&storage_path, &written).await;
                return Err(err);
            }
        };

        if let Err(err) = self.store.batch_insert(&batch.owner_id, &processed).await {
            warn!(owner = %batch.owner_id, error = %err, "metadata insert failed, rolling back");
            self.rollback(&storage_path, &written).await;
            return Err(err);
        }

        info!(
            owner = %batch.owner_id,
            count = processed.len(),
            storage_path = %storage_path,
            "upload stored"
        );

        let files = processed
            .into_iter()
            .map(|file| UploadedFile {
                domain: self.domain.clone(),
                file_url: relative_url(&file.storage_path, &file.staged.server_filename),
                server_filename: file.staged.server_filename,
                file_name: file.staged.client_filename,
                file_hash: file.perceptual_hash.unwrap_or_default(),
            })
            .collect();
        Ok(UploadResponse { files })
    }

    async fn store_batch(
        &self,
        batch: &AcceptedBatch,
        storage_path: &str,
        now: DateTime<Utc>,
        written: &mut Vec<PathBuf>,
    ) -> PipelineResult<Vec<ProcessedFile>> {
        self.layout.ensure_dir(&self.layout.dir(storage_path)).await?;

        let mut processed = Vec::with_capacity(batch.files.len());
        for file in &batch.files {
            processed.push(self.store_file(batch, file, storage_path, now, written).await?);
        }
        Ok(processed)
    }

    async fn store_file(
        &self,
        batch: &AcceptedBatch,
        file: &RawFile,
        storage_path: &str,
        now: DateTime<Utc>,
        written: &mut Vec<PathBuf>,
    ) -> PipelineResult<ProcessedFile> {
        let staged = intake::stage(
            file,
            &self.file_prefix,
            batch.extension_override.as_deref(),
            now,
        );
        debug!(
            client = %staged.client_filename,
            server = %staged.server_filename,
            view_type = staged.view_type.as_str(),
            "staged file"
        );

        if staged.view_type != ViewType::Image {
            let path = self.layout.base_file(storage_path, &staged.server_filename);
            self.write_base(storage_path, &path, &file.content).await?;
            written.push(path);
            return Ok(ProcessedFile {
                staged,
                group: batch.group.clone(),
                storage_path: storage_path.to_string(),
                size_bytes: file.content.len() as i64,
                derivative_map: DerivativeMap::new(),
                perceptual_hash: None,
            });
        }

        let rendered = self.render(batch, &staged, file).await?;
        let name = rendered.staged.server_filename.clone();

        let base_path = self.layout.base_file(storage_path, &name);
        self.write_base(storage_path, &base_path, &rendered.base).await?;
        written.push(base_path);

        let mut derivative_map = DerivativeMap::new();
        for variant in &rendered.variants {
            let dir = self.layout.derivative_dir(storage_path, &variant.key);
            self.layout.ensure_dir(&dir).await?;
            let path = dir.join(&name);
            self.layout.write_atomic(&path, &variant.bytes).await?;
            written.push(path);
            derivative_map.insert(
                variant.key.clone(),
                StorageLayout::derivative_url(storage_path, &variant.key, &name),
            );
        }

        Ok(ProcessedFile {
            size_bytes: rendered.base.len() as i64,
            staged: rendered.staged,
            group: batch.group.clone(),
            storage_path: storage_path.to_string(),
            derivative_map,
            perceptual_hash: rendered.hash,
        })
    }

    /// A delete running alongside this upload may have pruned the storage
    /// directory since the batch started.
    async fn write_base(
        &self,
        storage_path: &str,
        path: &Path,
        bytes: &[u8],
    ) -> PipelineResult<()> {
        self.layout.ensure_dir(&self.layout.dir(storage_path)).await?;
        self.layout.write_atomic(path, bytes).await
    }

    async fn render(
        &self,
        batch: &AcceptedBatch,
        staged: &StagedFile,
        file: &RawFile,
    ) -> PipelineResult<RenderedImage> {
        let staged = staged.clone();
        let source = file.content.clone();
        let scale = batch.scale.clone();
        let resize = batch.resize.clone();
        let name = file.client_filename.clone();

        tokio::task::spawn_blocking(move || {
            ImageDerivativePipeline::render(&staged, source, &scale, &resize)
        })
        .await
        .map_err(|err| PipelineError::image(name, err))?
    }

    /// Remove every path written so far, then the directories left empty.
    async fn rollback(&self, storage_path: &str, written: &[PathBuf]) {
        for path in written.iter().rev() {
            if let Err(err) = self.layout.remove_file(path).await {
                warn!(path = %path.display(), error = %err, "rollback could not remove file");
            }
        }
        for path in written.iter().rev() {
            if let Some(parent) = path.parent() {
                self.layout.prune_empty_dirs(parent).await;
            }
        }
        self.layout
            .prune_empty_dirs(&self.layout.dir(storage_path))
            .await;
    }

    pub async fn get_list(&self, server_filenames: &[String]) -> PipelineResult<Vec<FileView>> {
        self.retrieval.get_list(server_filenames).await
    }

    pub fn start_stream(&self, session_id: String, server_filenames: Vec<String>) {
        self.retrieval.start_stream(session_id, server_filenames);
    }

    pub fn subscribe(&self, session_id: &str) -> impl Stream<Item = SessionEvent> + Send + use<> {
        self.retrieval.subscribe(session_id)
    }

    /// Open the base file of a stored record for streaming.
    pub async fn download(&self, server_filename: &str) -> PipelineResult<(FileRecord, File)> {
        let record = self
            .store
            .get_one(server_filename)
            .await?
            .ok_or_else(|| PipelineError::NotFound(server_filename.to_string()))?;
        let path = self
            .layout
            .resolve_download(&record.storage_path, &record.server_filename)
            .await?;
        let file = File::open(&path).await.map_err(|err| match err.kind() {
            ErrorKind::NotFound => PipelineError::NotFound(server_filename.to_string()),
            _ => PipelineError::storage(&path, err),
        })?;
        Ok((record, file))
    }

    /// Delete records and their bytes. Unknown names are ignored.
    pub async fn delete(&self, server_filenames: &[String]) -> PipelineResult<Vec<FileRecord>> {
        let deleted = self.store.batch_delete(server_filenames).await?;
        for record in &deleted {
            self.remove_bytes(record).await;
        }
        info!(
            requested = server_filenames.len(),
            deleted = deleted.len(),
            "files deleted"
        );
        Ok(deleted)
    }

    async fn remove_bytes(&self, record: &FileRecord) {
        let mut paths = vec![
            self.layout
                .base_file(&record.storage_path, &record.server_filename),
        ];
        paths.extend(record.derivative_map.0.keys().map(|key| {
            self.layout
                .derivative_file(&record.storage_path, key, &record.server_filename)
        }));

        for path in &paths {
            if let Err(err) = self.layout.remove_file(path).await {
                warn!(
                    file = %record.server_filename,
                    error = %err,
                    "could not remove stored bytes"
                );
            }
        }
        for path in paths.iter().rev() {
            if let Some(parent) = path.parent().map(Path::to_path_buf) {
                self.layout.prune_empty_dirs(&parent).await;
            }
        }
    }
}
