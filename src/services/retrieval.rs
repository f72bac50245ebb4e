//! Direct and streamed lookups over a single `enrich` step.
//!
//! Enrichment backfills a missing perceptual hash for images from the stored
//! bytes and resolves public addressing. A hash that cannot be computed
//! degrades to an empty string.

use crate::{
    errors::PipelineResult,
    models::file_record::{FileRecord, FileView},
    services::{
        derivatives::perceptual_hash,
        layout::StorageLayout,
        metadata_store::MetadataStore,
        sessions::{SessionEvent, SessionHub},
    },
};
use futures::{Stream, StreamExt, stream};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct RetrievalService {
    store: MetadataStore,
    layout: StorageLayout,
    sessions: SessionHub,
    domain: String,
    stream_idle: Duration,
    concurrency: usize,
}

impl RetrievalService {
    pub fn new(
        store: MetadataStore,
        layout: StorageLayout,
        sessions: SessionHub,
        domain: impl Into<String>,
        stream_idle: Duration,
    ) -> Self {
        Self {
            store,
            layout,
            sessions,
            domain: domain.into(),
            stream_idle,
            concurrency: 4,
        }
    }

    pub async fn enrich(&self, mut record: FileRecord) -> FileView {
        if record.needs_hash() {
            record.perceptual_hash = Some(self.backfill_hash(&record).await);
        }
        FileView::new(record, &self.domain)
    }

    async fn backfill_hash(&self, record: &FileRecord) -> String {
        let path = self
            .layout
            .base_file(&record.storage_path, &record.server_filename);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    file = %record.server_filename,
                    error = %err,
                    "cannot read file for hash backfill"
                );
                return String::new();
            }
        };

        let hash = match tokio::task::spawn_blocking(move || perceptual_hash(&bytes)).await {
            Ok(Ok(hash)) => hash,
            Ok(Err(reason)) => {
                warn!(file = %record.server_filename, %reason, "perceptual hash failed");
                return String::new();
            }
            Err(err) => {
                warn!(file = %record.server_filename, error = %err, "hash task aborted");
                return String::new();
            }
        };

        if let Err(err) = self.store.update_hash(record.file_id, &hash).await {
            warn!(
                file = %record.server_filename,
                error = %err,
                "failed to persist backfilled hash"
            );
        }
        hash
    }

    /// Resolve and enrich every known name in one response.
    pub async fn get_list(&self, server_filenames: &[String]) -> PipelineResult<Vec<FileView>> {
        let records = self.store.batch_get(server_filenames).await?;
        Ok(stream::iter(records)
            .map(|record| self.enrich(record))
            .buffered(self.concurrency)
            .collect()
            .await)
    }

    /// Resolve the names and publish each enriched record to the session as
    /// soon as it is ready, then complete the session.
    pub async fn stream_list(
        &self,
        session_id: &str,
        server_filenames: &[String],
    ) -> PipelineResult<usize> {
        let publisher = self.sessions.publisher(session_id);
        let records = self.store.batch_get(server_filenames).await?;

        let mut enriched = stream::iter(records)
            .map(|record| self.enrich(record))
            .buffer_unordered(self.concurrency);
        let mut count = 0;
        while let Some(view) = enriched.next().await {
            debug!(session = session_id, file = %view.record.server_filename, "publishing record");
            publisher.publish(view);
            count += 1;
        }
        publisher.finish();
        Ok(count)
    }

    /// Kick off `stream_list` in the background and return immediately.
    pub fn start_stream(&self, session_id: String, server_filenames: Vec<String>) {
        let service = self.clone();
        tokio::spawn(async move {
            match service.stream_list(&session_id, &server_filenames).await {
                Ok(count) => info!(session = %session_id, count, "streamed file list"),
                Err(err) => warn!(session = %session_id, error = %err, "streamed file list failed"),
            }
        });
    }

    pub fn subscribe(&self, session_id: &str) -> impl Stream<Item = SessionEvent> + Send + use<> {
        self.sessions.subscribe(session_id, self.stream_idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            file_record::{DerivativeMap, ViewType},
            upload::{ProcessedFile, StagedFile},
        },
        services::metadata_store::tests::memory_pool,
    };
    use image::{DynamicImage, ImageFormat, RgbaImage};
    use std::{collections::HashSet, io::Cursor};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        service: RetrievalService,
        store: MetadataStore,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(memory_pool().await);
        let layout = StorageLayout::new(dir.path(), vec![]);
        let service = RetrievalService::new(
            store.clone(),
            layout,
            SessionHub::new(),
            "http://cdn/files",
            Duration::from_millis(500),
        );
        Fixture {
            service,
            store,
            _dir: dir,
        }
    }

    fn processed(name: &str, view_type: ViewType) -> ProcessedFile {
        ProcessedFile {
            staged: StagedFile {
                client_filename: name.into(),
                server_filename: name.into(),
                extension: "".into(),
                mime_type: "text/plain".into(),
                view_type,
            },
            group: "default".into(),
            storage_path: "2025-06".into(),
            size_bytes: 1,
            derivative_map: DerivativeMap::new(),
            perceptual_hash: None,
        }
    }

    async fn seed(fx: &Fixture, names: &[&str], view_type: ViewType) {
        let files: Vec<_> = names.iter().map(|n| processed(n, view_type)).collect();
        fx.store.batch_insert("owner", &files).await.unwrap();
    }

    #[tokio::test]
    async fn get_list_enriches_and_omits_unknown() {
        let fx = fixture().await;
        seed(&fx, &["a", "b"], ViewType::File).await;

        let views = fx
            .service
            .get_list(&["a".into(), "b".into(), "ghost".into()])
            .await
            .unwrap();
        assert_eq!(views.len(), 2);
        assert!(views.iter().all(|v| v.domain == "http://cdn/files"));
        assert!(views.iter().any(|v| v.url == "/2025-06/a"));
    }

    #[tokio::test]
    async fn missing_image_hash_is_backfilled_and_persisted() {
        let fx = fixture().await;
        seed(&fx, &["pic.png"], ViewType::Image).await;

        let dir = fx.service.layout.dir("2025-06");
        fx.service.layout.ensure_dir(&dir).await.unwrap();
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(RgbaImage::new(12, 12))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        fs::write(dir.join("pic.png"), &buf).await.unwrap();

        let views = fx.service.get_list(&["pic.png".into()]).await.unwrap();
        let hash = views[0].record.perceptual_hash.clone().unwrap();
        assert!(!hash.is_empty());

        let stored = fx.store.get_one("pic.png").await.unwrap().unwrap();
        assert_eq!(stored.perceptual_hash, Some(hash));
    }

    #[tokio::test]
    async fn unreadable_image_degrades_to_empty_hash() {
        let fx = fixture().await;
        seed(&fx, &["gone.png"], ViewType::Image).await;

        let views = fx.service.get_list(&["gone.png".into()]).await.unwrap();
        assert_eq!(views[0].record.perceptual_hash.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn stream_delivers_each_existing_record_once() {
        let fx = fixture().await;
        seed(&fx, &["a", "b", "c"], ViewType::File).await;

        let subscription = fx.service.subscribe("session-1");
        let count = fx
            .service
            .stream_list("session-1", &["a".into(), "b".into(), "c".into(), "zz".into()])
            .await
            .unwrap();
        assert_eq!(count, 3);

        let events: Vec<_> = subscription.collect().await;
        let names: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Record(v) => Some(v.record.server_filename.clone()),
                SessionEvent::Complete => None,
            })
            .collect();
        assert_eq!(names.len(), 3);
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), 3);
        assert!(matches!(events.last(), Some(SessionEvent::Complete)));
    }

    #[tokio::test]
    async fn background_stream_reaches_early_subscriber() {
        let fx = fixture().await;
        seed(&fx, &["a", "b"], ViewType::File).await;

        let subscription = fx.service.subscribe("session-2");
        fx.service
            .start_stream("session-2".into(), vec!["a".into(), "b".into()]);

        let events: Vec<_> = subscription.collect().await;
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn large_stream_loses_no_records() {
        let fx = fixture().await;
        let names: Vec<String> = (0..300).map(|i| format!("bulk-{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        seed(&fx, &refs, ViewType::File).await;

        let subscription = fx.service.subscribe("bulk");
        fx.service.start_stream("bulk".into(), names.clone());

        let events: Vec<_> = subscription.collect().await;
        let received: HashSet<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Record(v) => Some(v.record.server_filename.clone()),
                SessionEvent::Complete => None,
            })
            .collect();
        assert_eq!(events.len(), 301);
        assert_eq!(received.len(), 300);
        assert!(matches!(events.last(), Some(SessionEvent::Complete)));
    }
}
