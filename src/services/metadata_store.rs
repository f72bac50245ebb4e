//! `file_records` persistence in SQLite.
//!
//! Batch operations are single statements, so a batch insert or delete
//! either applies to every row or to none.

use crate::{
    errors::PipelineResult,
    models::{file_record::FileRecord, upload::ProcessedFile},
};
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite, types::Json};
use std::sync::Arc;
use uuid::Uuid;

const COLUMNS: &str = "file_id, owner_id, created_at, client_filename, server_filename, \
     file_group, view_type, extension, size_bytes, mime_type, storage_path, \
     derivative_map, perceptual_hash";

#[derive(Clone)]
pub struct MetadataStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert one row per processed file in a single multi-row statement.
    pub async fn batch_insert(
        &self,
        owner_id: &str,
        files: &[ProcessedFile],
    ) -> PipelineResult<Vec<FileRecord>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let created_at = Utc::now();

        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("INSERT INTO file_records ({}) ", COLUMNS));
        builder.push_values(files, |mut row, file| {
            row.push_bind(Uuid::new_v4())
                .push_bind(owner_id.to_string())
                .push_bind(created_at)
                .push_bind(file.staged.client_filename.clone())
                .push_bind(file.staged.server_filename.clone())
                .push_bind(file.group.clone())
                .push_bind(file.staged.view_type)
                .push_bind(file.staged.extension.clone())
                .push_bind(file.size_bytes)
                .push_bind(file.staged.mime_type.clone())
                .push_bind(file.storage_path.clone())
                .push_bind(Json(file.derivative_map.clone()))
                .push_bind(file.perceptual_hash.clone());
        });
        builder.push(format!(" RETURNING {}", COLUMNS));

        let records = builder
            .build_query_as::<FileRecord>()
            .fetch_all(&*self.db)
            .await?;
        Ok(records)
    }

    /// Look up records by server filename. Unknown names are omitted and
    /// the result order is unspecified.
    pub async fn batch_get(&self, server_filenames: &[String]) -> PipelineResult<Vec<FileRecord>> {
        if server_filenames.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM file_records WHERE ", COLUMNS));
        push_name_filter(&mut builder, server_filenames);
        Ok(builder
            .build_query_as::<FileRecord>()
            .fetch_all(&*self.db)
            .await?)
    }

    pub async fn get_one(&self, server_filename: &str) -> PipelineResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM file_records WHERE server_filename = ?",
            COLUMNS
        ))
        .bind(server_filename)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    /// Delete exactly the matching rows and return them so the caller can
    /// remove the backing bytes. Unknown names are ignored.
    pub async fn batch_delete(
        &self,
        server_filenames: &[String],
    ) -> PipelineResult<Vec<FileRecord>> {
        if server_filenames.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM file_records WHERE ");
        push_name_filter(&mut builder, server_filenames);
        builder.push(format!(" RETURNING {}", COLUMNS));
        Ok(builder
            .build_query_as::<FileRecord>()
            .fetch_all(&*self.db)
            .await?)
    }

    /// Backfill a computed perceptual hash.
    pub async fn update_hash(&self, file_id: Uuid, hash: &str) -> PipelineResult<()> {
        sqlx::query("UPDATE file_records SET perceptual_hash = ? WHERE file_id = ?")
            .bind(hash)
            .bind(file_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

fn push_name_filter<'a>(builder: &mut QueryBuilder<'a, Sqlite>, names: &'a [String]) {
    builder.push("server_filename IN (");
    let mut separated = builder.separated(", ");
    for name in names {
        separated.push_bind(name);
    }
    separated.push_unseparated(")");
}

/// Apply a migration script statement by statement.
pub async fn apply_schema(db: &SqlitePool, sql: &str) -> PipelineResult<usize> {
    let statements = sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    for stmt in &statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(statements.len())
}
