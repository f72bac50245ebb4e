//! Resolves the preset table from its JSON file.
//!
//! The table is read fresh for every upload so edits to the file apply
//! without a restart; each request then works against one immutable
//! snapshot.

use crate::{
    errors::{PipelineError, PipelineResult},
    models::preset::PresetTable,
};
use std::{path::PathBuf, sync::Arc};
use tokio::fs;

#[derive(Clone, Debug)]
pub struct PresetSource {
    path: PathBuf,
}

impl PresetSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the current table. Missing or malformed files are
    /// configuration errors, never per-file errors.
    pub async fn load(&self) -> PipelineResult<Arc<PresetTable>> {
        let raw = fs::read_to_string(&self.path).await.map_err(|err| {
            PipelineError::Configuration(format!(
                "cannot read preset table {}: {}",
                self.path.display(),
                err
            ))
        })?;
        let table = PresetTable::from_json(&raw)?;
        tracing::debug!(
            path = %self.path.display(),
            resize = table.resize.len(),
            scale = table.scale.len(),
            "loaded preset table"
        );
        Ok(Arc::new(table))
    }
}
