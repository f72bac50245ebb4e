//! Batch intake: validation and server-side naming.
//!
//! Validation runs once over the whole batch before any file is touched.
//! A single unknown option or rejected file fails the batch with nothing
//! written.

use crate::{
    errors::{PipelineError, PipelineResult},
    models::{
        preset::{PresetTable, ResizePreset, ScalePreset},
        upload::{RawFile, StagedFile, UploadBatchRequest},
    },
    services::classify::classify,
};
use chrono::{DateTime, Utc};
use std::{collections::HashSet, path::Path};
use uuid::Uuid;

pub const DEFAULT_GROUP: &str = "default";

#[derive(Clone, Debug)]
pub struct IntakeLimits {
    pub max_file_size: u64,
    pub max_file_count: usize,
    /// Lowercase, without dots. Empty allows every extension.
    pub allowed_extensions: Vec<String>,
}

/// A batch that passed validation, with its option names resolved to
/// concrete presets in request order.
#[derive(Debug, Clone)]
pub struct AcceptedBatch {
    pub owner_id: String,
    pub extension_override: Option<String>,
    pub resize: Vec<(String, ResizePreset)>,
    pub scale: Vec<(String, ScalePreset)>,
    pub folder_type: Option<String>,
    pub group: String,
    pub files: Vec<RawFile>,
}

#[derive(Clone, Debug)]
pub struct IntakeValidator {
    limits: IntakeLimits,
}

impl IntakeValidator {
    pub fn new(limits: IntakeLimits) -> Self {
        Self { limits }
    }

    pub fn validate(
        &self,
        request: UploadBatchRequest,
        presets: &PresetTable,
    ) -> PipelineResult<AcceptedBatch> {
        if request.files.is_empty() {
            return Err(PipelineError::EmptyBatch);
        }
        if request.files.len() > self.limits.max_file_count {
            return Err(PipelineError::TooManyFiles {
                count: request.files.len(),
                max: self.limits.max_file_count,
            });
        }

        let resize_names = dedup(&request.resize_options);
        let scale_names = dedup(&request.scale_options);
        let unknown_resize = missing_keys(&resize_names, |n| presets.resize.contains_key(n));
        let unknown_scale = missing_keys(&scale_names, |n| presets.scale.contains_key(n));
        if !unknown_resize.is_empty() || !unknown_scale.is_empty() {
            return Err(PipelineError::UnknownOption {
                resize: unknown_resize,
                scale: unknown_scale,
            });
        }

        let extension_override = request
            .extension_override
            .as_deref()
            .and_then(normalize_extension);
        for file in &request.files {
            self.check_file(file, extension_override.as_deref())?;
        }

        // every name was checked against the table above
        let resize = resize_names
            .into_iter()
            .filter_map(|name| presets.resize.get(&name).map(|p| (name, *p)))
            .collect();
        let scale = scale_names
            .into_iter()
            .filter_map(|name| presets.scale.get(&name).map(|p| (name, *p)))
            .collect();

        Ok(AcceptedBatch {
            owner_id: request.owner_id,
            extension_override,
            resize,
            scale,
            folder_type: request.folder_type,
            group: request
                .group
                .filter(|g| !g.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            files: request.files,
        })
    }

    fn check_file(&self, file: &RawFile, extension_override: Option<&str>) -> PipelineResult<()> {
        if file.size() > self.limits.max_file_size {
            return Err(PipelineError::FileTooLarge {
                name: file.client_filename.clone(),
                size: file.size(),
                max: self.limits.max_file_size,
            });
        }
        if !self.limits.allowed_extensions.is_empty() {
            let ext = effective_extension(&file.client_filename, extension_override);
            if !self.limits.allowed_extensions.iter().any(|a| *a == ext) {
                return Err(PipelineError::ExtensionNotAllowed {
                    name: file.client_filename.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Give a raw file its server-side identity.
///
/// The server name is `{prefix}_{uuid}_{YYYYMMDDHHMMSSmmm}` plus the
/// extension taken from the client name, or the batch override when the
/// client name has none.
pub fn stage(
    file: &RawFile,
    prefix: &str,
    extension_override: Option<&str>,
    now: DateTime<Utc>,
) -> StagedFile {
    let extension = effective_extension(&file.client_filename, extension_override);
    let stem = format!(
        "{}_{}_{}",
        prefix,
        Uuid::new_v4(),
        now.format("%Y%m%d%H%M%S%3f")
    );
    let server_filename = if extension.is_empty() {
        stem
    } else {
        format!("{}.{}", stem, extension)
    };
    StagedFile {
        client_filename: file.client_filename.clone(),
        server_filename,
        extension,
        mime_type: file.mime_type.clone(),
        view_type: classify(&file.mime_type),
    }
}

fn effective_extension(client_filename: &str, extension_override: Option<&str>) -> String {
    Path::new(client_filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(normalize_extension)
        .or_else(|| extension_override.map(str::to_string))
        .unwrap_or_default()
}

fn normalize_extension(raw: &str) -> Option<String> {
    let ext = raw.trim().trim_start_matches('.').to_ascii_lowercase();
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext)
}

fn dedup(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .filter(|n| seen.insert(n.to_string()))
        .map(str::to_string)
        .collect()
}

fn missing_keys(names: &[String], known: impl Fn(&str) -> bool) -> Vec<String> {
    names.iter().filter(|n| !known(n)).cloned().collect()
}
