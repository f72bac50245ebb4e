//! The preset table: named resize and scale options.
//!
//! Deserialized from a JSON document shaped like
//! `{"resize": {name: {width, height, fit}}, "scale": {name: {width, ratio}}}`.

use crate::errors::{PipelineError, PipelineResult};
use serde::Deserialize;
use std::collections::BTreeMap;

/// How a resize preset fits the source into its target box.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Fit {
    /// Fill the box, cropping overflow.
    #[default]
    Cover,
    /// Fit inside the box, letterboxed on a transparent canvas.
    Contain,
    /// Stretch to the exact box.
    Fill,
    /// Fit inside the box, output may be smaller than the box.
    Inside,
    /// Cover the box without cropping, output may be larger than the box.
    Outside,
}

impl Fit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fit::Cover => "cover",
            Fit::Contain => "contain",
            Fit::Fill => "fill",
            Fit::Inside => "inside",
            Fit::Outside => "outside",
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ResizePreset {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub fit: Fit,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ScalePreset {
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub ratio: Option<f64>,
}

impl ScalePreset {
    /// The ratio that drives the output, if any. A ratio of exactly 1 defers
    /// to `width`.
    pub fn effective_ratio(&self) -> Option<f64> {
        self.ratio.filter(|r| *r != 1.0)
    }
}

/// Immutable snapshot of the configured presets.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct PresetTable {
    #[serde(default)]
    pub resize: BTreeMap<String, ResizePreset>,
    #[serde(default)]
    pub scale: BTreeMap<String, ScalePreset>,
}

impl PresetTable {
    /// Parse and validate a preset document.
    pub fn from_json(raw: &str) -> PipelineResult<Self> {
        let table: PresetTable = serde_json::from_str(raw)
            .map_err(|err| PipelineError::Configuration(format!("invalid preset JSON: {}", err)))?;
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> PipelineResult<()> {
        for (name, preset) in &self.resize {
            if preset.width == 0 || preset.height == 0 {
                return Err(PipelineError::Configuration(format!(
                    "resize preset `{}` needs a non-zero width and height",
                    name
                )));
            }
        }
        for (name, preset) in &self.scale {
            match (preset.width, preset.ratio) {
                (_, Some(r)) if !(r.is_finite() && r > 0.0) => {
                    return Err(PipelineError::Configuration(format!(
                        "scale preset `{}` has invalid ratio {}",
                        name, r
                    )));
                }
                (Some(0), _) => {
                    return Err(PipelineError::Configuration(format!(
                        "scale preset `{}` has zero width",
                        name
                    )));
                }
                (None, None) => {
                    return Err(PipelineError::Configuration(format!(
                        "scale preset `{}` needs a width or a ratio",
                        name
                    )));
                }
                (Some(_), Some(_)) if preset.effective_ratio().is_some() => {
                    return Err(PipelineError::Configuration(format!(
                        "scale preset `{}` sets both width and ratio",
                        name
                    )));
                }
                (None, Some(_)) if preset.effective_ratio().is_none() => {
                    return Err(PipelineError::Configuration(format!(
                        "scale preset `{}` has ratio 1 and no width",
                        name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_maps() {
        let table = PresetTable::from_json(
            r#"{
                "resize": {"thumb": {"width": 150, "height": 100, "fit": "contain"},
                           "card": {"width": 300, "height": 200}},
                "scale": {"half": {"ratio": 0.5}, "w720": {"width": 720}}
            }"#,
        )
        .unwrap();

        assert_eq!(table.resize["thumb"].fit, Fit::Contain);
        assert_eq!(table.resize["card"].fit, Fit::Cover);
        assert_eq!(table.scale["half"].effective_ratio(), Some(0.5));
        assert_eq!(table.scale["w720"].width, Some(720));
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let table = PresetTable::from_json("{}").unwrap();
        assert!(table.resize.is_empty());
        assert!(table.scale.is_empty());
    }

    #[test]
    fn malformed_documents_are_configuration_errors() {
        for raw in [
            "not json",
            r#"{"resize": {"t": {"width": 0, "height": 10}}}"#,
            r#"{"resize": {"t": {"width": 10, "height": 10, "fit": "squash"}}}"#,
            r#"{"scale": {"s": {}}}"#,
            r#"{"scale": {"s": {"ratio": -1}}}"#,
            r#"{"scale": {"s": {"ratio": 1}}}"#,
            r#"{"scale": {"s": {"width": 300, "ratio": 0.5}}}"#,
        ] {
            assert!(
                matches!(
                    PresetTable::from_json(raw),
                    Err(PipelineError::Configuration(_))
                ),
                "expected configuration error for {}",
                raw
            );
        }
    }
}
