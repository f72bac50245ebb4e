//! Image derivative generation.
//!
//! For each image the pipeline, in order:
//! 1. computes a BlurHash of the source pixels (advisory, never fatal)
//! 2. re-encodes the source as WebP unless it already is WebP; the WebP
//!    copy supersedes the original
//! 3. renders one output per requested scale preset
//! 4. renders one output per requested resize preset
//!
//! Everything here is CPU-bound and synchronous; callers run it on the
//! blocking pool. Writing the results is the caller's job.

use crate::{
    errors::{PipelineError, PipelineResult},
    models::{
        preset::{Fit, ResizePreset, ScalePreset},
        upload::StagedFile,
    },
    services::layout::{resize_key, scale_key},
};
use bytes::Bytes;
use image::{
    DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage,
    imageops::{self, FilterType},
};
use std::io::Cursor;
use tracing::{debug, warn};

pub const CANONICAL_EXTENSION: &str = "webp";

/// BlurHash sampling box and component counts.
const HASH_SAMPLE_WIDTH: u32 = 90;
const HASH_SAMPLE_HEIGHT: u32 = 120;
const HASH_COMPONENTS_X: u32 = 4;
const HASH_COMPONENTS_Y: u32 = 4;

/// One encoded derivative, addressed by its variant key.
#[derive(Debug, Clone)]
pub struct RenderedVariant {
    pub key: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RenderedImage {
    /// Descriptor after format normalization.
    pub staged: StagedFile,
    /// Bytes of the base file to store.
    pub base: Bytes,
    pub hash: Option<String>,
    /// Scale variants first, then resize variants, each in request order.
    pub variants: Vec<RenderedVariant>,
}

pub struct ImageDerivativePipeline;

impl ImageDerivativePipeline {
    pub fn render(
        staged: &StagedFile,
        source: Bytes,
        scale: &[(String, ScalePreset)],
        resize: &[(String, ResizePreset)],
    ) -> PipelineResult<RenderedImage> {
        let name = staged.client_filename.as_str();
        let decoded = image::load_from_memory(&source);

        let hash = match &decoded {
            Ok(img) => match blur_hash(img) {
                Ok(hash) => Some(hash),
                Err(reason) => {
                    warn!(file = name, %reason, "perceptual hash failed, continuing without it");
                    None
                }
            },
            Err(err) => {
                warn!(file = name, error = %err, "cannot decode image for hashing");
                None
            }
        };

        let already_canonical = staged.extension == CANONICAL_EXTENSION;
        let needs_pixels = !already_canonical || !scale.is_empty() || !resize.is_empty();
        let img = match decoded {
            Ok(img) => Some(img),
            Err(err) if needs_pixels => return Err(PipelineError::image(name, err)),
            Err(_) => None,
        };

        let (staged, base) = match (&img, already_canonical) {
            (Some(img), false) => {
                debug!(file = name, from = %staged.extension, "converting to webp");
                let encoded = encode_webp(img).map_err(|err| PipelineError::image(name, err))?;
                (
                    staged.with_extension(CANONICAL_EXTENSION),
                    Bytes::from(encoded),
                )
            }
            _ => (staged.clone(), source),
        };

        let mut variants = Vec::with_capacity(scale.len() + resize.len());
        if let Some(img) = &img {
            for (option, preset) in scale {
                let key = scale_key(preset);
                debug!(file = name, option = %option, key = %key, "rendering scale variant");
                let bytes = encode_webp(&scale_image(img, preset))
                    .map_err(|err| PipelineError::image(name, err))?;
                variants.push(RenderedVariant { key, bytes });
            }
            for (option, preset) in resize {
                let key = resize_key(preset);
                debug!(file = name, option = %option, key = %key, "rendering resize variant");
                let bytes = encode_webp(&resize_image(img, preset))
                    .map_err(|err| PipelineError::image(name, err))?;
                variants.push(RenderedVariant { key, bytes });
            }
        }

        Ok(RenderedImage {
            staged,
            base,
            hash,
            variants,
        })
    }
}

/// BlurHash of encoded image bytes.
pub fn perceptual_hash(source: &[u8]) -> Result<String, String> {
    let img = image::load_from_memory(source).map_err(|err| err.to_string())?;
    blur_hash(&img)
}

fn blur_hash(img: &DynamicImage) -> Result<String, String> {
    let sample = img
        .resize_to_fill(HASH_SAMPLE_WIDTH, HASH_SAMPLE_HEIGHT, FilterType::Triangle)
        .to_rgba8();
    blurhash::encode(
        HASH_COMPONENTS_X,
        HASH_COMPONENTS_Y,
        sample.width(),
        sample.height(),
        sample.as_raw(),
    )
    .map_err(|err| format!("{:?}", err))
}

fn encode_webp(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
    let mut buffer = Vec::new();
    rgba.write_to(&mut Cursor::new(&mut buffer), ImageFormat::WebP)?;
    Ok(buffer)
}

/// Pick a resampling filter based on how far the image shrinks.
fn select_filter(orig: (u32, u32), target: (u32, u32)) -> FilterType {
    let width_ratio = orig.0 as f32 / target.0.max(1) as f32;
    let height_ratio = orig.1 as f32 / target.1.max(1) as f32;
    let max_ratio = width_ratio.max(height_ratio);

    if max_ratio > 2.0 {
        FilterType::Triangle
    } else if max_ratio > 1.5 {
        FilterType::CatmullRom
    } else {
        FilterType::Lanczos3
    }
}

fn resize_exact(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    let filter = select_filter(img.dimensions(), (width, height));
    img.resize_exact(width.max(1), height.max(1), filter)
}

/// Width from the ratio (or the preset width), aspect ratio preserved.
/// Never enlarges.
fn scale_image(img: &DynamicImage, preset: &ScalePreset) -> DynamicImage {
    let (width, height) = img.dimensions();
    let target_width = match preset.effective_ratio() {
        Some(ratio) => (width as f64 * ratio).round().max(1.0) as u32,
        None => preset.width.unwrap_or(width),
    };
    if target_width >= width {
        return img.clone();
    }
    let target_height = (height as f64 * target_width as f64 / width as f64)
        .round()
        .max(1.0) as u32;
    resize_exact(img, target_width, target_height)
}

/// Apply a resize preset. A source that already fits inside the box is
/// returned unchanged, and no fit scales any dimension up.
fn resize_image(img: &DynamicImage, preset: &ResizePreset) -> DynamicImage {
    let (width, height) = img.dimensions();
    let (box_w, box_h) = (preset.width, preset.height);
    if width <= box_w && height <= box_h {
        return img.clone();
    }

    let fx = box_w as f64 / width as f64;
    let fy = box_h as f64 / height as f64;
    let scaled = |factor: f64| {
        (
            (width as f64 * factor).round().max(1.0) as u32,
            (height as f64 * factor).round().max(1.0) as u32,
        )
    };

    match preset.fit {
        Fit::Fill => resize_exact(img, box_w.min(width), box_h.min(height)),
        Fit::Inside => {
            let (w, h) = scaled(fx.min(fy));
            resize_exact(img, w, h)
        }
        Fit::Outside => {
            let factor = fx.max(fy);
            if factor >= 1.0 {
                return img.clone();
            }
            let (w, h) = scaled(factor);
            resize_exact(img, w, h)
        }
        Fit::Cover => {
            let factor = fx.max(fy);
            if factor >= 1.0 {
                // one side is already short; crop the long side only
                let (crop_w, crop_h) = (box_w.min(width), box_h.min(height));
                return img.crop_imm((width - crop_w) / 2, (height - crop_h) / 2, crop_w, crop_h);
            }
            let (w, h) = scaled(factor);
            let resized = resize_exact(img, w, h);
            resized.crop_imm((w - box_w.min(w)) / 2, (h - box_h.min(h)) / 2, box_w, box_h)
        }
        Fit::Contain => {
            let (w, h) = scaled(fx.min(fy));
            let resized = resize_exact(img, w, h);
            let mut canvas =
                DynamicImage::ImageRgba8(RgbaImage::from_pixel(box_w, box_h, Rgba([0, 0, 0, 0])));
            let x = (box_w.saturating_sub(w) / 2) as i64;
            let y = (box_h.saturating_sub(h) / 2) as i64;
            imageops::overlay(&mut canvas, &resized, x, y);
            canvas
        }
    }
}
