//! Aspect-preserving scaling and encoding
//!
//! The scale factor to fit a bounding box is `min(W / w, H / h)` computed on
//! the source's effective (post-rotation) dimensions. Scaled dimensions are
//! rounded and never drop below one pixel.

use crate::error::{Result, ThumbnailError};
use crate::source::SourceImage;
use crate::thumbnail::Thumbnail;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::debug;

/// Maximum width and height of a thumbnail, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bound {
    pub width: u32,
    pub height: u32,
}

impl Bound {
    /// Used in place of any bound with a zero side.
    pub const FALLBACK: Bound = Bound {
        width: 100,
        height: 100,
    };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn square(edge: u32) -> Self {
        Self::new(edge, edge)
    }

    pub fn or_fallback(self) -> Self {
        if self.width < 1 || self.height < 1 {
            Self::FALLBACK
        } else {
            self
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Resampling quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleQuality {
    /// Nearest neighbour.
    Fast,
    /// Bicubic (Catmull-Rom).
    #[default]
    Quality,
}

impl ScaleQuality {
    fn filter(self) -> FilterType {
        match self {
            ScaleQuality::Fast => FilterType::Nearest,
            ScaleQuality::Quality => FilterType::CatmullRom,
        }
    }
}

impl std::str::FromStr for ScaleQuality {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "fast" => Ok(ScaleQuality::Fast),
            "quality" => Ok(ScaleQuality::Quality),
            _ => anyhow::bail!("Invalid scale quality: {}. Valid options: fast, quality", s),
        }
    }
}

/// Serialized form of a scaled raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg { quality: u8 },
    Png,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Jpeg { quality: 80 }
    }
}

/// Factor that makes `width` x `height` fit inside `bound`.
pub fn scale_factor_to_fit(width: u32, height: u32, bound: Bound) -> f64 {
    let bound = bound.or_fallback();
    let width = width.max(1) as f64;
    let height = height.max(1) as f64;
    (bound.width as f64 / width).min(bound.height as f64 / height)
}

fn scaled_dimension(dimension: u32, factor: f64) -> u32 {
    ((dimension as f64 * factor).round() as u32).max(1)
}

/// Resizes [`SourceImage`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scaler {
    quality: ScaleQuality,
    dont_enlarge: bool,
}

impl Scaler {
    pub fn new(quality: ScaleQuality) -> Self {
        Self {
            quality,
            dont_enlarge: false,
        }
    }

    /// Cap fitted scale factors at 1.0 so small images keep their size.
    pub fn dont_enlarge(mut self, dont_enlarge: bool) -> Self {
        self.dont_enlarge = dont_enlarge;
        self
    }

    pub fn quality(&self) -> ScaleQuality {
        self.quality
    }

    /// Scale `image` uniformly so it fits inside `bound`.
    pub fn scale_to_fit(&self, image: &Arc<SourceImage>, bound: Bound) -> ScaledImage {
        let mut factor = scale_factor_to_fit(image.effective_width(), image.effective_height(), bound);
        if self.dont_enlarge && factor > 1.0 {
            factor = 1.0;
        }
        self.scale_by_factor(image, factor)
    }

    /// Scale `image` uniformly by `factor`. Non-positive or non-finite
    /// factors leave the image at its natural size.
    pub fn scale_by_factor(&self, image: &Arc<SourceImage>, factor: f64) -> ScaledImage {
        let factor = if factor.is_finite() && factor > 0.0 {
            factor
        } else {
            debug!(factor, origin = ?image.origin(), "invalid scale factor, using 1.0");
            1.0
        };

        let width = scaled_dimension(image.effective_width(), factor);
        let height = scaled_dimension(image.effective_height(), factor);
        let raster = if (width, height) == image.raster().dimensions() {
            image.raster().clone()
        } else {
            imageops::resize(image.raster(), width, height, self.quality.filter())
        };

        ScaledImage {
            source: Arc::clone(image),
            factor,
            raster,
        }
    }
}

/// A scaled raster that still knows which source it came from.
#[derive(Debug, Clone)]
pub struct ScaledImage {
    source: Arc<SourceImage>,
    factor: f64,
    raster: RgbImage,
}

impl ScaledImage {
    pub fn source(&self) -> &Arc<SourceImage> {
        &self.source
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn width(&self) -> u32 {
        self.raster.width()
    }

    pub fn height(&self) -> u32 {
        self.raster.height()
    }

    pub fn raster(&self) -> &RgbImage {
        &self.raster
    }

    pub fn encode(&self, format: OutputFormat) -> Result<Vec<u8>> {
        encode_in_memory(&self.raster, format)
    }

    /// Encode and write to `path`, creating parent directories as needed.
    pub fn write_to(&self, path: &Path, format: OutputFormat) -> Result<()> {
        write_raster(&self.raster, path, format)
    }

    /// Drop the source reference, keeping the pixels and the factor.
    pub fn into_thumbnail(self) -> Thumbnail {
        Thumbnail::from_scaled(self.raster, self.factor)
    }

    pub fn into_raster(self) -> RgbImage {
        self.raster
    }
}

/// Write target reported when encoding into a buffer fails.
pub const IN_MEMORY_TARGET: &str = "<memory>";

pub(crate) fn encode_in_memory(raster: &RgbImage, format: OutputFormat) -> Result<Vec<u8>> {
    encode_raster(raster, format).map_err(|e| ThumbnailError::write(IN_MEMORY_TARGET, e))
}

pub(crate) fn encode_raster(raster: &RgbImage, format: OutputFormat) -> image::ImageResult<Vec<u8>> {
    let mut buffer = Vec::new();
    match format {
        OutputFormat::Jpeg { quality } => {
            let encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
            raster.write_with_encoder(encoder)?;
        }
        OutputFormat::Png => {
            raster.write_with_encoder(PngEncoder::new(&mut buffer))?;
        }
    }
    Ok(buffer)
}

/// Encode then atomically replace `path` via a sibling temp file.
pub(crate) fn write_raster(raster: &RgbImage, path: &Path, format: OutputFormat) -> Result<()> {
    let data = encode_raster(raster, format).map_err(|e| ThumbnailError::write(path, e))?;
    write_atomic(path, &data)
}

pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| ThumbnailError::write(path, e))?;

    let mut file = NamedTempFile::new_in(parent).map_err(|e| ThumbnailError::write(path, e))?;
    file.write_all(data).map_err(|e| ThumbnailError::write(path, e))?;
    file.persist(path).map_err(|e| ThumbnailError::write(path, e.error))?;
    Ok(())
}
