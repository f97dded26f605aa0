//! Rotation-aware image loading
//!
//! [`ImageLoader`] reads a file, probes the codec registry, decodes to RGB and
//! applies a lossless quarter-turn rotation. The resulting [`SourceImage`]
//! reports both its raw decoded size and its effective (post-rotation) size.

use crate::codec::CodecRegistry;
use crate::error::{Result, ThumbnailError};
use crate::exif;
use crate::source_cache::SourceBytesCache;
use image::{imageops, RgbImage};
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// How the rotation of a source is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Rotation {
    /// Explicit clockwise angle in degrees.
    Degrees(f64),
    /// Use the orientation recorded in the file's EXIF data.
    #[default]
    FromExif,
}

/// Number of clockwise quarter turns for `degrees`, or `None` when the angle
/// is not a multiple of 90.
pub fn quarter_turns(degrees: f64) -> Option<u32> {
    if !degrees.is_finite() {
        return None;
    }
    let normalized = degrees.rem_euclid(360.0);
    let turns = normalized / 90.0;
    if (turns - turns.round()).abs() > 1e-9 {
        return None;
    }
    Some(turns.round() as u32 % 4)
}

/// A decoded, rotated source raster. Immutable once built.
#[derive(Debug, Clone)]
pub struct SourceImage {
    origin: PathBuf,
    rotation: f64,
    applied_turns: u32,
    decoded_width: u32,
    decoded_height: u32,
    codec: String,
    raster: RgbImage,
}

impl SourceImage {
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    /// Rotation angle the image was requested with.
    pub fn rotation(&self) -> f64 {
        self.rotation
    }

    /// Rotation actually applied to the raster, in degrees.
    pub fn applied_rotation(&self) -> u32 {
        self.applied_turns * 90
    }

    pub fn decoded_width(&self) -> u32 {
        self.decoded_width
    }

    pub fn decoded_height(&self) -> u32 {
        self.decoded_height
    }

    /// Width after rotation.
    pub fn effective_width(&self) -> u32 {
        self.raster.width()
    }

    /// Height after rotation.
    pub fn effective_height(&self) -> u32 {
        self.raster.height()
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }

    pub fn raster(&self) -> &RgbImage {
        &self.raster
    }
}

/// Loads [`SourceImage`]s through a [`CodecRegistry`], optionally reading
/// source files through a shared [`SourceBytesCache`].
#[derive(Debug, Clone)]
pub struct ImageLoader {
    registry: Arc<CodecRegistry>,
    source_cache: Option<Arc<SourceBytesCache>>,
}

impl Default for ImageLoader {
    fn default() -> Self {
        Self::new(Arc::new(CodecRegistry::with_default_codecs()))
    }
}

impl ImageLoader {
    pub fn new(registry: Arc<CodecRegistry>) -> Self {
        Self {
            registry,
            source_cache: None,
        }
    }

    /// Read sources through `cache`.
    pub fn with_source_cache(mut self, cache: Arc<SourceBytesCache>) -> Self {
        self.source_cache = Some(cache);
        self
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    pub fn source_cache(&self) -> Option<&Arc<SourceBytesCache>> {
        self.source_cache.as_ref()
    }

    /// Decode `origin` and rotate it clockwise by `rotation` degrees.
    pub fn load(&self, origin: &Path, rotation: f64) -> Result<SourceImage> {
        let bytes = self.read_source(origin)?;
        self.decode(origin, &bytes, rotation)
    }

    /// Decode `origin` using the rotation from its EXIF orientation.
    pub fn load_auto(&self, origin: &Path) -> Result<SourceImage> {
        let bytes = self.read_source(origin)?;
        let rotation = exif::extract_rotation(&bytes);
        self.decode(origin, &bytes, rotation)
    }

    /// Decode with the given rotation policy.
    pub fn load_with(&self, origin: &Path, rotation: Rotation) -> Result<SourceImage> {
        match rotation {
            Rotation::Degrees(degrees) => self.load(origin, degrees),
            Rotation::FromExif => self.load_auto(origin),
        }
    }

    /// Whether any registered codec claims the file. Unreadable files are
    /// reported as errors rather than `false`.
    pub fn has_reader(&self, origin: &Path) -> Result<bool> {
        let bytes = self.read_source(origin)?;
        Ok(self.registry.probe_reader(&bytes).is_some())
    }

    /// Read the whole source, resolving `file://` URIs to paths.
    fn read_source(&self, origin: &Path) -> Result<Arc<[u8]>> {
        let path = resolve_origin(origin);
        let bytes = match &self.source_cache {
            Some(cache) => cache.read(&path),
            None => fs::read(&path).map(Arc::from),
        }
        .map_err(|e| ThumbnailError::unreadable(origin, e))?;

        if bytes.is_empty() {
            return Err(ThumbnailError::unreadable(
                origin,
                io::Error::new(io::ErrorKind::UnexpectedEof, "source is empty"),
            ));
        }
        Ok(bytes)
    }

    fn decode(&self, origin: &Path, bytes: &[u8], rotation: f64) -> Result<SourceImage> {
        let codec = self
            .registry
            .probe_reader(bytes)
            .ok_or_else(|| ThumbnailError::NoDecoderFound {
                origin: origin.to_path_buf(),
            })?;

        trace!(?origin, codec = codec.name(), "decoding");
        let decoded = panic::catch_unwind(AssertUnwindSafe(|| codec.decode(bytes)))
            .map_err(|payload| ThumbnailError::decode(origin, panic_message(payload.as_ref())))?
            .map_err(|e| ThumbnailError::decode(origin, format!("{e:#}")))?;

        let raster = decoded.to_rgb8();
        let (decoded_width, decoded_height) = raster.dimensions();
        if decoded_width == 0 || decoded_height == 0 {
            return Err(ThumbnailError::decode(origin, "image has no pixels"));
        }

        let turns = quarter_turns(rotation).unwrap_or_else(|| {
            debug!(?origin, rotation, "rotation is not a multiple of 90, ignoring");
            0
        });
        let raster = match turns {
            1 => imageops::rotate90(&raster),
            2 => imageops::rotate180(&raster),
            3 => imageops::rotate270(&raster),
            _ => raster,
        };

        Ok(SourceImage {
            origin: origin.to_path_buf(),
            rotation,
            applied_turns: turns,
            decoded_width,
            decoded_height,
            codec: codec.name().to_string(),
            raster,
        })
    }
}

/// Strip a `file://` scheme if present.
pub fn resolve_origin(origin: &Path) -> PathBuf {
    match origin.to_str().and_then(|s| s.strip_prefix("file://")) {
        Some(rest) => PathBuf::from(rest),
        None => origin.to_path_buf(),
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("decoder panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("decoder panicked: {s}")
    } else {
        "decoder panicked".to_string()
    }
}
