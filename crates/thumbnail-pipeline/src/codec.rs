//! Pluggable decoder registry
//!
//! Codecs are probed in registration order and the first one that claims the
//! header bytes is used. The default set covers every raster format the
//! `image` crate can recognise from its magic bytes, plus a GIF codec that
//! only decodes the first frame.

use anyhow::{anyhow, Context, Result};
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, ImageFormat};
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

/// A decoder that can be registered with a [`CodecRegistry`].
pub trait ImageCodec: Send + Sync {
    /// Human readable name, used in logs and `info` output.
    fn name(&self) -> &str;

    /// Whether this codec recognises the given leading bytes.
    fn can_decode(&self, header: &[u8]) -> bool;

    /// Decode a complete file image.
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage>;
}

/// Decodes a single still format through `image`'s own decoder.
#[derive(Debug, Clone, Copy)]
pub struct FormatCodec {
    format: ImageFormat,
}

impl FormatCodec {
    pub fn new(format: ImageFormat) -> Self {
        Self { format }
    }
}

impl ImageCodec for FormatCodec {
    fn name(&self) -> &str {
        self.format.extensions_str().first().copied().unwrap_or("image")
    }

    fn can_decode(&self, header: &[u8]) -> bool {
        matches!(image::guess_format(header), Ok(format) if format == self.format)
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage> {
        image::load_from_memory_with_format(bytes, self.format)
            .with_context(|| format!("{} decoder rejected the data", self.name()))
    }
}

/// Decodes only the first frame of a (possibly animated) GIF.
#[derive(Debug, Clone, Copy, Default)]
pub struct GifFirstFrameCodec;

impl ImageCodec for GifFirstFrameCodec {
    fn name(&self) -> &str {
        "gif"
    }

    fn can_decode(&self, header: &[u8]) -> bool {
        matches!(image::guess_format(header), Ok(ImageFormat::Gif))
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage> {
        let decoder = GifDecoder::new(Cursor::new(bytes)).context("Invalid GIF header")?;
        let frame = decoder
            .into_frames()
            .next()
            .ok_or_else(|| anyhow!("GIF contains no frames"))?
            .context("Failed to decode first GIF frame")?;
        Ok(DynamicImage::ImageRgba8(frame.into_buffer()))
    }
}

const STILL_FORMATS: [ImageFormat; 11] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Bmp,
    ImageFormat::Tiff,
    ImageFormat::Ico,
    ImageFormat::Pnm,
    ImageFormat::Hdr,
    ImageFormat::OpenExr,
    ImageFormat::Farbfeld,
    ImageFormat::Qoi,
];

/// Ordered collection of codecs.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn ImageCodec>>,
}

impl CodecRegistry {
    /// An empty registry that decodes nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in codec
    pub fn with_default_codecs() -> Self {
        let mut registry = Self::new();
        for format in STILL_FORMATS {
            registry.register(FormatCodec::new(format));
        }
        registry.register(GifFirstFrameCodec);
        registry
    }

    /// Append a codec. Earlier registrations win when several match.
    pub fn register<C: ImageCodec + 'static>(&mut self, codec: C) -> &mut Self {
        self.codecs.push(Arc::new(codec));
        self
    }

    /// First codec that claims `header`, if any.
    pub fn probe_reader(&self, header: &[u8]) -> Option<&dyn ImageCodec> {
        self.codecs
            .iter()
            .find(|codec| codec.can_decode(header))
            .map(|codec| codec.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.codecs.iter().map(|codec| codec.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.names())
            .finish()
    }
}
