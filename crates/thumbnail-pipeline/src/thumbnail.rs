//! Finished thumbnails and the built-in broken-image placeholder

use crate::error::Result;
use crate::scale::{self, OutputFormat};
use image::{Rgb, RgbImage};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Edge length of the placeholder raster.
pub const BROKEN_EDGE: u32 = 64;

/// An immutable scaled raster. Clones share the pixel buffer.
///
/// Equality compares pixels only; the scale factor is informational.
#[derive(Clone)]
pub struct Thumbnail {
    raster: Arc<RgbImage>,
    scale_factor: Option<f64>,
}

impl Thumbnail {
    /// A thumbnail whose scale factor is unknown (read back from disk,
    /// composed, or a placeholder).
    pub fn from_raster(raster: RgbImage) -> Self {
        Self {
            raster: Arc::new(raster),
            scale_factor: None,
        }
    }

    /// A thumbnail produced by scaling its source by `factor`.
    pub fn from_scaled(raster: RgbImage, factor: f64) -> Self {
        Self {
            raster: Arc::new(raster),
            scale_factor: Some(factor),
        }
    }

    /// Factor the source was scaled by, when this thumbnail was just built.
    pub fn scale_factor(&self) -> Option<f64> {
        self.scale_factor
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

    /// Bytes held by the decoded pixels.
    pub fn byte_size(&self) -> usize {
        self.raster.as_raw().len()
    }

    pub fn encode(&self, format: OutputFormat) -> Result<Vec<u8>> {
        scale::encode_in_memory(&self.raster, format)
    }

    pub fn save(&self, path: &Path, format: OutputFormat) -> Result<()> {
        scale::write_raster(&self.raster, path, format)
    }

    /// The fixed "broken image" placeholder: a light tile with a red cross.
    pub fn broken() -> Thumbnail {
        static BROKEN: OnceLock<Thumbnail> = OnceLock::new();
        BROKEN.get_or_init(|| Thumbnail::from_raster(draw_broken())).clone()
    }

    /// Whether this thumbnail shares its pixels with [`Thumbnail::broken`].
    pub fn is_broken(&self) -> bool {
        Arc::ptr_eq(&self.raster, &Thumbnail::broken().raster)
    }
}

impl PartialEq for Thumbnail {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.raster, &other.raster) || self.raster == other.raster
    }
}

impl fmt::Debug for Thumbnail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thumbnail")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

fn draw_broken() -> RgbImage {
    let background = Rgb([230, 230, 230]);
    let border = Rgb([150, 150, 150]);
    let cross = Rgb([200, 40, 40]);
    let last = BROKEN_EDGE - 1;

    RgbImage::from_fn(BROKEN_EDGE, BROKEN_EDGE, |x, y| {
        let on_border = x == 0 || y == 0 || x == last || y == last;
        let on_cross = x.abs_diff(y) <= 1 || (x + y).abs_diff(last) <= 1;
        let inset = (8..=last - 8).contains(&x) && (8..=last - 8).contains(&y);
        if on_border {
            border
        } else if on_cross && inset {
            cross
        } else {
            background
        }
    })
}
