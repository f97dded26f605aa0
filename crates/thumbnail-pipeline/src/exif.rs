//! EXIF orientation and camera metadata via `rexif`
//!
//! Parsing is always quiet: files without EXIF, or with EXIF that rexif
//! cannot understand, simply yield no rotation and an empty summary.

use rexif::{ExifData, ExifTag, TagValue};
use serde::{Deserialize, Serialize};

/// Textual metadata shown alongside a thumbnail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExifSummary {
    /// Raw orientation code (1..=8) if present.
    pub orientation: Option<u16>,
    /// Clockwise rotation in degrees implied by the orientation.
    pub rotation: f64,
    pub make: Option<String>,
    pub model: Option<String>,
    pub captured_at: Option<String>,
}

fn parse_quiet(bytes: &[u8]) -> Option<ExifData> {
    rexif::parse_buffer_quiet(bytes).0.ok()
}

/// Clockwise rotation (0, 90, 180 or 270) encoded in the EXIF data of `bytes`.
pub fn extract_rotation(bytes: &[u8]) -> f64 {
    parse_quiet(bytes)
        .and_then(|exif| orientation(&exif))
        .map(rotation_for_orientation)
        .unwrap_or(0.0)
}

/// Orientation, camera and capture time. `None` when there is no EXIF block.
pub fn read_summary(bytes: &[u8]) -> Option<ExifSummary> {
    let exif = parse_quiet(bytes)?;
    let orientation = orientation(&exif);
    Some(ExifSummary {
        orientation,
        rotation: orientation.map(rotation_for_orientation).unwrap_or(0.0),
        make: text_value(&exif, ExifTag::Make),
        model: text_value(&exif, ExifTag::Model),
        captured_at: text_value(&exif, ExifTag::DateTimeOriginal),
    })
}

/// Mirrored orientations (2, 4, 5, 7) are reduced to their rotation part.
pub fn rotation_for_orientation(code: u16) -> f64 {
    match code {
        3 | 4 => 180.0,
        5 | 6 => 90.0,
        7 | 8 => 270.0,
        _ => 0.0,
    }
}

fn orientation(exif: &ExifData) -> Option<u16> {
    exif.entries
        .iter()
        .find(|entry| entry.tag == ExifTag::Orientation)
        .and_then(|entry| orientation_code(&entry.value))
}

fn orientation_code(value: &TagValue) -> Option<u16> {
    let raw = match value {
        TagValue::U16(values) => values.first().copied(),
        TagValue::U8(values) => values.first().map(|&v| u16::from(v)),
        TagValue::U32(values) => values.first().and_then(|&v| u16::try_from(v).ok()),
        TagValue::I16(values) => values.first().and_then(|&v| u16::try_from(v).ok()),
        TagValue::I32(values) => values.first().and_then(|&v| u16::try_from(v).ok()),
        _ => None,
    }?;
    (1..=8).contains(&raw).then_some(raw)
}

fn text_value(exif: &ExifData, tag: ExifTag) -> Option<String> {
    exif.entries
        .iter()
        .find(|entry| entry.tag == tag)
        .and_then(|entry| {
            let value = entry.value_more_readable.trim();
            (!value.is_empty()).then(|| value.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orientation_mapping() {
        assert_eq!(rotation_for_orientation(1), 0.0);
        assert_eq!(rotation_for_orientation(3), 180.0);
        assert_eq!(rotation_for_orientation(6), 90.0);
        assert_eq!(rotation_for_orientation(8), 270.0);
        assert_eq!(rotation_for_orientation(42), 0.0);
    }

    #[test]
    fn test_orientation_code_variants() {
        assert_eq!(orientation_code(&TagValue::U16(vec![6])), Some(6));
        assert_eq!(orientation_code(&TagValue::U8(vec![3])), Some(3));
        assert_eq!(orientation_code(&TagValue::U32(vec![8])), Some(8));
        assert_eq!(orientation_code(&TagValue::U16(vec![9])), None);
        assert_eq!(orientation_code(&TagValue::U16(vec![])), None);
    }

    #[test]
    fn test_no_exif_means_no_rotation() {
        assert_eq!(extract_rotation(b"plain bytes, no exif here"), 0.0);
        assert!(read_summary(b"plain bytes, no exif here").is_none());
    }
}
