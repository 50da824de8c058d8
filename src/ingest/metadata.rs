use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct ImageMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Every primary-IFD EXIF field as tag name -> display value.
    pub exif: Option<Value>,
}

pub fn extract_metadata(path: &Path) -> ImageMetadata {
    let mut metadata = ImageMetadata::default();

    if let Ok(file) = File::open(path) {
        let mut bufreader = BufReader::new(file);
        if let Ok(exif) = exif::Reader::new().read_from_container(&mut bufreader) {
            let uint = |tag| {
                exif.get_field(tag, exif::In::PRIMARY)
                    .and_then(|field| field.value.get_uint(0))
            };
            metadata.width = uint(exif::Tag::PixelXDimension);
            metadata.height = uint(exif::Tag::PixelYDimension);

            let mut fields = Map::new();
            for field in exif.fields().filter(|f| f.ifd_num == exif::In::PRIMARY) {
                let value = field.display_value().with_unit(&exif).to_string();
                fields.insert(
                    field.tag.to_string(),
                    Value::String(value.trim_matches('"').to_string()),
                );
            }
            if !fields.is_empty() {
                metadata.exif = Some(Value::Object(fields));
            }
        }
    }

    // Fall back to the image header when EXIF carries no dimensions
    if metadata.width.is_none() || metadata.height.is_none() {
        let dims = image::ImageReader::open(path)
            .and_then(|reader| reader.with_guessed_format())
            .ok()
            .and_then(|reader| reader.into_dimensions().ok());
        if let Some((width, height)) = dims {
            metadata.width = Some(width);
            metadata.height = Some(height);
        }
    }

    debug!(
        "Metadata for {}: {:?}x{:?}, exif: {}",
        path.display(),
        metadata.width,
        metadata.height,
        metadata.exif.is_some()
    );
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};

    #[test]
    fn test_dimensions_without_exif() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.png");
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(12, 7, Rgba([200, 100, 50, 255])))
            .save(&path)
            .unwrap();

        let metadata = extract_metadata(&path);
        assert_eq!((metadata.width, metadata.height), (Some(12), Some(7)));
        assert!(metadata.exif.is_none());
    }

    #[test]
    fn test_unreadable_file_yields_empty_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not an image").unwrap();

        let metadata = extract_metadata(&path);
        assert_eq!((metadata.width, metadata.height), (None, None));
        assert!(metadata.exif.is_none());
    }
}
