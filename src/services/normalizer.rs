//! Print normalization: upscale to a minimum size and re-encode as a
//! lossless RGBA PNG carrying the target print density.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbaImage};
use std::io::Cursor;

use crate::models::asset::ImageMetadata;

const METERS_PER_INCH: f64 = 0.0254;
/// Density assumed when a PNG carries no physical dimensions.
const UNSPECIFIED_DPI: u32 = 72;
/// Longest edge over shortest edge beyond which artwork is not upscaled.
const MAX_ASPECT_RATIO: u32 = 10;
/// Upper bound on the upscaled canvas (400 MB of RGBA).
const MAX_OUTPUT_PIXELS: u64 = 100_000_000;

#[derive(Debug, Clone, Copy)]
pub struct NormalizerConfig {
    /// Minimum length of the shorter edge, in pixels
    pub min_dimension: u32,
    pub target_dpi: u32,
}

#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub metadata: ImageMetadata,
}

pub struct ImageNormalizer {
    config: NormalizerConfig,
}

impl ImageNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> NormalizerConfig {
        self.config
    }

    pub fn normalize(&self, raw: &[u8]) -> Result<NormalizedImage, NormalizeError> {
        let decoded = image::load_from_memory(raw)?;
        let upscaled = upscale_to_minimum(decoded, self.config.min_dimension)?;
        let rgba = upscaled.to_rgba8();
        let bytes = encode_png(&rgba, self.config.target_dpi)?;

        Ok(NormalizedImage {
            metadata: ImageMetadata {
                width: rgba.width(),
                height: rgba.height(),
                format: "png".to_string(),
                dpi: self.config.target_dpi,
            },
            bytes,
        })
    }

    /// Check that an artifact read back from storage meets the print
    /// requirements.
    pub fn verify(&self, metadata: &ImageMetadata) -> Result<(), NormalizeError> {
        if metadata.dpi < self.config.target_dpi {
            return Err(NormalizeError::BelowPrintQuality(format!(
                "density {} DPI is below the required {} DPI",
                metadata.dpi, self.config.target_dpi
            )));
        }
        let shorter = metadata.width.min(metadata.height);
        if shorter < self.config.min_dimension {
            return Err(NormalizeError::BelowPrintQuality(format!(
                "shorter edge {}px is below the required {}px",
                shorter, self.config.min_dimension
            )));
        }
        Ok(())
    }
}

/// Scale so the shorter edge reaches `min_dimension`. The target canvas is
/// bounded before anything is allocated.
fn upscale_to_minimum(image: DynamicImage, min_dimension: u32) -> Result<DynamicImage, NormalizeError> {
    let (width, height) = image.dimensions();
    let shorter = width.min(height);
    if shorter == 0 || shorter >= min_dimension {
        return Ok(image);
    }

    let longer = width.max(height);
    if longer / shorter > MAX_ASPECT_RATIO {
        return Err(NormalizeError::Unprintable(format!(
            "{width}x{height} exceeds the {MAX_ASPECT_RATIO}:1 aspect ratio limit"
        )));
    }

    let scale = f64::from(min_dimension) / f64::from(shorter);
    let new_width = (f64::from(width) * scale).round().max(1.0);
    let new_height = (f64::from(height) * scale).round().max(1.0);
    if new_width * new_height > MAX_OUTPUT_PIXELS as f64 {
        return Err(NormalizeError::Unprintable(format!(
            "upscaling {width}x{height} to {new_width}x{new_height} exceeds {MAX_OUTPUT_PIXELS} pixels"
        )));
    }

    let (new_width, new_height) = (new_width as u32, new_height as u32);
    tracing::debug!(width, height, new_width, new_height, "Upscaling artwork for print");
    Ok(image.resize_exact(new_width, new_height, FilterType::Lanczos3))
}

fn dpi_to_pixels_per_meter(dpi: u32) -> u32 {
    (f64::from(dpi) / METERS_PER_INCH).round() as u32
}

fn pixels_per_meter_to_dpi(ppm: u32) -> u32 {
    (f64::from(ppm) * METERS_PER_INCH).round() as u32
}

fn encode_png(rgba: &RgbaImage, dpi: u32) -> Result<Vec<u8>, NormalizeError> {
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, rgba.width(), rgba.height());
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let ppm = dpi_to_pixels_per_meter(dpi);
        encoder.set_pixel_dims(Some(png::PixelDimensions {
            xppu: ppm,
            yppu: ppm,
            unit: png::Unit::Meter,
        }));
        let mut writer = encoder.write_header()?;
        writer.write_image_data(rgba.as_raw())?;
        writer.finish()?;
    }
    Ok(out)
}

/// Read dimensions, format and density back from encoded PNG bytes.
pub fn read_metadata(bytes: &[u8]) -> Result<ImageMetadata, NormalizeError> {
    let reader = png::Decoder::new(Cursor::new(bytes)).read_info()?;
    let info = reader.info();
    let dpi = match info.pixel_dims {
        Some(dims) if dims.unit == png::Unit::Meter => pixels_per_meter_to_dpi(dims.xppu),
        _ => UNSPECIFIED_DPI,
    };
    Ok(ImageMetadata {
        width: info.width,
        height: info.height,
        format: "png".to_string(),
        dpi,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Failed to encode PNG: {0}")]
    Encode(#[from] png::EncodingError),

    #[error("Failed to read PNG metadata: {0}")]
    Metadata(#[from] png::DecodingError),

    #[error("Artwork below print quality: {0}")]
    BelowPrintQuality(String),

    #[error("Artwork cannot be upscaled for print: {0}")]
    Unprintable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba};

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([200, 30, 30, 255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn normalizer(min_dimension: u32) -> ImageNormalizer {
        ImageNormalizer::new(NormalizerConfig {
            min_dimension,
            target_dpi: 300,
        })
    }

    #[test]
    fn test_upscales_shorter_edge_preserving_aspect() {
        let result = normalizer(64).normalize(&sample_png(32, 16)).unwrap();
        assert_eq!(result.metadata.width, 128);
        assert_eq!(result.metadata.height, 64);
        assert_eq!(result.metadata.format, "png");
    }

    #[test]
    fn test_large_images_keep_their_size() {
        let result = normalizer(8).normalize(&sample_png(40, 20)).unwrap();
        assert_eq!((result.metadata.width, result.metadata.height), (40, 20));
    }

    #[test]
    fn test_density_survives_read_back() {
        let normalizer = normalizer(16);
        let result = normalizer.normalize(&sample_png(16, 16)).unwrap();
        let metadata = read_metadata(&result.bytes).unwrap();
        assert_eq!(metadata, result.metadata);
        assert_eq!(metadata.dpi, 300);
        normalizer.verify(&metadata).unwrap();
    }

    #[test]
    fn test_plain_png_reports_default_density_and_fails_verification() {
        let metadata = read_metadata(&sample_png(20, 20)).unwrap();
        assert_eq!(metadata.dpi, 72);
        assert!(matches!(
            normalizer(10).verify(&metadata),
            Err(NormalizeError::BelowPrintQuality(_))
        ));
    }

    #[test]
    fn test_sliver_is_rejected_before_upscaling() {
        let err = normalizer(3000).normalize(&sample_png(1, 4000)).unwrap_err();
        assert!(matches!(err, NormalizeError::Unprintable(_)));
        assert!(err.to_string().contains("1x4000"));
    }

    #[test]
    fn test_oversized_canvas_is_rejected() {
        // 5:1 is an acceptable shape, but 5000x25000 is not an acceptable size
        assert!(matches!(
            normalizer(5000).normalize(&sample_png(2, 10)),
            Err(NormalizeError::Unprintable(_))
        ));
    }

    #[test]
    fn test_elongated_artwork_within_limits_is_upscaled() {
        let result = normalizer(20).normalize(&sample_png(4, 40)).unwrap();
        assert_eq!((result.metadata.width, result.metadata.height), (20, 200));
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        assert!(matches!(
            normalizer(10).normalize(b"not an image"),
            Err(NormalizeError::Decode(_))
        ));
    }
}
