// src/engine/encoder.rs
//
// Encoder stage: JPEG (mozjpeg), PNG (image + oxipng), WebP with quality settings.

use crate::engine::common::run_with_panic_policy;
use crate::engine::MAX_DIMENSION;
use crate::error::{BatchError, Result};
use crate::ops::OutputFormat;
use image::{DynamicImage, ImageFormat};
use mozjpeg::{ColorSpace, Compress, ScanMode};
use std::borrow::Cow;
use std::io::Cursor;

/// Derives per-format encode settings from a 0-100 quality value.
/// Quality bands:
/// - High (>=85): visual quality first
/// - Balanced (70-84): quality/speed balance
/// - Fast (50-69): speed leaning
/// - Fastest (<50): speed first
#[derive(Debug, Clone, Copy)]
pub struct QualitySettings {
    quality: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QualityBand {
    High,
    Balanced,
    Fast,
    Fastest,
}

impl QualitySettings {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.min(100) as f32,
        }
    }

    pub fn quality(&self) -> f32 {
        self.quality
    }

    fn band(&self) -> QualityBand {
        if self.quality >= 85.0 {
            QualityBand::High
        } else if self.quality >= 70.0 {
            QualityBand::Balanced
        } else if self.quality >= 50.0 {
            QualityBand::Fast
        } else {
            QualityBand::Fastest
        }
    }

    // WebP: method 4 / single pass / no preprocessing is the balanced
    // speed-quality operating point across all bands.
    pub fn webp_method(&self) -> i32 {
        4
    }

    pub fn webp_pass(&self) -> i32 {
        1
    }

    pub fn webp_preprocessing(&self) -> i32 {
        0
    }

    pub fn webp_sns_strength(&self) -> i32 {
        match self.band() {
            QualityBand::High => 50,
            QualityBand::Balanced => 70,
            QualityBand::Fast | QualityBand::Fastest => 80,
        }
    }

    pub fn webp_filter_strength(&self) -> i32 {
        if self.quality >= 80.0 {
            20
        } else if self.quality >= 60.0 {
            30
        } else {
            40
        }
    }

    pub fn webp_filter_sharpness(&self) -> i32 {
        match self.band() {
            QualityBand::High => 2,
            QualityBand::Balanced | QualityBand::Fast | QualityBand::Fastest => 0,
        }
    }

    pub fn jpeg_smoothing(&self) -> u8 {
        if self.quality >= 90.0 {
            0
        } else if self.quality >= 70.0 {
            5
        } else if self.quality >= 60.0 {
            10
        } else {
            18
        }
    }
}

/// Encode a decoded image to the requested output format.
/// Lossless formats run at their canonical maximum regardless of the
/// requested quality (see `OutputFormat::effective_quality`).
pub fn encode_image(img: &DynamicImage, format: &OutputFormat) -> Result<Vec<u8>> {
    match format {
        OutputFormat::Jpeg { .. } => encode_jpeg(img, format.effective_quality()),
        OutputFormat::Png => encode_png(img),
        OutputFormat::WebP { .. } => encode_webp(img, format.effective_quality()),
    }
}

/// Encode to JPEG using mozjpeg with web-optimized settings
/// (progressive, optimized coding, quality-banded smoothing).
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    run_with_panic_policy("encode:jpeg", || {
        let quality = quality.min(100);

        // Avoid conversion if already RGB8
        let rgb: Cow<'_, image::RgbImage> = match img {
            DynamicImage::ImageRgb8(rgb_img) => Cow::Borrowed(rgb_img),
            _ => Cow::Owned(img.to_rgb8()),
        };
        let (w, h) = rgb.dimensions();
        let pixels: &[u8] = rgb.as_raw();

        if w == 0 || h == 0 {
            return Err(BatchError::encode_failed(
                "jpeg",
                "invalid image dimensions: width or height is zero",
            ));
        }

        if w > MAX_DIMENSION || h > MAX_DIMENSION {
            return Err(BatchError::dimension_exceeds_limit(w.max(h), MAX_DIMENSION));
        }

        let expected_len = (w as usize) * (h as usize) * 3;
        if pixels.len() != expected_len {
            return Err(BatchError::corrupted_image());
        }

        let settings = QualitySettings::new(quality);

        let mut comp = Compress::new(ColorSpace::JCS_RGB);
        comp.set_size(w as usize, h as usize);
        comp.set_color_space(ColorSpace::JCS_YCbCr);
        comp.set_quality(settings.quality());
        comp.set_chroma_sampling_pixel_sizes((2, 2), (2, 2));
        comp.set_progressive_mode();
        comp.set_optimize_coding(true);
        comp.set_optimize_scans(true);
        comp.set_scan_optimization_mode(ScanMode::AllComponentsTogether);
        comp.set_smoothing_factor(settings.jpeg_smoothing());

        let estimated_size = (w as usize * h as usize * 3 / 10).max(4096);
        let mut output = Vec::with_capacity(estimated_size);

        let mut writer = comp.start_compress(&mut output).map_err(|e| {
            BatchError::encode_failed("jpeg", format!("mozjpeg: failed to start compress: {e:?}"))
        })?;

        let stride = w as usize * 3;
        for row in pixels.chunks(stride) {
            writer.write_scanlines(row).map_err(|e| {
                BatchError::encode_failed(
                    "jpeg",
                    format!("mozjpeg: failed to write scanlines: {e:?}"),
                )
            })?;
        }

        writer.finish().map_err(|e| {
            BatchError::encode_failed("jpeg", format!("mozjpeg: failed to finish: {e:?}"))
        })?;

        Ok(output)
    })
}

/// Encode to PNG using the image crate, then recompress losslessly with oxipng.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    run_with_panic_policy("encode:png", || {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| BatchError::encode_failed("png", format!("PNG encode failed: {e}")))?;

        let mut options = oxipng::Options::from_preset(4);
        // Ancillary chunks carry no pixel data for freshly encoded output
        options.strip = oxipng::StripChunks::Safe;

        oxipng::optimize_from_memory(&buf, &options).map_err(|e| {
            BatchError::encode_failed("png", format!("oxipng optimization failed: {e}"))
        })
    })
}

/// Encode to WebP with quality-banded settings.
/// Sources with an alpha channel keep it; opaque sources encode as RGB.
pub fn encode_webp(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    run_with_panic_policy("encode:webp", || {
        let has_alpha = img.color().has_alpha();

        let rgba;
        let rgb;
        let encoder = if has_alpha {
            rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            webp::Encoder::from_rgba(&rgba, w, h)
        } else {
            rgb = match img {
                DynamicImage::ImageRgb8(rgb_img) => Cow::Borrowed(rgb_img),
                _ => Cow::Owned(img.to_rgb8()),
            };
            let (w, h) = rgb.dimensions();
            webp::Encoder::from_rgb(&rgb, w, h)
        };

        let mut config = webp::WebPConfig::new()
            .map_err(|_| BatchError::encode_failed("webp", "failed to create WebPConfig"))?;

        let settings = QualitySettings::new(quality);
        config.quality = settings.quality();
        config.method = settings.webp_method();
        config.pass = settings.webp_pass();
        config.preprocessing = settings.webp_preprocessing();
        config.sns_strength = settings.webp_sns_strength();
        config.autofilter = 1;
        config.filter_strength = settings.webp_filter_strength();
        config.filter_sharpness = settings.webp_filter_sharpness();

        let mem = encoder
            .encode_advanced(&config)
            .map_err(|e| BatchError::encode_failed("webp", format!("WebP encode failed: {e:?}")))?;

        Ok(mem.to_vec())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    #[test]
    fn test_encode_jpeg_produces_jfif() {
        let img = create_test_image(16, 16);
        let data = encode_jpeg(&img, 80).unwrap();
        assert!(data.len() > 2);
        assert_eq!(&data[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_encode_jpeg_rejects_zero_dimension() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(encode_jpeg(&img, 80).is_err());
    }

    #[test]
    fn test_encode_png_roundtrips() {
        let img = create_test_image(8, 8);
        let data = encode_png(&img).unwrap();
        let decoded = image::load_from_memory(&data).unwrap();
        assert_eq!(decoded.width(), 8);
        assert_eq!(decoded.height(), 8);
    }

    #[test]
    fn test_encode_png_ignores_quality_axis() {
        // The PNG path has no quality knob; the dispatcher must produce the
        // same canonical output whatever quality the caller asked for.
        let img = create_test_image(8, 8);
        let a = encode_image(&img, &OutputFormat::Png).unwrap();
        let b = encode_png(&img).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_encode_webp_opaque_and_alpha() {
        let opaque = create_test_image(10, 10);
        let data = encode_webp(&opaque, 75).unwrap();
        assert!(!data.is_empty());
        assert_eq!(&data[..4], b"RIFF");

        let translucent = DynamicImage::ImageRgba8(RgbaImage::from_fn(10, 10, |x, _| {
            Rgba([200, 100, 50, (x * 20) as u8])
        }));
        let data = encode_webp(&translucent, 75).unwrap();
        assert!(!data.is_empty());
    }

    #[test]
    fn test_quality_bands() {
        assert_eq!(QualitySettings::new(90).webp_sns_strength(), 50);
        assert_eq!(QualitySettings::new(75).webp_sns_strength(), 70);
        assert_eq!(QualitySettings::new(40).webp_sns_strength(), 80);
        assert_eq!(QualitySettings::new(90).jpeg_smoothing(), 0);
        assert_eq!(QualitySettings::new(55).jpeg_smoothing(), 10);
        assert_eq!(QualitySettings::new(200).quality(), 100.0);
    }

    #[test]
    fn test_encode_image_dispatches_by_format() {
        let img = create_test_image(12, 12);
        let jpeg = encode_image(&img, &OutputFormat::Jpeg { quality: 80 }).unwrap();
        let webp = encode_image(&img, &OutputFormat::WebP { quality: 80 }).unwrap();
        let png = encode_image(&img, &OutputFormat::Png).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&webp[..4], b"RIFF");
        assert_eq!(&png[..4], &[0x89, b'P', b'N', b'G']);
    }
}
