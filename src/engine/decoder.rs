// src/engine/decoder.rs
//
// Decoder stage: routes by the declared source format.
// JPEG -> mozjpeg (libjpeg-turbo), PNG -> zune-png, WebP -> libwebp.

use crate::engine::common::run_with_panic_policy;
use crate::engine::{MAX_DIMENSION, MAX_PIXELS};
use crate::error::{BatchError, Result};
use crate::ops::SourceFormat;
use image::{
    DynamicImage, GrayAlphaImage, GrayImage, ImageFormat, ImageReader, RgbImage, RgbaImage,
};
use mozjpeg::Decompress;
use std::io::Cursor;
use webp::{BitstreamFeatures, Decoder as WebPDecoder};
use zune_core::bytestream::ZCursor;
use zune_core::colorspace::ColorSpace;
use zune_core::options::DecoderOptions;
use zune_png::PngDecoder;

/// Decode source bytes according to their declared format.
///
/// The intake layer already validated the file; the declared tag is trusted
/// for routing. Bytes that turn out not to match the tag fail inside the
/// chosen codec with a decode error rather than being silently re-routed.
pub fn decode_image(bytes: &[u8], source_format: SourceFormat) -> Result<DynamicImage> {
    ensure_dimensions_safe(bytes)?;
    match source_format {
        SourceFormat::Jpeg => decode_jpeg_mozjpeg(bytes),
        SourceFormat::Png => decode_png_zune(bytes),
        SourceFormat::WebP => decode_webp_libwebp(bytes),
    }
}

/// Decode JPEG using mozjpeg (backed by libjpeg-turbo).
/// Significantly faster than a pure Rust decoder.
pub fn decode_jpeg_mozjpeg(data: &[u8]) -> Result<DynamicImage> {
    run_with_panic_policy("decode:jpeg", || {
        if !data.windows(2).any(|pair| pair == [0xFF, 0xD9]) {
            return Err(BatchError::decode_failed("jpeg: missing EOI marker"));
        }

        let decompress = Decompress::new_mem(data).map_err(|e| {
            BatchError::decode_failed(format!("jpeg: decompress init failed: {e:?}"))
        })?;

        let mut decompress = decompress
            .rgb()
            .map_err(|e| BatchError::decode_failed(format!("jpeg: rgb conversion failed: {e:?}")))?;

        let width = decompress.width();
        let height = decompress.height();
        if width > MAX_DIMENSION as usize || height > MAX_DIMENSION as usize {
            return Err(BatchError::dimension_exceeds_limit(
                width.max(height) as u32,
                MAX_DIMENSION,
            ));
        }
        let width_u32 = width as u32;
        let height_u32 = height as u32;
        check_dimensions(width_u32, height_u32)?;

        let pixels: Vec<[u8; 3]> = decompress.read_scanlines().map_err(|e| {
            BatchError::decode_failed(format!("jpeg: failed to read scanlines: {e:?}"))
        })?;

        let flat_pixels: Vec<u8> = pixels.into_iter().flatten().collect();

        let rgb_image = RgbImage::from_raw(width_u32, height_u32, flat_pixels)
            .ok_or_else(|| BatchError::decode_failed("jpeg: failed to build image from raw data"))?;

        Ok(DynamicImage::ImageRgb8(rgb_image))
    })
}

/// Decode PNG using zune-png. 16-bit input is stripped to 8-bit.
pub fn decode_png_zune(data: &[u8]) -> Result<DynamicImage> {
    run_with_panic_policy("decode:png", || {
        let options = DecoderOptions::default().png_set_strip_to_8bit(true);
        let mut decoder = PngDecoder::new_with_options(ZCursor::new(data), options);
        let pixels = decoder
            .decode()
            .map_err(|e| BatchError::decode_failed(format!("png: decode failed: {e}")))?;

        let info = decoder
            .info()
            .ok_or_else(|| BatchError::decode_failed("png: missing header info"))?;

        let width = info.width as u32;
        let height = info.height as u32;
        check_dimensions(width, height)?;

        let buf = match pixels {
            zune_core::result::DecodingResult::U8(v) => v,
            _ => {
                return Err(BatchError::decode_failed(
                    "png: unexpected non-U8 pixel buffer",
                ))
            }
        };

        let colorspace = decoder
            .colorspace()
            .ok_or_else(|| BatchError::decode_failed("png: missing colorspace"))?;

        let img = match colorspace {
            ColorSpace::RGB => RgbImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| BatchError::decode_failed("png: failed to build RGB image"))?,
            ColorSpace::RGBA | ColorSpace::YCbCr | ColorSpace::BGRA | ColorSpace::ARGB => {
                RgbaImage::from_raw(width, height, buf)
                    .map(DynamicImage::ImageRgba8)
                    .ok_or_else(|| BatchError::decode_failed("png: failed to build RGBA image"))?
            }
            ColorSpace::Luma => GrayImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| BatchError::decode_failed("png: failed to build Luma image"))?,
            ColorSpace::LumaA => GrayAlphaImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageLumaA8)
                .ok_or_else(|| BatchError::decode_failed("png: failed to build LumaA image"))?,
            other => {
                return Err(BatchError::decode_failed(format!(
                    "png: unsupported colorspace {other:?}"
                )))
            }
        };

        Ok(img)
    })
}

/// Decode WebP using libwebp. Falls back to the image crate for animated WebP.
pub fn decode_webp_libwebp(data: &[u8]) -> Result<DynamicImage> {
    run_with_panic_policy("decode:webp", || {
        // Parse the header first to avoid allocating huge buffers on malformed files
        let features = BitstreamFeatures::new(data)
            .ok_or_else(|| BatchError::decode_failed("webp: failed to read bitstream features"))?;

        if features.has_animation() {
            // libwebp's simple decoder does not support animation
            return image::load_from_memory(data).map_err(|e| {
                BatchError::decode_failed(format!("webp (animated) decode failed: {e}"))
            });
        }

        check_dimensions(features.width(), features.height())?;

        let decoded = WebPDecoder::new(data)
            .decode()
            .ok_or_else(|| BatchError::decode_failed("webp: decode failed"))?;

        check_dimensions(decoded.width(), decoded.height())?;

        Ok(decoded.to_image())
    })
}

/// Detect the actual container format from magic bytes. Returns None if unknown.
pub fn detect_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}

/// Check that dimensions are within safe limits.
/// Oversized images are rejected as potential decompression bombs.
pub fn check_dimensions(width: u32, height: u32) -> Result<()> {
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(BatchError::dimension_exceeds_limit(
            width.max(height),
            MAX_DIMENSION,
        ));
    }
    let pixels = width as u64 * height as u64;
    if pixels > MAX_PIXELS {
        return Err(BatchError::pixel_count_exceeds_limit(pixels, MAX_PIXELS));
    }
    Ok(())
}

/// Inspect encoded bytes and reject unsafe dimensions before full decode.
pub fn ensure_dimensions_safe(bytes: &[u8]) -> Result<()> {
    let cursor = Cursor::new(bytes);
    if let Ok(reader) = ImageReader::new(cursor).with_guessed_format() {
        if let Ok((width, height)) = reader.into_dimensions() {
            return check_dimensions(width, height);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb};

    fn encode_webp_sample(width: u32, height: u32) -> Vec<u8> {
        let rgb: Vec<u8> = std::iter::repeat([10u8, 20u8, 30u8])
            .take((width * height) as usize)
            .flatten()
            .collect();
        let encoder = webp::Encoder::from_rgb(&rgb, width, height);
        encoder.encode_lossless().to_vec()
    }

    fn encode_png_sample(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |_, _| Rgb([0, 0, 0]));
        let mut buffer = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        buffer
    }

    fn encode_jpeg_sample(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([9, 8, 7]));
        let mut buffer = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)
            .unwrap();
        buffer
    }

    #[test]
    fn test_decode_routes_png() {
        let png = encode_png_sample(3, 2);
        let img = decode_image(&png, SourceFormat::Png).unwrap();
        assert_eq!(img.dimensions(), (3, 2));
    }

    #[test]
    fn test_decode_routes_jpeg() {
        let jpeg = encode_jpeg_sample(2, 2);
        let img = decode_image(&jpeg, SourceFormat::Jpeg).unwrap();
        assert_eq!(img.dimensions(), (2, 2));
    }

    #[test]
    fn test_decode_routes_webp() {
        let data = encode_webp_sample(3, 2);
        let img = decode_image(&data, SourceFormat::WebP).unwrap();
        assert_eq!(img.dimensions(), (3, 2));
        let rgb = img.to_rgb8();
        assert_eq!(rgb.get_pixel(0, 0).0, [10, 20, 30]);
    }

    #[test]
    fn test_mismatched_tag_fails_with_decode_error() {
        let png = encode_png_sample(2, 2);
        let err = decode_image(&png, SourceFormat::Jpeg).unwrap_err();
        assert!(matches!(err, BatchError::DecodeFailed { .. }));
    }

    #[test]
    fn test_garbage_bytes_fail() {
        let err = decode_image(b"not an image at all", SourceFormat::Png).unwrap_err();
        assert!(matches!(err, BatchError::DecodeFailed { .. }));
    }

    #[test]
    fn test_ensure_dimensions_safe_rejects_large_image() {
        let data = encode_png_sample(MAX_DIMENSION + 1, 1);
        let err = ensure_dimensions_safe(&data).unwrap_err();
        assert!(matches!(err, BatchError::DimensionExceedsLimit { .. }));
    }

    #[test]
    fn test_check_dimensions_pixel_budget() {
        assert!(check_dimensions(16000, 16000).is_err());
        assert!(check_dimensions(8000, 8000).is_ok());
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(
            detect_format(&encode_png_sample(2, 2)),
            Some(ImageFormat::Png)
        );
        assert_eq!(
            detect_format(&encode_jpeg_sample(2, 2)),
            Some(ImageFormat::Jpeg)
        );
    }
}
