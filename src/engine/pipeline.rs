// src/engine/pipeline.rs
//
// Resize stage planning and execution.
// Target dimensions are planned from the encode options, then executed with
// fast_image_resize (SIMD) using deterministic bilinear convolution.

use crate::error::{BatchError, Result};
use crate::ops::{EncodeOptions, ResizeFit};
use fast_image_resize::{self as fir, ImageBufferError, MulDiv, PixelType, ResizeOptions};
use image::{imageops::FilterType, DynamicImage, RgbImage, RgbaImage};

/// Calculate resize dimensions maintaining aspect ratio (fit = inside semantics)
pub fn calc_fit_dimensions(
    orig_w: u32,
    orig_h: u32,
    target_w: Option<u32>,
    target_h: Option<u32>,
) -> (u32, u32) {
    match (target_w, target_h) {
        (Some(w), Some(h)) => {
            let orig_ratio = orig_w as f64 / orig_h as f64;
            let target_ratio = w as f64 / h as f64;

            if orig_ratio > target_ratio {
                // Original image is wider -> fit to width
                let ratio = w as f64 / orig_w as f64;
                (w, (orig_h as f64 * ratio).round() as u32)
            } else {
                // Original image is taller -> fit to height
                let ratio = h as f64 / orig_h as f64;
                ((orig_w as f64 * ratio).round() as u32, h)
            }
        }
        (Some(w), None) => {
            let ratio = w as f64 / orig_w as f64;
            (w, (orig_h as f64 * ratio).round() as u32)
        }
        (None, Some(h)) => {
            let ratio = h as f64 / orig_h as f64;
            ((orig_w as f64 * ratio).round() as u32, h)
        }
        (None, None) => (orig_w, orig_h),
    }
}

/// Calculate the scale-to-cover dimensions for a target box.
pub fn calc_cover_dimensions(orig_w: u32, orig_h: u32, target_w: u32, target_h: u32) -> (u32, u32) {
    if orig_w == 0 || orig_h == 0 {
        return (target_w.max(1), target_h.max(1));
    }
    let scale_w = target_w as f64 / orig_w as f64;
    let scale_h = target_h as f64 / orig_h as f64;
    let scale = scale_w.max(scale_h);
    let resize_w = ((orig_w as f64 * scale).ceil() as u32).max(1);
    let resize_h = ((orig_h as f64 * scale).ceil() as u32).max(1);
    (resize_w, resize_h)
}

fn crop_to_dimensions(img: DynamicImage, target_w: u32, target_h: u32) -> DynamicImage {
    let crop_width = target_w.min(img.width()).max(1);
    let crop_height = target_h.min(img.height()).max(1);
    let crop_x = if img.width() > crop_width {
        (img.width() - crop_width) / 2
    } else {
        0
    };
    let crop_y = if img.height() > crop_height {
        (img.height() - crop_height) / 2
    } else {
        0
    };
    img.crop_imm(crop_x, crop_y, crop_width, crop_height)
}

/// Apply the resize stage described by the encode options.
///
/// Returns the image unchanged when no target dimensions are set or the
/// planned dimensions equal the source. `Cover` is the only mode that crops,
/// and only because the caller asked for it.
pub fn plan_resize(img: DynamicImage, options: &EncodeOptions) -> Result<DynamicImage> {
    if !options.wants_resize() {
        return Ok(img);
    }

    let (src_w, src_h) = (img.width(), img.height());
    if let (Some(w), Some(h)) = (options.width, options.height) {
        if w == 0 || h == 0 {
            return Err(BatchError::invalid_resize_dimensions(Some(w), Some(h)));
        }
        match options.fit {
            ResizeFit::Inside => {
                // Rounding on extreme aspect ratios can collapse an axis to 0;
                // clamp so a valid request always yields a drawable image.
                let (dst_w, dst_h) = calc_fit_dimensions(src_w, src_h, Some(w), Some(h));
                resize_if_needed(img, dst_w.max(1), dst_h.max(1))
            }
            ResizeFit::Fill => resize_if_needed(img, w, h),
            ResizeFit::Cover => {
                let (scale_w, scale_h) = calc_cover_dimensions(src_w, src_h, w, h);
                let scaled = resize_if_needed(img, scale_w, scale_h)?;
                Ok(crop_to_dimensions(scaled, w, h))
            }
        }
    } else {
        // Single-axis targets always scale proportionally
        if options.width == Some(0) || options.height == Some(0) {
            return Err(BatchError::invalid_resize_dimensions(
                options.width,
                options.height,
            ));
        }
        let (dst_w, dst_h) = calc_fit_dimensions(src_w, src_h, options.width, options.height);
        resize_if_needed(img, dst_w.max(1), dst_h.max(1))
    }
}

fn resize_if_needed(img: DynamicImage, dst_w: u32, dst_h: u32) -> Result<DynamicImage> {
    if (img.width(), img.height()) == (dst_w, dst_h) {
        return Ok(img);
    }
    fast_resize(img, dst_w, dst_h)
}

fn default_resize_options() -> ResizeOptions {
    // Deterministic resampling: bilinear convolution, same output every run
    ResizeOptions::new().resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Bilinear))
}

/// Resize with fast_image_resize, taking ownership of the pixel buffer.
pub fn fast_resize(img: DynamicImage, dst_width: u32, dst_height: u32) -> Result<DynamicImage> {
    let src_width = img.width();
    let src_height = img.height();

    if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
        return Err(BatchError::resize_failed(
            (src_width, src_height),
            (dst_width, dst_height),
            "invalid dimensions for resize",
        ));
    }

    // Select pixel layout without forcing RGBA when not needed.
    // into_raw() transfers buffer ownership instead of copying.
    let (pixel_type, src_pixels): (PixelType, Vec<u8>) = match img {
        DynamicImage::ImageRgb8(rgb) => (PixelType::U8x3, rgb.into_raw()),
        DynamicImage::ImageRgba8(rgba) => (PixelType::U8x4, rgba.into_raw()),
        other => {
            let rgba = other.to_rgba8();
            (PixelType::U8x4, rgba.into_raw())
        }
    };

    fast_resize_impl(
        src_width,
        src_height,
        src_pixels,
        pixel_type,
        dst_width,
        dst_height,
    )
    .map_err(|reason| {
        BatchError::resize_failed((src_width, src_height), (dst_width, dst_height), reason)
    })
}

fn fast_resize_impl(
    src_width: u32,
    src_height: u32,
    mut src_pixels: Vec<u8>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
) -> std::result::Result<DynamicImage, String> {
    let pixel_count = (src_width as usize)
        .checked_mul(src_height as usize)
        .ok_or_else(|| "image dimensions overflow during resize".to_string())?;
    let required_bytes = pixel_count
        .checked_mul(pixel_type.size())
        .ok_or_else(|| "image buffer size overflow during resize".to_string())?;

    if src_pixels.len() < required_bytes {
        return Err(format!(
            "fir source image invalid buffer size. expected {required_bytes} bytes, got {} bytes",
            src_pixels.len()
        ));
    }

    let options = default_resize_options();
    let primary_result = match fir::images::Image::from_slice_u8(
        src_width,
        src_height,
        src_pixels.as_mut_slice(),
        pixel_type,
    ) {
        Ok(src_image) => {
            resize_with_source_image(src_image, pixel_type, dst_width, dst_height, &options)
        }
        Err(ImageBufferError::InvalidBufferAlignment) => {
            let aligned = copy_pixels_to_aligned_image(
                src_width,
                src_height,
                pixel_type,
                &src_pixels,
                required_bytes,
            )?;
            resize_with_source_image(aligned, pixel_type, dst_width, dst_height, &options)
        }
        Err(other) => Err(format!("fir source image error: {other:?}")),
    };

    match primary_result {
        Ok(img) => Ok(img),
        Err(err) => resize_with_image_crate_fallback(
            &src_pixels,
            src_width,
            src_height,
            pixel_type,
            dst_width,
            dst_height,
        )
        .map_err(|fallback_err| format!("{err}; image crate fallback failed: {fallback_err}")),
    }
}

fn copy_pixels_to_aligned_image(
    width: u32,
    height: u32,
    pixel_type: PixelType,
    src_pixels: &[u8],
    required_bytes: usize,
) -> std::result::Result<fir::images::Image<'static>, String> {
    let mut aligned_image = fir::images::Image::new(width, height, pixel_type);
    let aligned_buffer = aligned_image.buffer_mut();
    if aligned_buffer.len() != required_bytes {
        return Err(format!(
            "fir alignment fallback buffer mismatch. expected {required_bytes} bytes, got {} bytes",
            aligned_buffer.len()
        ));
    }
    aligned_buffer.copy_from_slice(&src_pixels[..required_bytes]);
    Ok(aligned_image)
}

fn resize_with_image_crate_fallback(
    src_pixels: &[u8],
    src_width: u32,
    src_height: u32,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
) -> std::result::Result<DynamicImage, String> {
    let filter = FilterType::Triangle;
    match pixel_type {
        PixelType::U8x3 => {
            let rgb = RgbImage::from_raw(src_width, src_height, src_pixels.to_vec())
                .ok_or_else(|| "failed to build rgb image for fallback resize".to_string())?;
            Ok(DynamicImage::ImageRgb8(image::imageops::resize(
                &rgb, dst_width, dst_height, filter,
            )))
        }
        PixelType::U8x4 => {
            let rgba = RgbaImage::from_raw(src_width, src_height, src_pixels.to_vec())
                .ok_or_else(|| "failed to build rgba image for fallback resize".to_string())?;
            Ok(DynamicImage::ImageRgba8(image::imageops::resize(
                &rgba, dst_width, dst_height, filter,
            )))
        }
        _ => Err("fallback resize supports only U8x3/U8x4 pixel types".to_string()),
    }
}

fn resize_with_source_image(
    mut src_image: fir::images::Image<'_>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
    options: &ResizeOptions,
) -> std::result::Result<DynamicImage, String> {
    let mut dst_image = fir::images::Image::new(dst_width, dst_height, pixel_type);

    // RGBA needs premultiplied alpha around the convolution to avoid halos
    let needs_premultiply = pixel_type == PixelType::U8x4;

    let mul_div = MulDiv::default();
    if needs_premultiply {
        mul_div
            .multiply_alpha_inplace(&mut src_image)
            .map_err(|e| format!("failed to premultiply alpha: {e}"))?;
    }

    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_image, &mut dst_image, options)
        .map_err(|e| format!("fir resize error: {e:?}"))?;

    if needs_premultiply {
        mul_div
            .divide_alpha_inplace(&mut dst_image)
            .map_err(|e| format!("failed to unpremultiply alpha: {e}"))?;
    }

    let dst_pixels = dst_image.into_vec();
    match pixel_type {
        PixelType::U8x3 => {
            let rgb_image = RgbImage::from_raw(dst_width, dst_height, dst_pixels)
                .ok_or("failed to create rgb image from resized data")?;
            Ok(DynamicImage::ImageRgb8(rgb_image))
        }
        PixelType::U8x4 => {
            let rgba_image = RgbaImage::from_raw(dst_width, dst_height, dst_pixels)
                .ok_or("failed to create rgba image from resized data")?;
            Ok(DynamicImage::ImageRgba8(rgba_image))
        }
        _ => Err("unsupported pixel type after resize".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OutputFormat;
    use image::Rgb;

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    fn options(width: Option<u32>, height: Option<u32>, fit: ResizeFit) -> EncodeOptions {
        EncodeOptions::new(OutputFormat::Png)
            .with_dimensions(width, height)
            .with_fit(fit)
    }

    #[test]
    fn test_fit_both_dimensions() {
        // wider than target ratio -> fit to width
        let (w, h) = calc_fit_dimensions(400, 300, Some(100), Some(100));
        assert_eq!((w, h), (100, 75));
    }

    #[test]
    fn test_fit_width_only_maintains_aspect_ratio() {
        let (w, h) = calc_fit_dimensions(1000, 500, Some(500), None);
        assert_eq!((w, h), (500, 250));
    }

    #[test]
    fn test_fit_height_only_maintains_aspect_ratio() {
        let (w, h) = calc_fit_dimensions(1000, 500, None, Some(250));
        assert_eq!((w, h), (500, 250));
    }

    #[test]
    fn test_fit_none_returns_original() {
        let (w, h) = calc_fit_dimensions(1000, 500, None, None);
        assert_eq!((w, h), (1000, 500));
    }

    #[test]
    fn test_cover_dimensions_cover_the_box() {
        let (w, h) = calc_cover_dimensions(400, 300, 100, 100);
        assert!(w >= 100 && h >= 100);
        assert_eq!((w, h), (134, 100));
    }

    #[test]
    fn test_plan_resize_noop_without_targets() {
        let img = create_test_image(40, 30);
        let out = plan_resize(img, &options(None, None, ResizeFit::Inside)).unwrap();
        assert_eq!((out.width(), out.height()), (40, 30));
    }

    #[test]
    fn test_plan_resize_inside() {
        let img = create_test_image(400, 300);
        let out = plan_resize(img, &options(Some(100), Some(100), ResizeFit::Inside)).unwrap();
        assert_eq!((out.width(), out.height()), (100, 75));
    }

    #[test]
    fn test_plan_resize_fill() {
        let img = create_test_image(400, 300);
        let out = plan_resize(img, &options(Some(100), Some(100), ResizeFit::Fill)).unwrap();
        assert_eq!((out.width(), out.height()), (100, 100));
    }

    #[test]
    fn test_plan_resize_cover_crops_to_exact_box() {
        let img = create_test_image(400, 300);
        let out = plan_resize(img, &options(Some(100), Some(100), ResizeFit::Cover)).unwrap();
        assert_eq!((out.width(), out.height()), (100, 100));
    }

    #[test]
    fn test_plan_resize_rejects_zero_target() {
        let img = create_test_image(40, 30);
        let err = plan_resize(img, &options(Some(0), Some(10), ResizeFit::Inside)).unwrap_err();
        assert!(matches!(err, BatchError::InvalidResizeDimensions { .. }));
    }

    #[test]
    fn test_plan_resize_same_dimensions_skips_resample() {
        let img = create_test_image(100, 100);
        let out = plan_resize(img, &options(Some(100), Some(100), ResizeFit::Fill)).unwrap();
        // Unchanged pixels prove the stage was skipped
        assert_eq!(out.to_rgb8().get_pixel(3, 7).0, [3, 7, 128]);
    }

    #[test]
    fn test_fast_resize_rgba_keeps_alpha_channel() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(20, 20, |_, _| {
            image::Rgba([255, 0, 0, 128])
        }));
        let out = fast_resize(img, 10, 10).unwrap();
        assert!(matches!(out, DynamicImage::ImageRgba8(_)));
        assert_eq!((out.width(), out.height()), (10, 10));
    }

    #[test]
    fn test_fast_resize_invalid_dimensions() {
        let img = create_test_image(1, 1);
        let err = fast_resize(img, 0, 10).unwrap_err();
        assert!(matches!(err, BatchError::ResizeFailed { .. }));
    }
}
