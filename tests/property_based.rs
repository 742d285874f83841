// tests/property_based.rs
//
// Property tests for the pure parts of the pipeline.

use batchpress::engine::{calc_cover_dimensions, calc_fit_dimensions};
use batchpress::{EncodeOptions, OutputFormat, ResizeFit};
use image::{DynamicImage, Rgb, RgbImage};
use proptest::prelude::*;

fn create_test_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_fit_dimensions_stay_inside_target(
        orig_w in 1u32..=4096,
        orig_h in 1u32..=4096,
        target_w in 1u32..=4096,
        target_h in 1u32..=4096,
    ) {
        let (w, h) = calc_fit_dimensions(orig_w, orig_h, Some(target_w), Some(target_h));
        prop_assert!(w <= target_w);
        prop_assert!(h <= target_h);
        // One axis always reaches its target exactly
        prop_assert!(w == target_w || h == target_h);
    }

    #[test]
    fn prop_fit_dimensions_preserve_aspect_ratio(
        orig_w in 16u32..=4096,
        orig_h in 16u32..=4096,
        target_w in 16u32..=2048,
    ) {
        let (w, h) = calc_fit_dimensions(orig_w, orig_h, Some(target_w), None);
        prop_assert_eq!(w, target_w);
        let expected = orig_h as f64 * (target_w as f64 / orig_w as f64);
        prop_assert!((h as f64 - expected).abs() <= 0.5 + f64::EPSILON);
    }

    #[test]
    fn prop_cover_dimensions_cover_the_target(
        orig_w in 1u32..=4096,
        orig_h in 1u32..=4096,
        target_w in 1u32..=2048,
        target_h in 1u32..=2048,
    ) {
        let (w, h) = calc_cover_dimensions(orig_w, orig_h, target_w, target_h);
        prop_assert!(w >= target_w);
        prop_assert!(h >= target_h);
    }

    #[test]
    fn prop_effective_quality_is_bounded(quality in 0u8..=255) {
        for name in ["jpeg", "webp", "png"] {
            let format = OutputFormat::from_str(name, Some(quality)).unwrap();
            let effective = format.effective_quality();
            prop_assert!(effective <= 100);
            if format.is_lossless() {
                prop_assert_eq!(effective, 100);
            }
        }
    }

    #[test]
    fn prop_resize_inside_matches_calc(
        orig_w in 1u32..=64,
        orig_h in 1u32..=64,
        target_w in 1u32..=64,
        target_h in 1u32..=64,
    ) {
        let img = create_test_image(orig_w, orig_h);
        let (calc_w, calc_h) =
            calc_fit_dimensions(orig_w, orig_h, Some(target_w), Some(target_h));
        let options = EncodeOptions::new(OutputFormat::Png)
            .with_dimensions(Some(target_w), Some(target_h));
        let out = batchpress::engine::pipeline::plan_resize(img, &options).unwrap();
        prop_assert_eq!((out.width(), out.height()), (calc_w.max(1), calc_h.max(1)));
    }

    #[test]
    fn prop_resize_cover_hits_exact_box(
        orig_w in 8u32..=64,
        orig_h in 8u32..=64,
        target_w in 1u32..=32,
        target_h in 1u32..=32,
    ) {
        let img = create_test_image(orig_w, orig_h);
        let options = EncodeOptions::new(OutputFormat::Png)
            .with_dimensions(Some(target_w), Some(target_h))
            .with_fit(ResizeFit::Cover);
        let out = batchpress::engine::pipeline::plan_resize(img, &options).unwrap();
        prop_assert_eq!((out.width(), out.height()), (target_w, target_h));
    }
}
