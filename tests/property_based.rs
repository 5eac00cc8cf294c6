// tests/property_based.rs
//
// Property tests for the dimension planner, the size controller and the
// report.

use image::{DynamicImage, RgbImage};
use proptest::prelude::*;
use squeeze_image::engine::{
    compress_with_encoder, plan_dimensions, EngineResult, Provenance, SizeController,
    SourceImage, StepLog, WorkingImage,
};
use squeeze_image::{
    CompressionConfig, CompressionPlan, DimensionLadder, OutputFormat, Quality, QualityLadder,
};
use std::io::Cursor;
use std::sync::{Arc, Mutex};

fn working(width: u32, height: u32) -> WorkingImage {
    WorkingImage::new(
        Arc::new(DynamicImage::ImageRgb8(RgbImage::new(width, height))),
        Provenance::Original,
    )
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

/// Output size grows with pixels and quality, like a real lossy codec.
fn proportional_size(plan: &CompressionPlan) -> u64 {
    plan.pixel_count() * plan.quality.get() as u64 / 100 + 1
}

fn ladder_strategy() -> impl Strategy<Value = (QualityLadder, Quality, Vec<(u32, u32)>, Quality)> {
    (
        1u8..=30,
        0u8..=90,
        1u32..=20,
        10u8..=100,
        prop::collection::vec((1u32..=400, 1u32..=400), 0..6),
        1u8..=100,
    )
        .prop_map(|(step, floor, attempts, start, entries, phase)| {
            (
                QualityLadder::new(step, Quality::new(floor), attempts),
                Quality::new(start),
                entries,
                Quality::new(phase),
            )
        })
}

proptest! {
    #[test]
    fn prop_plan_never_upscales_and_fits(
        nw in 1u32..=20_000,
        nh in 1u32..=20_000,
        mw in 1u32..=8_000,
        mh in 1u32..=8_000,
    ) {
        let (w, h) = plan_dimensions(nw, nh, mw, mh);
        prop_assert!(w >= 1 && h >= 1);
        prop_assert!(w <= nw && h <= nh);
        prop_assert!(w <= mw && h <= mh);
    }

    #[test]
    fn prop_plan_is_idempotent(
        nw in 1u32..=20_000,
        nh in 1u32..=20_000,
        mw in 1u32..=8_000,
        mh in 1u32..=8_000,
    ) {
        let once = plan_dimensions(nw, nh, mw, mh);
        let twice = plan_dimensions(once.0, once.1, mw, mh);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_plan_rounds_derived_side_by_half_a_pixel(
        nw in 1u32..=20_000,
        nh in 1u32..=20_000,
        mw in 1u32..=8_000,
        mh in 1u32..=8_000,
    ) {
        let (w, h) = plan_dimensions(nw, nh, mw, mh);
        let exact_h = w as f64 * nh as f64 / nw as f64;
        let exact_w = h as f64 * nw as f64 / nh as f64;
        // A side whose exact value is under half a pixel is raised to 1
        let raised = (h == 1 && exact_h < 0.5) || (w == 1 && exact_w < 0.5);
        prop_assert!(
            raised || (h as f64 - exact_h).abs() <= 0.5 + 1e-9 || (w as f64 - exact_w).abs() <= 0.5 + 1e-9,
            "{}x{} -> {}x{}", nw, nh, w, h
        );
    }

    // Half a pixel on the short side of a 2:1 or wider image already exceeds
    // 1/min(w, h) in ratio terms, so the ratio bound is checked below 2:1.
    #[test]
    fn prop_plan_preserves_aspect_ratio(
        (nh, nw) in (1u32..=10_000).prop_flat_map(|nh| (Just(nh), (nh / 2 + 1)..=(2 * nh - 1).max(1))),
        mw in 1u32..=8_000,
        mh in 1u32..=8_000,
    ) {
        let (w, h) = plan_dimensions(nw, nh, mw, mh);
        let skew = (w as f64 / h as f64 - nw as f64 / nh as f64).abs();
        prop_assert!(skew < 1.0 / w.min(h) as f64, "{}x{} -> {}x{}", nw, nh, w, h);
    }

    #[test]
    fn prop_controller_terminates_with_monotonic_sizes(
        (quality_ladder, start_quality, entries, phase) in ladder_strategy(),
        (w, h) in (1u32..=400, 1u32..=400),
        max_bytes in 1u64..=200_000,
    ) {
        let config = CompressionConfig::default()
            .with_max_bytes(max_bytes)
            .with_quality_ladder(quality_ladder)
            .with_dimension_ladder(DimensionLadder::new(entries))
            .with_dimension_phase_quality(phase);

        let sizes = Mutex::new(Vec::new());
        let encoder = |_: &WorkingImage, plan: &CompressionPlan| -> EngineResult<Vec<u8>> {
            let size = proportional_size(plan);
            sizes.lock().unwrap().push(size);
            Ok(vec![0; size as usize])
        };

        let start = CompressionPlan::new(w, h, start_quality, OutputFormat::Jpeg);
        let controller = SizeController::new(&encoder, &config);
        let bound = controller.max_attempts(&start);
        let mut log = StepLog::default();
        let outcome = controller.run(&working(w, h), start, &mut log).unwrap();

        let sizes = sizes.into_inner().unwrap();
        prop_assert!(outcome.attempts >= 1);
        prop_assert!(outcome.attempts <= bound);
        prop_assert!(outcome.attempts <= config.max_total_attempts());
        prop_assert_eq!(sizes.len(), outcome.attempts);
        prop_assert!(sizes.windows(2).all(|pair| pair[1] <= pair[0]), "{:?}", sizes);

        // Only the returned attempt may fit; everything before it is over budget
        prop_assert!(sizes[..sizes.len() - 1].iter().all(|&s| s > max_bytes));
        prop_assert_eq!(outcome.budget_met, outcome.attempt.len() <= max_bytes);
        prop_assert_eq!(*sizes.last().unwrap(), outcome.attempt.len());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_report_is_consistent(
        (w, h) in (1u32..=96, 1u32..=96),
        max_bytes in 1u64..=12_000,
        (mw, mh) in (8u32..=128, 8u32..=128),
    ) {
        let encoder = |_: &WorkingImage, plan: &CompressionPlan| -> EngineResult<Vec<u8>> {
            Ok(vec![0; proportional_size(plan) as usize])
        };
        let config = CompressionConfig::default()
            .with_max_bytes(max_bytes)
            .with_envelope(mw, mh)
            .with_dimension_ladder(DimensionLadder::new(vec![(64, 64), (32, 32), (8, 8)]));
        let source = SourceImage::from_bytes(png(w, h), "prop.png", None);

        let report = compress_with_encoder(&source, &config, &encoder).unwrap();

        prop_assert_eq!(report.final_bytes, report.output().len() as u64);
        prop_assert!(report.compression_ratio >= 0.0 && report.compression_ratio <= 1.0);
        prop_assert_eq!(report.budget_met(), report.final_bytes <= report.max_bytes);
        prop_assert!(report.final_width <= report.original_width);
        prop_assert!(report.final_height <= report.original_height);
        prop_assert_eq!(
            report.was_dimension_reduced(),
            (report.final_width, report.final_height) != (report.original_width, report.original_height)
        );
        prop_assert!(report.final_quality <= config.start_quality);
        let attempt_lines = report.steps.iter().filter(|s| s.starts_with("attempt")).count();
        prop_assert_eq!(attempt_lines, report.attempts);
        prop_assert!(report.attempts <= config.max_total_attempts());
    }
}
