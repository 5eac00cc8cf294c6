#![no_main]

//! Full pipeline on arbitrary bytes and budgets. Either an error or a report
//! whose numbers agree with its output.

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use squeeze_image::engine::SourceImage;
use squeeze_image::{compress, compress_bytes, CompressionConfig, FirewallConfig, OutputFormat};

#[derive(Arbitrary, Debug)]
struct Input {
    max_bytes: u32,
    max_width: u16,
    max_height: u16,
    quality: u8,
    webp: bool,
    data: Vec<u8>,
}

fuzz_target!(|input: Input| {
    // Keep decoded rasters small so each run stays fast
    let firewall = FirewallConfig::custom().with_max_pixels(4_000_000);
    let config = CompressionConfig::default()
        .with_max_bytes(input.max_bytes as u64)
        .with_envelope(input.max_width as u32, input.max_height as u32)
        .with_output_format(if input.webp { OutputFormat::WebP } else { OutputFormat::Jpeg })
        .with_firewall(firewall);

    let source = SourceImage::from_bytes(input.data.clone(), "fuzz", None);
    if let Ok(report) = compress(&source, &config) {
        assert_eq!(report.final_bytes, report.output().len() as u64);
        assert_eq!(report.budget_met(), report.final_bytes <= report.max_bytes);
        assert!(report.final_width <= report.original_width);
        assert!(report.final_height <= report.original_height);
        assert!(report.attempts <= config.max_total_attempts());
    }

    let _ = compress_bytes(
        input.data,
        "fuzz.jpg",
        Some("image/jpeg"),
        input.max_bytes as u64,
        input.max_width as u32,
        input.max_height as u32,
        input.quality as f32,
    );
});
