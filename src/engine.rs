// src/engine.rs
//
// The core of squeeze-image. An adaptive compression pipeline that:
// 1. Probes the source and normalizes containers the encoder cannot take
// 2. Fits the raster into the pixel envelope
// 3. Walks a quality ladder, then a dimension ladder, until the output fits
//    the byte budget or the ladders run out
//
// This file is a facade over the modules in engine/

// =============================================================================
// SECURITY LIMITS
// =============================================================================

/// Maximum allowed image dimension (width or height).
/// Images larger than 32768x32768 are rejected to prevent decompression bombs.
pub const MAX_DIMENSION: u32 = 32768;

/// Maximum allowed total pixels (width * height).
/// 100 megapixels = 400MB uncompressed RGBA. Beyond this is likely malicious.
pub const MAX_PIXELS: u64 = 100_000_000;

// =============================================================================
// MODULE DECOMPOSITION
// =============================================================================

mod api;
mod batch;
mod common;
mod controller;
mod decoder;
mod encoder;
mod firewall;
mod io;
mod memory;
mod normalize;
mod pipeline;
mod pool;
mod report;

pub use api::{compress, compress_bytes, compress_with_encoder};
pub use batch::{compress_batch, compress_batch_with_encoder, BatchOptions, BatchResult};
pub use common::{run_with_panic_policy, EngineResult};
pub use controller::{EncodedAttempt, SearchOutcome, SearchPhase, SizeController};
pub use decoder::{
    apply_orientation, check_dimensions, classify, decode_image, detect_format, probe,
    DetectedBy, FormatClass, ProbedImage,
};
pub use encoder::{
    encode_jpeg, encode_png, encode_webp, NativeEncoder, Provenance, QualitySettings,
    RasterEncoder, WorkingImage,
};
pub use firewall::{FirewallConfig, FirewallPolicy};
pub use io::{extract_icc_profile, SourceImage};
pub use memory::{estimate_run_memory, Permit, WeightedSemaphore};
pub use normalize::{normalize, NormalizedImage};
pub use pipeline::{fast_resize, plan_dimensions};
pub use pool::MAX_CONCURRENCY;
pub use report::{compression_ratio, CompressionReport, ReportBuilder, ReportFlags, StepLog};
