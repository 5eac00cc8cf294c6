// lib.rs
//
// squeeze-image: adaptive image compression and format normalization for
// uploads.
//
// Given an arbitrary upload, produce an encoded image that fits a byte
// budget and a pixel envelope with the least quality loss the ladders
// allow, and report exactly what was done to get there.

// Memory allocator optimization - jemalloc for large decode/encode buffers
// Note: jemalloc is not supported on Windows/MSVC, so we exclude it on that platform
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod engine;
pub mod error;
pub mod ops;

pub use engine::{
    compress, compress_batch, compress_bytes, compress_with_encoder, BatchOptions, BatchResult,
    CompressionReport, FirewallConfig, FirewallPolicy, NativeEncoder, RasterEncoder,
    SourceImage,
};
pub use error::{CompressError, ErrorCategory, FailureStage, Result};
pub use ops::{CompressionConfig, CompressionPlan, DimensionLadder, OutputFormat, Quality, QualityLadder};

/// Get library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Containers accepted as input (TIFF is normalized before encoding)
pub fn supported_input_formats() -> &'static [&'static str] {
    &["jpeg", "jpg", "png", "webp", "gif", "bmp", "tiff", "tif"]
}

/// Containers the pipeline can emit
pub fn supported_output_formats() -> &'static [&'static str] {
    &["jpeg", "jpg", "webp", "png"]
}
