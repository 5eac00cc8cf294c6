// src/engine/memory.rs
//
// Byte-weighted backpressure for batch runs.
//
// Each file in a batch holds a permit weighted by its estimated peak
// footprint while it decodes, rasterizes and encodes. The same semaphore with
// unit weights doubles as the counting concurrency permit.

use crate::engine::decoder::ProbedImage;
use crate::ops::{CompressionConfig, OutputFormat};
use image::ImageFormat;
use parking_lot::{Condvar, Mutex};
use std::fs;
use std::sync::Arc;

/// Lower bound for any estimate to avoid zero-ish weights
pub const MIN_ESTIMATE_BYTES: u64 = 24 * 1024 * 1024; // 24MB

/// Budget used when neither the caller nor the cgroup gives one
pub const FALLBACK_MEMORY_BUDGET: u64 = 1536 * 1024 * 1024; // 1.5GB

/// Memory kept back from a detected container limit
const RESERVED_MEMORY: u64 = 64 * 1024 * 1024;

/// Overhead for decode/temporary buffers (heuristic)
const DECODE_OVERHEAD_BYTES: u64 = 8 * 1024 * 1024;

// Decoded bytes per pixel
const BPP_JPEG: u64 = 3;
const BPP_PNG: u64 = 4;
const BPP_WEBP: u64 = 4;
// TIFF is decoded at its native depth before narrowing to 8 bits
const BPP_TIFF: u64 = 8;
const BPP_UNKNOWN: u64 = 4;

/// In-memory weighted semaphore for byte-based backpressure
#[derive(Debug)]
pub struct WeightedSemaphore {
    capacity: u64,
    state: Mutex<u64>, // available units
    cvar: Condvar,
}

#[derive(Debug)]
pub struct Permit {
    sem: Arc<WeightedSemaphore>,
    weight: u64,
}

impl Permit {
    pub fn weight(&self) -> u64 {
        self.weight
    }
}

impl WeightedSemaphore {
    pub fn new(capacity: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(capacity),
            cvar: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn available(&self) -> u64 {
        *self.state.lock()
    }

    /// Block until `weight` units are free. Weights above the capacity are
    /// clamped so an oversized file still runs, alone.
    pub fn acquire(self: &Arc<Self>, weight: u64) -> Permit {
        let mut available = self.state.lock();
        let need = weight.clamp(1, self.capacity);
        while *available < need {
            self.cvar.wait(&mut available);
        }
        *available -= need;
        Permit {
            sem: Arc::clone(self),
            weight: need,
        }
    }

    fn release(&self, weight: u64) {
        let mut available = self.state.lock();
        *available = (*available).saturating_add(weight).min(self.capacity);
        // notify_all: waiters have heterogeneous weights
        self.cvar.notify_all();
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.sem.release(self.weight);
    }
}

fn bytes_for_image(width: u32, height: u32, bytes_per_pixel: u64) -> u64 {
    (width as u64 * height as u64).saturating_mul(bytes_per_pixel)
}

fn decoded_bpp(format: ImageFormat) -> u64 {
    match format {
        ImageFormat::Jpeg => BPP_JPEG,
        ImageFormat::Png => BPP_PNG,
        ImageFormat::WebP => BPP_WEBP,
        ImageFormat::Tiff => BPP_TIFF,
        _ => BPP_UNKNOWN,
    }
}

/// Peak footprint of one run: the decoded source, the rasterized copy at
/// the planned envelope and one encode buffer.
pub fn estimate_run_memory(probed: &ProbedImage, config: &CompressionConfig) -> u64 {
    let (w, h) = probed.oriented_dimensions();
    let decoded = bytes_for_image(w, h, decoded_bpp(probed.format));

    let (pw, ph) = crate::engine::pipeline::plan_dimensions(w, h, config.max_width, config.max_height);
    let raster_bpp = match config.output_format {
        OutputFormat::Jpeg => 3,
        OutputFormat::WebP | OutputFormat::Png => 4,
    };
    let raster = bytes_for_image(pw, ph, raster_bpp);

    decoded
        .saturating_add(raster.saturating_mul(2))
        .saturating_add(DECODE_OVERHEAD_BYTES)
        .max(MIN_ESTIMATE_BYTES)
}

/// Default batch budget: the container limit minus a reserve, else a fixed
/// fallback.
pub fn default_memory_budget() -> u64 {
    match detect_available_memory() {
        Some(limit) => limit.saturating_sub(RESERVED_MEMORY).max(MIN_ESTIMATE_BYTES),
        None => FALLBACK_MEMORY_BUDGET,
    }
}

/// Container memory limit from cgroup v2, then v1.
pub fn detect_available_memory() -> Option<u64> {
    fs::read_to_string("/sys/fs/cgroup/memory.max")
        .ok()
        .and_then(|raw| parse_cgroup_limit(&raw))
        .or_else(|| {
            fs::read_to_string("/sys/fs/cgroup/memory/memory.limit_in_bytes")
                .ok()
                .and_then(|raw| parse_cgroup_limit(&raw))
        })
}

fn parse_cgroup_limit(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed == "max" {
        return None;
    }
    let limit = trimmed.parse::<u64>().ok()?;
    // v1 reports "no limit" as a value near i64::MAX
    if limit > 1_000_000_000_000_000 {
        return None;
    }
    Some(limit)
}
