// src/engine/report.rs
//
// Compression report: the one immutable result of a run.
// Pure aggregation over the source facts and the controller outcome.

use crate::engine::controller::SearchOutcome;
use crate::ops::{OutputFormat, Quality};
use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Outcome flags of a run.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ReportFlags: u8 {
        /// Output container differs from the source (always set for TIFF)
        const FORMAT_CONVERTED  = 0b0001;
        /// Final pixel dimensions are smaller than the source
        const DIMENSION_REDUCED = 0b0010;
        /// Final quality is below the requested start quality
        const QUALITY_REDUCED   = 0b0100;
        /// Output fits the byte budget
        const BUDGET_MET        = 0b1000;
    }
}

/// Ordered, human-readable log of what a run did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepLog {
    entries: Vec<String>,
}

impl StepLog {
    pub fn push(&mut self, entry: impl Into<String>) {
        self.entries.push(entry.into());
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.entries
    }
}

impl fmt::Display for StepLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}. {entry}", i + 1)?;
        }
        Ok(())
    }
}

/// `(original - final) / original`, or 0 when nothing was saved.
pub fn compression_ratio(original_bytes: u64, final_bytes: u64) -> f64 {
    if original_bytes == 0 || final_bytes >= original_bytes {
        return 0.0;
    }
    (original_bytes - final_bytes) as f64 / original_bytes as f64
}

/// Result of one compression run.
#[derive(Clone, Debug)]
pub struct CompressionReport {
    pub original_bytes: u64,
    pub final_bytes: u64,
    pub compression_ratio: f64,
    /// Source dimensions after EXIF orientation
    pub original_width: u32,
    pub original_height: u32,
    pub final_width: u32,
    pub final_height: u32,
    pub final_quality: Quality,
    pub final_format: OutputFormat,
    /// Detected source container, e.g. "tiff"
    pub source_format: &'static str,
    pub max_bytes: u64,
    pub attempts: usize,
    pub steps: Vec<String>,
    flags: ReportFlags,
    output: Vec<u8>,
    output_file_name: String,
}

impl CompressionReport {
    pub fn flags(&self) -> ReportFlags {
        self.flags
    }

    pub fn was_format_converted(&self) -> bool {
        self.flags.contains(ReportFlags::FORMAT_CONVERTED)
    }

    pub fn was_dimension_reduced(&self) -> bool {
        self.flags.contains(ReportFlags::DIMENSION_REDUCED)
    }

    pub fn was_quality_reduced(&self) -> bool {
        self.flags.contains(ReportFlags::QUALITY_REDUCED)
    }

    pub fn budget_met(&self) -> bool {
        self.flags.contains(ReportFlags::BUDGET_MET)
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn into_output(self) -> Vec<u8> {
        self.output
    }

    pub fn mime_type(&self) -> &'static str {
        self.final_format.mime_type()
    }

    /// Declared file name with the extension swapped for the output format.
    pub fn output_file_name(&self) -> &str {
        &self.output_file_name
    }

    /// End-user text for an upload form. Never conflated with the decode
    /// failure message.
    pub fn user_message(&self) -> &'static str {
        if self.budget_met() {
            "Image is ready to upload."
        } else {
            "This image was compressed but is still larger than allowed."
        }
    }
}

/// Facts about the source gathered before the controller runs.
#[derive(Clone, Debug)]
pub struct ReportBuilder {
    original_bytes: u64,
    source_format: &'static str,
    normalized: bool,
    original_dimensions: (u32, u32),
    start_quality: Quality,
    max_bytes: u64,
    declared_name: String,
}

impl ReportBuilder {
    pub fn new(original_bytes: u64, source_format: &'static str, declared_name: &str) -> Self {
        Self {
            original_bytes,
            source_format,
            normalized: false,
            original_dimensions: (0, 0),
            start_quality: Quality::MAX,
            max_bytes: 0,
            declared_name: declared_name.to_string(),
        }
    }

    pub fn normalized(mut self, normalized: bool) -> Self {
        self.normalized = normalized;
        self
    }

    pub fn original_dimensions(mut self, width: u32, height: u32) -> Self {
        self.original_dimensions = (width, height);
        self
    }

    pub fn start_quality(mut self, quality: Quality) -> Self {
        self.start_quality = quality;
        self
    }

    pub fn max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn build(self, outcome: SearchOutcome, log: StepLog) -> CompressionReport {
        let plan = outcome.attempt.plan;
        let final_bytes = outcome.attempt.len();
        let (original_width, original_height) = self.original_dimensions;

        let mut flags = ReportFlags::empty();
        flags.set(
            ReportFlags::FORMAT_CONVERTED,
            self.normalized || !same_container(self.source_format, plan.format),
        );
        flags.set(
            ReportFlags::DIMENSION_REDUCED,
            plan.width < original_width || plan.height < original_height,
        );
        flags.set(
            ReportFlags::QUALITY_REDUCED,
            plan.format.uses_quality() && plan.quality < self.start_quality,
        );
        flags.set(ReportFlags::BUDGET_MET, final_bytes <= self.max_bytes);

        CompressionReport {
            original_bytes: self.original_bytes,
            final_bytes,
            compression_ratio: compression_ratio(self.original_bytes, final_bytes),
            original_width,
            original_height,
            final_width: plan.width,
            final_height: plan.height,
            final_quality: plan.quality,
            final_format: plan.format,
            source_format: self.source_format,
            max_bytes: self.max_bytes,
            attempts: outcome.attempts,
            steps: log.into_vec(),
            flags,
            output_file_name: output_file_name(&self.declared_name, plan.format),
            output: outcome.attempt.bytes,
        }
    }
}

fn same_container(source_format: &str, output: OutputFormat) -> bool {
    match output {
        OutputFormat::Jpeg => matches!(source_format, "jpg" | "jpeg"),
        OutputFormat::WebP => source_format == "webp",
        OutputFormat::Png => source_format == "png",
    }
}

/// `IMG_0001.tif` -> `IMG_0001.jpg`; an empty name becomes `image.<ext>`.
pub fn output_file_name(declared_name: &str, format: OutputFormat) -> String {
    let stem = std::path::Path::new(declared_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "image".to_string());
    format!("{stem}.{}", format.extension())
}
