// src/engine/controller.rs
//
// Iterative size-reduction controller.
//
// QualitySearch -> DimensionSearch -> Done. Every encode happens in one of
// the two search states; the total is bounded by
// `quality rungs + dimension ladder entries`, so the loop always terminates.
// An oversized final attempt is a normal outcome, not an error.

use crate::engine::common::EngineResult;
use crate::engine::encoder::{RasterEncoder, WorkingImage};
use crate::engine::pipeline::{plan_dimensions, shrinks};
use crate::engine::report::StepLog;
use crate::error::CompressError;
use crate::ops::{CompressionConfig, CompressionPlan, DimensionLadder, OutputFormat, Quality, QualityLadder};

/// One encoder output and the plan that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedAttempt {
    pub bytes: Vec<u8>,
    pub plan: CompressionPlan,
}

impl EncodedAttempt {
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn format(&self) -> OutputFormat {
        self.plan.format
    }

    pub fn fits(&self, max_bytes: u64) -> bool {
        self.len() <= max_bytes
    }
}

/// Search phase the controller finished in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchPhase {
    QualitySearch,
    DimensionSearch,
}

#[derive(Clone, Debug)]
pub struct SearchOutcome {
    /// First in-budget attempt, or the last (smallest) one
    pub attempt: EncodedAttempt,
    pub attempts: usize,
    pub budget_met: bool,
    pub ended_in: SearchPhase,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    QualitySearch { rung: usize },
    DimensionSearch { entry: usize, quality: Quality },
    Done { budget_met: bool, ended_in: SearchPhase },
}

/// Drives an injected encoder down the quality ladder, then the dimension
/// ladder, until an attempt fits `max_bytes` or both ladders are exhausted.
pub struct SizeController<'a, E: RasterEncoder + ?Sized> {
    encoder: &'a E,
    max_bytes: u64,
    quality_ladder: &'a QualityLadder,
    dimension_ladder: &'a DimensionLadder,
    dimension_phase_quality: Quality,
}

impl<'a, E: RasterEncoder + ?Sized> SizeController<'a, E> {
    pub fn new(encoder: &'a E, config: &'a CompressionConfig) -> Self {
        Self {
            encoder,
            max_bytes: config.max_bytes,
            quality_ladder: &config.quality_ladder,
            dimension_ladder: &config.dimension_ladder,
            dimension_phase_quality: config.dimension_phase_quality,
        }
    }

    /// Upper bound on encode calls for a given start plan.
    pub fn max_attempts(&self, start: &CompressionPlan) -> usize {
        self.quality_rungs(start).len() + self.dimension_ladder.len()
    }

    fn quality_rungs(&self, start: &CompressionPlan) -> Vec<Quality> {
        if start.format.uses_quality() {
            self.quality_ladder.rungs(start.quality)
        } else {
            // Lossless output: quality has no effect, one attempt is enough
            vec![start.quality]
        }
    }

    /// Run the search. `working` must already be at the start plan's size.
    /// Encoder errors abort the run immediately.
    pub fn run(
        &self,
        working: &WorkingImage,
        start: CompressionPlan,
        log: &mut StepLog,
    ) -> EngineResult<SearchOutcome> {
        let rungs = self.quality_rungs(&start);
        let mut attempts = 0usize;
        let mut last: Option<EncodedAttempt> = None;
        let mut state = State::QualitySearch { rung: 0 };

        loop {
            state = match state {
                State::QualitySearch { rung } => {
                    let plan = start.with_quality(rungs[rung]);
                    let attempt = self.attempt(working, plan, &mut attempts, log)?;
                    let fits = attempt.fits(self.max_bytes);
                    last = Some(attempt);

                    if fits {
                        State::Done {
                            budget_met: true,
                            ended_in: SearchPhase::QualitySearch,
                        }
                    } else if rung + 1 < rungs.len() {
                        State::QualitySearch { rung: rung + 1 }
                    } else {
                        let floor_reached = rungs[rung];
                        let quality = self.dimension_phase_quality.min(floor_reached);
                        tracing::debug!(
                            quality = quality.get(),
                            entries = self.dimension_ladder.len(),
                            "quality ladder exhausted, entering dimension search"
                        );
                        if !self.dimension_ladder.is_empty() {
                            log.push(format!(
                                "quality ladder exhausted at q{floor_reached}; \
                                 reducing dimensions at q{quality}"
                            ));
                        }
                        State::DimensionSearch { entry: 0, quality }
                    }
                }

                State::DimensionSearch { entry, quality } => match self
                    .dimension_ladder
                    .entries()
                    .get(entry)
                {
                    None => {
                        log.push("dimension ladder exhausted");
                        tracing::debug!("dimension ladder exhausted");
                        State::Done {
                            budget_met: false,
                            ended_in: SearchPhase::DimensionSearch,
                        }
                    }
                    Some(&(max_w, max_h)) => {
                        let previous = last
                            .as_ref()
                            .map(|a| (a.plan.width, a.plan.height))
                            .unwrap_or_else(|| working.dimensions());
                        let (width, height) =
                            plan_dimensions(working.width(), working.height(), max_w, max_h);

                        if !shrinks(previous, (width, height)) {
                            log.push(format!(
                                "skipped ladder entry {max_w}x{max_h}: would not shrink {}x{}",
                                previous.0, previous.1
                            ));
                            tracing::debug!(max_w, max_h, "ladder entry does not shrink, skipped");
                            State::DimensionSearch {
                                entry: entry + 1,
                                quality,
                            }
                        } else {
                            let rasterized = self.encoder.rasterize(working, width, height)?;
                            let plan = CompressionPlan::new(width, height, quality, start.format);
                            let attempt = self.attempt(&rasterized, plan, &mut attempts, log)?;
                            let fits = attempt.fits(self.max_bytes);
                            last = Some(attempt);

                            if fits {
                                State::Done {
                                    budget_met: true,
                                    ended_in: SearchPhase::DimensionSearch,
                                }
                            } else {
                                State::DimensionSearch {
                                    entry: entry + 1,
                                    quality,
                                }
                            }
                        }
                    }
                },

                State::Done {
                    budget_met,
                    ended_in,
                } => {
                    let attempt = last.ok_or_else(|| {
                        CompressError::internal_panic("size controller finished without an attempt")
                    })?;
                    return Ok(SearchOutcome {
                        attempt,
                        attempts,
                        budget_met,
                        ended_in,
                    });
                }
            };
        }
    }

    fn attempt(
        &self,
        working: &WorkingImage,
        plan: CompressionPlan,
        attempts: &mut usize,
        log: &mut StepLog,
    ) -> EngineResult<EncodedAttempt> {
        let bytes = self.encoder.encode(working, &plan)?;
        *attempts += 1;
        let attempt = EncodedAttempt { bytes, plan };
        let fits = attempt.fits(self.max_bytes);

        tracing::debug!(
            attempt = *attempts,
            width = plan.width,
            height = plan.height,
            quality = plan.quality.get(),
            format = plan.format.as_str(),
            bytes = attempt.len(),
            max_bytes = self.max_bytes,
            fits,
            "encode attempt"
        );
        log.push(format!(
            "attempt {}: {plan} -> {} bytes ({})",
            *attempts,
            attempt.len(),
            if fits { "within budget" } else { "over budget" }
        ));

        Ok(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::encoder::Provenance;
    use image::{DynamicImage, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn working(width: u32, height: u32) -> WorkingImage {
        WorkingImage::new(
            Arc::new(DynamicImage::ImageRgb8(RgbImage::new(width, height))),
            Provenance::Original,
        )
    }

    /// Output size = pixels * quality / 100, so sizes fall with both ladders.
    fn sized_encoder(working: &WorkingImage, plan: &CompressionPlan) -> EngineResult<Vec<u8>> {
        let _ = working;
        let len = plan.pixel_count() * plan.quality.get() as u64 / 100;
        Ok(vec![0u8; len as usize])
    }

    fn config(max_bytes: u64) -> CompressionConfig {
        CompressionConfig::default()
            .with_max_bytes(max_bytes)
            .with_quality_ladder(QualityLadder::new(10, Quality::new(55), 5))
            .with_dimension_ladder(DimensionLadder::new(vec![(80, 80), (40, 40), (20, 20)]))
            .with_dimension_phase_quality(Quality::new(70))
    }

    fn start(width: u32, height: u32) -> CompressionPlan {
        CompressionPlan::new(width, height, Quality::new(85), OutputFormat::Jpeg)
    }

    #[test]
    fn first_attempt_within_budget_stops_immediately() {
        let cfg = config(1_000_000);
        let controller = SizeController::new(&sized_encoder, &cfg);
        let mut log = StepLog::default();
        let outcome = controller.run(&working(100, 100), start(100, 100), &mut log).unwrap();

        assert!(outcome.budget_met);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.ended_in, SearchPhase::QualitySearch);
        assert_eq!(outcome.attempt.plan.quality, Quality::new(85));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn quality_search_steps_down_until_it_fits() {
        // 100x100: q85 -> 8500, q75 -> 7500, q65 -> 6500
        let cfg = config(7000);
        let controller = SizeController::new(&sized_encoder, &cfg);
        let mut log = StepLog::default();
        let outcome = controller.run(&working(100, 100), start(100, 100), &mut log).unwrap();

        assert!(outcome.budget_met);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.attempt.plan.quality, Quality::new(65));
        assert_eq!(outcome.attempt.len(), 6500);
    }

    #[test]
    fn dimension_search_after_quality_floor() {
        // Quality floor 55 -> 5500 bytes; 80x80 @ q55 -> 3520
        let cfg = config(4000);
        let controller = SizeController::new(&sized_encoder, &cfg);
        let mut log = StepLog::default();
        let outcome = controller.run(&working(100, 100), start(100, 100), &mut log).unwrap();

        assert!(outcome.budget_met);
        assert_eq!(outcome.ended_in, SearchPhase::DimensionSearch);
        assert_eq!(outcome.attempts, 4 + 1);
        assert_eq!((outcome.attempt.plan.width, outcome.attempt.plan.height), (80, 80));
        // Phase quality 70 is capped at the floor the quality search ended on
        assert_eq!(outcome.attempt.plan.quality, Quality::new(55));
    }

    #[test]
    fn unsatisfiable_budget_returns_smallest_attempt() {
        let cfg = config(1);
        let controller = SizeController::new(&sized_encoder, &cfg);
        let mut log = StepLog::default();
        let outcome = controller.run(&working(100, 100), start(100, 100), &mut log).unwrap();

        assert!(!outcome.budget_met);
        assert_eq!(outcome.attempts, controller.max_attempts(&start(100, 100)));
        assert_eq!((outcome.attempt.plan.width, outcome.attempt.plan.height), (20, 20));
        assert!(log.entries().last().unwrap().contains("exhausted"));
    }

    #[test]
    fn entries_that_do_not_shrink_are_skipped() {
        let cfg = config(1).with_dimension_ladder(DimensionLadder::new(vec![
            (4000, 4000),
            (100, 100),
            (50, 50),
        ]));
        let calls = AtomicUsize::new(0);
        let counting = |w: &WorkingImage, plan: &CompressionPlan| -> EngineResult<Vec<u8>> {
            calls.fetch_add(1, Ordering::SeqCst);
            sized_encoder(w, plan)
        };
        let controller = SizeController::new(&counting, &cfg);
        let mut log = StepLog::default();
        let outcome = controller.run(&working(100, 100), start(100, 100), &mut log).unwrap();

        // 4 quality rungs + only the 50x50 entry
        assert_eq!(outcome.attempts, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            log.entries().iter().filter(|l| l.starts_with("skipped")).count(),
            2
        );
    }

    #[test]
    fn lossless_output_skips_the_quality_ladder() {
        let cfg = config(1);
        let controller = SizeController::new(&sized_encoder, &cfg);
        let png = CompressionPlan::new(100, 100, Quality::new(85), OutputFormat::Png);
        let mut log = StepLog::default();
        let outcome = controller.run(&working(100, 100), png, &mut log).unwrap();
        assert_eq!(outcome.attempts, 1 + 3);
        assert_eq!(outcome.attempt.format(), OutputFormat::Png);
    }

    #[test]
    fn encoder_errors_abort_the_run() {
        let cfg = config(1);
        let failing = |_: &WorkingImage, plan: &CompressionPlan| -> EngineResult<Vec<u8>> {
            if plan.quality < Quality::new(80) {
                Err(CompressError::encode_failed("jpeg", "boom"))
            } else {
                Ok(vec![0; 1000])
            }
        };
        let controller = SizeController::new(&failing, &cfg);
        let mut log = StepLog::default();
        let err = controller.run(&working(100, 100), start(100, 100), &mut log).unwrap_err();
        assert!(matches!(err, CompressError::EncodeFailed { .. }));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn attempt_sizes_never_increase() {
        let cfg = config(1);
        let sizes = std::sync::Mutex::new(Vec::new());
        let recording = |w: &WorkingImage, plan: &CompressionPlan| -> EngineResult<Vec<u8>> {
            let out = sized_encoder(w, plan)?;
            sizes.lock().unwrap().push(out.len());
            Ok(out)
        };
        let controller = SizeController::new(&recording, &cfg);
        let mut log = StepLog::default();
        controller.run(&working(100, 100), start(100, 100), &mut log).unwrap();
        let sizes = sizes.into_inner().unwrap();
        assert!(sizes.windows(2).all(|pair| pair[1] <= pair[0]), "{sizes:?}");
    }
}
