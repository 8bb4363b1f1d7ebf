use std::time::Instant;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::backend::InferenceBackend;
use crate::baseline::BaselineResampler;
use crate::compositor::{composite_tile, FeatherMode};
use crate::config::EngineConfig;
use crate::drift_guard::{BlendDecision, DriftGuard};
use crate::error::EngineError;
use crate::post_filter::PostFilterPipeline;
use crate::region::{combine_weights, RegionMaskGrid, RegionWeighter};
use crate::tensor::TensorCodec;
use crate::tile::{Tile, TileGrid};
use crate::types::{AccumulationBuffer, Frame};

/// Consumer of finished frames. `write_frame` may block for backpressure;
/// the orchestrator will not start the next frame until it returns.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Lifecycle of the per-frame pipeline. Mostly useful for logging and for
/// asserting where a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Decoding,
    Tiling,
    Normalizing,
    PostFiltering,
    Emitting,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_in: u64,
    pub frames_emitted: u64,
    pub tiles_processed: u64,
    /// Tiles skipped after a tile-scoped extraction or inference failure.
    pub tiles_failed: u64,
    /// Tiles whose blend weight was derated below 1.0 by the drift guard
    /// or region weighting.
    pub tiles_guarded: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunSummary),
    Cancelled(RunSummary),
}

struct TileOutcome {
    blend_weight: f32,
}

/// Drives frames through tiling, inference, guarded composition and the
/// post-filter chain, then hands them to the sink in source order.
///
/// Frames are processed strictly sequentially, so stateful post filters
/// observe frames in display order.
pub struct FrameOrchestrator {
    config: EngineConfig,
    backend: Box<dyn InferenceBackend>,
    baseline: Box<dyn BaselineResampler>,
    drift_guard: DriftGuard,
    region_weighter: RegionWeighter,
    post_filter: PostFilterPipeline,
    cancel: CancellationToken,
    state: EngineState,
}

impl FrameOrchestrator {
    pub fn new(
        config: EngineConfig,
        backend: Box<dyn InferenceBackend>,
        baseline: Box<dyn BaselineResampler>,
        post_filter: PostFilterPipeline,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        config.validate(&backend.shape())?;
        let drift_guard = DriftGuard::new(config.drift_guard.clone());
        let region_weighter = RegionWeighter::new(config.region.clone());
        Ok(Self {
            config,
            backend,
            baseline,
            drift_guard,
            region_weighter,
            post_filter,
            cancel,
            state: EngineState::Idle,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    fn set_state(&mut self, state: EngineState) {
        tracing::trace!(from = ?self.state, to = ?state, "Engine state transition");
        self.state = state;
    }

    /// Pulls frames from `source` until it is exhausted, the run fails, or
    /// the cancellation token fires. A cancelled frame is discarded, never
    /// emitted half-composited.
    pub fn run<D, S>(&mut self, source: D, mut sink: S) -> Result<RunOutcome, EngineError>
    where
        D: IntoIterator<Item = Result<Frame>>,
        S: FrameSink,
    {
        let mut summary = RunSummary::default();
        let started = Instant::now();
        let mut total_infer_ms = 0.0_f64;
        let mut total_composite_ms = 0.0_f64;

        self.set_state(EngineState::Decoding);
        for frame_result in source {
            if self.cancel.is_cancelled() {
                return self.finish_cancelled(summary);
            }

            let frame = match frame_result {
                Ok(frame) => frame,
                Err(error) => {
                    self.set_state(EngineState::Failed);
                    return Err(EngineError::SourceFailed(error));
                }
            };
            summary.frames_in += 1;

            let processed = match self.process_frame(
                frame,
                &mut summary,
                &mut total_infer_ms,
                &mut total_composite_ms,
            ) {
                Ok(processed) => processed,
                Err(error) => {
                    self.set_state(EngineState::Failed);
                    return Err(error);
                }
            };

            let Some(processed) = processed else {
                return self.finish_cancelled(summary);
            };

            if self.cancel.is_cancelled() {
                return self.finish_cancelled(summary);
            }

            self.set_state(EngineState::Emitting);
            if let Err(error) = sink.write_frame(&processed) {
                self.set_state(EngineState::Failed);
                return Err(EngineError::SinkFailed(error));
            }
            summary.frames_emitted += 1;
            self.set_state(EngineState::Decoding);
        }

        if let Err(error) = sink.finish() {
            self.set_state(EngineState::Failed);
            return Err(EngineError::SinkFailed(error));
        }

        self.set_state(EngineState::Idle);
        if summary.frames_emitted > 0 {
            tracing::info!(
                frames = summary.frames_emitted,
                tiles = summary.tiles_processed,
                tiles_failed = summary.tiles_failed,
                tiles_guarded = summary.tiles_guarded,
                total_infer_ms = format!("{total_infer_ms:.0}"),
                total_composite_ms = format!("{total_composite_ms:.0}"),
                elapsed_ms = format!("{:.0}", started.elapsed().as_secs_f64() * 1000.0),
                "Upscale run summary"
            );
        }
        Ok(RunOutcome::Completed(summary))
    }

    fn finish_cancelled(&mut self, summary: RunSummary) -> Result<RunOutcome, EngineError> {
        self.set_state(EngineState::Cancelled);
        tracing::info!(
            frames_emitted = summary.frames_emitted,
            "Upscale run cancelled"
        );
        Ok(RunOutcome::Cancelled(summary))
    }

    /// Returns `Ok(None)` when cancellation interrupted the tile loop.
    fn process_frame(
        &mut self,
        frame: Frame,
        summary: &mut RunSummary,
        total_infer_ms: &mut f64,
        total_composite_ms: &mut f64,
    ) -> Result<Option<Frame>, EngineError> {
        let shape = self.backend.shape();
        let user_scale = self.config.scaling.user_scale_factor;
        let scale_ratio = user_scale / shape.native_scale as f64;
        let margin = self.config.tiling.effective_feather_margin(user_scale);
        let mode = self.config.tiling.feather_mode;

        self.set_state(EngineState::Tiling);
        let grid = TileGrid::compute(
            frame.width,
            frame.height,
            shape.tile_width,
            shape.tile_height,
            self.config.tiling.overlap,
            user_scale,
        )?;

        let out_width = (frame.width as f64 * user_scale).floor() as usize;
        let out_height = (frame.height as f64 * user_scale).floor() as usize;
        let mut buffer = AccumulationBuffer::allocate(out_width, out_height)?;

        let region_grid = self
            .region_weighter
            .is_enabled()
            .then(|| RegionMaskGrid::analyze(&frame));

        let mut frame_tiles_failed = 0_u64;
        for tile in &grid.tiles {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            let tile_started = Instant::now();
            match self.process_tile(
                &frame,
                tile,
                &mut buffer,
                region_grid.as_ref(),
                scale_ratio,
                margin,
                mode,
            ) {
                Ok(outcome) => {
                    summary.tiles_processed += 1;
                    if outcome.blend_weight < 1.0 {
                        summary.tiles_guarded += 1;
                    }
                }
                Err(error) if error.is_tile_scoped() => {
                    frame_tiles_failed += 1;
                    summary.tiles_failed += 1;
                    tracing::warn!(
                        source_x = tile.source_x,
                        source_y = tile.source_y,
                        error = %error,
                        "Tile skipped"
                    );
                }
                Err(error) => return Err(error),
            }
            *total_infer_ms += tile_started.elapsed().as_secs_f64() * 1000.0;
        }

        if frame_tiles_failed > 0 {
            tracing::debug!(
                tiles_failed = frame_tiles_failed,
                tiles = grid.tiles.len(),
                "Frame finished with skipped tiles"
            );
        }

        self.set_state(EngineState::Normalizing);
        let composite_started = Instant::now();
        let normalized = buffer.normalize().with_timestamp(frame.timestamp);
        *total_composite_ms += composite_started.elapsed().as_secs_f64() * 1000.0;

        self.set_state(EngineState::PostFiltering);
        let filtered = self
            .post_filter
            .apply(normalized)
            .map_err(EngineError::PostFilterFailed)?;

        Ok(Some(filtered))
    }

    #[allow(clippy::too_many_arguments)]
    fn process_tile(
        &mut self,
        frame: &Frame,
        tile: &Tile,
        buffer: &mut AccumulationBuffer,
        region_grid: Option<&RegionMaskGrid>,
        scale_ratio: f64,
        margin: usize,
        mode: FeatherMode,
    ) -> Result<TileOutcome, EngineError> {
        let shape = self.backend.shape();
        let tensor = TensorCodec::encode_tile(frame, tile, shape.channels)?;
        let output = self
            .backend
            .infer(&tensor)
            .map_err(|error| EngineError::inference(format!("{error:#}")))?;

        let (out_channels, out_height, out_width) = output.dim();
        if out_channels < 3 || out_height == 0 || out_width == 0 {
            return Err(EngineError::inference(format!(
                "backend produced unusable tensor shape [{out_channels}, {out_height}, {out_width}]"
            )));
        }

        let region_weight = match region_grid {
            Some(grid) => {
                let center_x = (tile.source_x as f64 + tile.source_width as f64 / 2.0)
                    / frame.width as f64;
                let center_y = (tile.source_y as f64 + tile.source_height as f64 / 2.0)
                    / frame.height as f64;
                self.region_weighter
                    .weight_for(&grid.sample(center_x, center_y))
            }
            None => 1.0,
        };

        let needs_baseline = self.drift_guard.is_enabled() || region_weight < 1.0;
        let baseline = needs_baseline.then(|| {
            let source = extract_tile_rgb(frame, tile);
            self.baseline.resize(
                &source,
                tile.source_width,
                tile.source_height,
                tile.dest_width,
                tile.dest_height,
            )
        });

        let decision = match (&baseline, self.drift_guard.is_enabled()) {
            (Some(baseline), true) => self.drift_guard.evaluate(
                &output.view(),
                baseline,
                tile.dest_width,
                tile.dest_height,
                scale_ratio,
            ),
            _ => BlendDecision::pass_through(),
        };

        if let Some(note) = &decision.note {
            tracing::debug!(
                source_x = tile.source_x,
                source_y = tile.source_y,
                "{note}"
            );
        }

        let blend_weight = combine_weights(decision.weight, region_weight);
        composite_tile(
            buffer,
            tile,
            &output.view(),
            scale_ratio,
            blend_weight,
            baseline.as_deref(),
            margin,
            mode,
        );

        Ok(TileOutcome { blend_weight })
    }
}

fn extract_tile_rgb(frame: &Frame, tile: &Tile) -> Vec<u8> {
    let mut rgb = vec![0_u8; tile.source_width * tile.source_height * 3];
    for y in 0..tile.source_height {
        let src_offset = ((tile.source_y + y) * frame.width + tile.source_x) * 3;
        let dst_offset = y * tile.source_width * 3;
        rgb[dst_offset..dst_offset + tile.source_width * 3]
            .copy_from_slice(&frame.data[src_offset..src_offset + tile.source_width * 3]);
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ModelShape, ResampleBackend};
    use crate::baseline::{BicubicResampler, NearestResampler};
    use anyhow::bail;
    use ndarray::Array3;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSinkState {
        frames: Arc<Mutex<Vec<Frame>>>,
        finished: Arc<Mutex<bool>>,
    }

    impl SharedSinkState {
        fn frames(&self) -> Vec<Frame> {
            self.frames.lock().expect("frames mutex").clone()
        }

        fn finished(&self) -> bool {
            *self.finished.lock().expect("finished mutex")
        }
    }

    struct CollectingSink {
        state: SharedSinkState,
        fail_write: bool,
    }

    impl CollectingSink {
        fn new(state: SharedSinkState) -> Self {
            Self {
                state,
                fail_write: false,
            }
        }
    }

    impl FrameSink for CollectingSink {
        fn write_frame(&mut self, frame: &Frame) -> Result<()> {
            if self.fail_write {
                bail!("sink rejected frame");
            }
            self.state
                .frames
                .lock()
                .expect("frames mutex")
                .push(frame.clone());
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            *self.state.finished.lock().expect("finished mutex") = true;
            Ok(())
        }
    }

    /// Backend that ignores its input and emits a constant-color tensor.
    struct FlatBackend {
        shape: ModelShape,
        value: f32,
    }

    impl InferenceBackend for FlatBackend {
        fn name(&self) -> &str {
            "flat"
        }

        fn shape(&self) -> ModelShape {
            self.shape
        }

        fn infer(&mut self, tile: &Array3<f32>) -> Result<Array3<f32>> {
            let (_, height, width) = tile.dim();
            Ok(Array3::from_elem(
                (
                    3,
                    height * self.shape.native_scale,
                    width * self.shape.native_scale,
                ),
                self.value,
            ))
        }
    }

    /// Backend that fails on selected tile invocations.
    struct FlakyBackend {
        inner: ResampleBackend<NearestResampler>,
        calls: usize,
        fail_on: Vec<usize>,
    }

    impl InferenceBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        fn shape(&self) -> ModelShape {
            self.inner.shape()
        }

        fn infer(&mut self, tile: &Array3<f32>) -> Result<Array3<f32>> {
            let call = self.calls;
            self.calls += 1;
            if self.fail_on.contains(&call) {
                bail!("injected inference failure on call {call}");
            }
            self.inner.infer(tile)
        }
    }

    fn small_shape() -> ModelShape {
        ModelShape {
            channels: 3,
            tile_width: 32,
            tile_height: 32,
            native_scale: 2,
        }
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.tiling.overlap = 8;
        config
    }

    fn orchestrator_with_backend(
        config: EngineConfig,
        backend: Box<dyn InferenceBackend>,
        cancel: CancellationToken,
    ) -> FrameOrchestrator {
        FrameOrchestrator::new(
            config,
            backend,
            Box::new(BicubicResampler),
            PostFilterPipeline::new(),
            cancel,
        )
        .expect("orchestrator")
    }

    fn flat_frame(width: usize, height: usize, value: u8) -> Frame {
        Frame::new(vec![value; width * height * 3], width, height).expect("frame")
    }

    #[test]
    fn run_upscales_flat_frames_without_artifacts() {
        let backend = ResampleBackend::new(NearestResampler, small_shape());
        let mut orchestrator = orchestrator_with_backend(
            test_config(),
            Box::new(backend),
            CancellationToken::new(),
        );

        let state = SharedSinkState::default();
        let source = vec![Ok(flat_frame(64, 48, 120)), Ok(flat_frame(64, 48, 120))];
        let outcome = orchestrator
            .run(source, CollectingSink::new(state.clone()))
            .expect("run");

        let RunOutcome::Completed(summary) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(summary.frames_in, 2);
        assert_eq!(summary.frames_emitted, 2);
        assert_eq!(summary.tiles_failed, 0);
        assert!(state.finished());
        assert_eq!(orchestrator.state(), EngineState::Idle);

        let frames = state.frames();
        assert_eq!(frames.len(), 2);
        for frame in &frames {
            assert_eq!((frame.width, frame.height), (128, 96));
            assert!(
                frame.data.iter().all(|&value| value == 120),
                "flat input must stay flat through tiling and blending"
            );
        }
    }

    #[test]
    fn pre_cancelled_token_emits_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let backend = ResampleBackend::new(NearestResampler, small_shape());
        let mut orchestrator =
            orchestrator_with_backend(test_config(), Box::new(backend), cancel);

        let state = SharedSinkState::default();
        let source = vec![Ok(flat_frame(64, 48, 120))];
        let outcome = orchestrator
            .run(source, CollectingSink::new(state.clone()))
            .expect("run");

        assert!(matches!(outcome, RunOutcome::Cancelled(_)));
        assert!(state.frames().is_empty());
        assert!(!state.finished());
        assert_eq!(orchestrator.state(), EngineState::Cancelled);
    }

    #[test]
    fn tile_failures_skip_without_aborting_the_frame() {
        let backend = FlakyBackend {
            inner: ResampleBackend::new(NearestResampler, small_shape()),
            calls: 0,
            fail_on: vec![1],
        };
        let mut orchestrator = orchestrator_with_backend(
            test_config(),
            Box::new(backend),
            CancellationToken::new(),
        );

        let state = SharedSinkState::default();
        let source = vec![Ok(flat_frame(64, 48, 120))];
        let outcome = orchestrator
            .run(source, CollectingSink::new(state.clone()))
            .expect("run");

        let RunOutcome::Completed(summary) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(summary.frames_emitted, 1);
        assert_eq!(summary.tiles_failed, 1);
        assert!(summary.tiles_processed > 0);
        assert_eq!(state.frames().len(), 1);
    }

    #[test]
    fn source_error_fails_the_run() {
        let backend = ResampleBackend::new(NearestResampler, small_shape());
        let mut orchestrator = orchestrator_with_backend(
            test_config(),
            Box::new(backend),
            CancellationToken::new(),
        );

        let state = SharedSinkState::default();
        let source: Vec<Result<Frame>> = vec![Err(anyhow::anyhow!("decode failed"))];
        let result = orchestrator.run(source, CollectingSink::new(state));

        assert!(matches!(result, Err(EngineError::SourceFailed(_))));
        assert_eq!(orchestrator.state(), EngineState::Failed);
    }

    #[test]
    fn sink_error_fails_the_run() {
        let backend = ResampleBackend::new(NearestResampler, small_shape());
        let mut orchestrator = orchestrator_with_backend(
            test_config(),
            Box::new(backend),
            CancellationToken::new(),
        );

        let state = SharedSinkState::default();
        let mut sink = CollectingSink::new(state);
        sink.fail_write = true;
        let source = vec![Ok(flat_frame(64, 48, 120))];
        let result = orchestrator.run(source, sink);

        assert!(matches!(result, Err(EngineError::SinkFailed(_))));
        assert_eq!(orchestrator.state(), EngineState::Failed);
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let mut config = EngineConfig::default();
        config.tiling.overlap = 32;
        let backend = ResampleBackend::new(NearestResampler, small_shape());

        let result = FrameOrchestrator::new(
            config,
            Box::new(backend),
            Box::new(BicubicResampler),
            PostFilterPipeline::new(),
            CancellationToken::new(),
        );
        assert!(matches!(
            result,
            Err(EngineError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn drift_guard_blends_runaway_output_toward_baseline() {
        let mut config = test_config();
        config.region.enabled = false;

        // Backend claims every tile is pure white over a dark source.
        let backend = FlatBackend {
            shape: small_shape(),
            value: 1.0,
        };
        let mut orchestrator =
            orchestrator_with_backend(config, Box::new(backend), CancellationToken::new());

        let state = SharedSinkState::default();
        let source = vec![Ok(flat_frame(64, 48, 20))];
        let outcome = orchestrator
            .run(source, CollectingSink::new(state.clone()))
            .expect("run");

        let RunOutcome::Completed(summary) = outcome else {
            panic!("expected completion");
        };
        assert!(summary.tiles_guarded > 0);

        // weight 0.85 after the luma drift penalty: 0.85*255 + 0.15*20.
        let frames = state.frames();
        let pixel = frames[0].pixel(64, 48);
        assert_eq!(pixel, [220, 220, 220]);
    }

    #[test]
    fn timestamps_survive_the_pipeline() {
        let backend = ResampleBackend::new(NearestResampler, small_shape());
        let mut orchestrator = orchestrator_with_backend(
            test_config(),
            Box::new(backend),
            CancellationToken::new(),
        );

        let state = SharedSinkState::default();
        let timestamp = std::time::Duration::from_millis(40);
        let frame = flat_frame(64, 48, 120).with_timestamp(Some(timestamp));
        orchestrator
            .run(vec![Ok(frame)], CollectingSink::new(state.clone()))
            .expect("run");

        assert_eq!(state.frames()[0].timestamp, Some(timestamp));
    }
}
