use anyhow::{Context, Result};
use ndarray::Array3;

use crate::baseline::BaselineResampler;
use crate::tensor::TensorCodec;

/// Fixed tensor geometry a loaded model accepts and produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelShape {
    pub channels: usize,
    pub tile_width: usize,
    pub tile_height: usize,
    /// Upscale factor baked into the model weights. Output tensors are
    /// `native_scale` times the input tile in each axis.
    pub native_scale: usize,
}

impl ModelShape {
    pub fn output_width(&self, input_width: usize) -> usize {
        input_width * self.native_scale
    }

    pub fn output_height(&self, input_height: usize) -> usize {
        input_height * self.native_scale
    }
}

/// The model execution seam. Implementations wrap whatever runtime hosts
/// the network; the engine only sees planar float tensors going in and
/// out.
pub trait InferenceBackend: Send {
    fn name(&self) -> &str;
    fn shape(&self) -> ModelShape;

    /// Runs one tile. Input is `[channels, h, w]` normalized to `[0, 1]`;
    /// the output must be `[3, h * native_scale, w * native_scale]` in the
    /// same value range.
    fn infer(&mut self, tile: &Array3<f32>) -> Result<Array3<f32>>;
}

/// Compute configurations tried when loading a model, most capable first.
/// Recompile variants request a fresh compilation instead of reusing a
/// cached artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    Accelerated,
    AcceleratedRecompiled,
    CpuOnly,
    CpuOnlyRecompiled,
}

impl LoadStrategy {
    pub const DEFAULT_ORDER: [LoadStrategy; 4] = [
        Self::Accelerated,
        Self::AcceleratedRecompiled,
        Self::CpuOnly,
        Self::CpuOnlyRecompiled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accelerated => "accelerated",
            Self::AcceleratedRecompiled => "accelerated-recompiled",
            Self::CpuOnly => "cpu",
            Self::CpuOnlyRecompiled => "cpu-recompiled",
        }
    }
}

/// Tries each strategy in order until one loads. Every failure is logged;
/// only when the whole chain is exhausted does the last error surface.
pub fn load_with_fallback<T>(
    strategies: &[LoadStrategy],
    mut loader: impl FnMut(LoadStrategy) -> Result<T>,
) -> Result<T> {
    let mut last_error = None;
    for &strategy in strategies {
        match loader(strategy) {
            Ok(loaded) => {
                tracing::info!(strategy = strategy.as_str(), "Model loaded");
                return Ok(loaded);
            }
            Err(error) => {
                tracing::warn!(
                    strategy = strategy.as_str(),
                    error = %error,
                    "Model load attempt failed, falling back"
                );
                last_error = Some(error);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| anyhow::anyhow!("no load strategies were attempted"))
        .context("all model load strategies failed"))
}

/// Backend that "infers" by running a conventional resampler. Stands in
/// when no neural model is available and anchors deterministic tests.
pub struct ResampleBackend<R: BaselineResampler> {
    resampler: R,
    shape: ModelShape,
}

impl<R: BaselineResampler> ResampleBackend<R> {
    pub fn new(resampler: R, shape: ModelShape) -> Self {
        Self { resampler, shape }
    }
}

impl<R: BaselineResampler> InferenceBackend for ResampleBackend<R> {
    fn name(&self) -> &str {
        self.resampler.name()
    }

    fn shape(&self) -> ModelShape {
        self.shape
    }

    fn infer(&mut self, tile: &Array3<f32>) -> Result<Array3<f32>> {
        let (_, height, width) = tile.dim();
        let rgb = TensorCodec::decode_region(&tile.view(), width, height, 1.0)
            .context("resample backend could not decode input tile")?;

        let out_width = self.shape.output_width(width);
        let out_height = self.shape.output_height(height);
        let resized = self
            .resampler
            .resize(&rgb, width, height, out_width, out_height);

        let mut output = Array3::<f32>::zeros((3, out_height, out_width));
        for y in 0..out_height {
            for x in 0..out_width {
                let offset = (y * out_width + x) * 3;
                for channel in 0..3 {
                    output[[channel, y, x]] = resized[offset + channel] as f32 / 255.0;
                }
            }
        }
        Ok(output)
    }
}
