use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::Frame;

/// Post-filter slots in their fixed execution order. Installing filters in
/// any order always runs them in this sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PostStage {
    UnpremultiplyAlpha,
    LinearizeColor,
    ToneMap,
    MedianPrefilter,
    Denoise,
    Deband,
    DebandDither,
    Sharpen,
    SharpenExtra,
    Dehalo,
    MoireSuppress,
    TemporalSmooth,
    EncodeDisplay,
    GammaBlend,
    PremultiplyAlpha,
}

/// A whole-frame filter. `original` is the frame as it entered the
/// pipeline, before any stage ran; blend-type filters mix against it.
pub trait FrameFilter: Send {
    fn name(&self) -> &'static str;
    fn apply(&mut self, frame: Frame, original: &Frame) -> Result<Frame>;
}

/// Ordered chain of post filters. The orchestrator runs a frame through
/// the chain exactly once, after tile composition has been normalized.
pub struct PostFilterPipeline {
    stages: Vec<(PostStage, Box<dyn FrameFilter>)>,
}

impl Default for PostFilterPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl PostFilterPipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Installs a filter in its slot. Each slot holds at most one filter.
    pub fn install(
        &mut self,
        stage: PostStage,
        filter: Box<dyn FrameFilter>,
    ) -> Result<(), EngineError> {
        if self.stages.iter().any(|(existing, _)| *existing == stage) {
            return Err(EngineError::invalid_configuration(format!(
                "post-filter stage {stage:?} is already installed"
            )));
        }
        let position = self
            .stages
            .partition_point(|(existing, _)| *existing < stage);
        self.stages.insert(position, (stage, filter));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|(_, filter)| filter.name()).collect()
    }

    /// Runs the frame through every installed stage in order. The input
    /// frame is preserved once as the `original` reference for blend
    /// filters.
    pub fn apply(&mut self, frame: Frame) -> Result<Frame> {
        if self.stages.is_empty() {
            return Ok(frame);
        }
        let original = frame.clone();
        let timestamp = frame.timestamp;
        let mut current = frame;
        for (_, filter) in &mut self.stages {
            current = filter.apply(current, &original)?;
        }
        current.timestamp = timestamp;
        Ok(current)
    }
}

/// Which sharpening kernel runs in the `Sharpen` slot. The methods are
/// mutually exclusive; the optional extra pass reuses the selected method
/// at reduced strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharpenMethod {
    #[default]
    Off,
    Unsharp,
    Luma,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostFilterConfig {
    pub median_prefilter: bool,
    /// 0.0 disables denoising; 1.0 is a full 3x3 box blur.
    pub denoise_strength: f32,
    pub deband: bool,
    /// Adds an ordered-dither second deband pass.
    pub deband_dither: bool,
    pub deband_threshold: f32,
    pub sharpen_method: SharpenMethod,
    pub sharpen_amount: f32,
    pub sharpen_extra_pass: bool,
    /// 0.0 disables temporal smoothing; higher values weigh the previous
    /// output frame more.
    pub temporal_smoothing: f32,
    /// Fraction of the unfiltered frame mixed back in at the end of the
    /// chain. 0.0 keeps the fully filtered result.
    pub gamma_blend_mix: f32,
}

impl Default for PostFilterConfig {
    fn default() -> Self {
        Self {
            median_prefilter: false,
            denoise_strength: 0.0,
            deband: false,
            deband_dither: false,
            deband_threshold: 4.0,
            sharpen_method: SharpenMethod::Off,
            sharpen_amount: 0.4,
            sharpen_extra_pass: false,
            temporal_smoothing: 0.0,
            gamma_blend_mix: 0.0,
        }
    }
}

impl PostFilterConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        for (name, value) in [
            ("denoise_strength", self.denoise_strength),
            ("temporal_smoothing", self.temporal_smoothing),
            ("gamma_blend_mix", self.gamma_blend_mix),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::invalid_configuration(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.sharpen_amount < 0.0 {
            return Err(EngineError::invalid_configuration(format!(
                "sharpen_amount must be non-negative, got {}",
                self.sharpen_amount
            )));
        }
        if self.sharpen_extra_pass && self.sharpen_method == SharpenMethod::Off {
            return Err(EngineError::invalid_configuration(
                "sharpen_extra_pass requires a sharpen method",
            ));
        }
        Ok(())
    }

    /// Builds a pipeline from the built-in CPU filters this config enables.
    /// Callers may install additional filters into the remaining slots
    /// before handing the pipeline to the orchestrator.
    pub fn build_pipeline(&self) -> Result<PostFilterPipeline, EngineError> {
        self.validate()?;
        let mut pipeline = PostFilterPipeline::new();

        if self.median_prefilter {
            pipeline.install(PostStage::MedianPrefilter, Box::new(MedianFilter))?;
        }
        if self.denoise_strength > 0.0 {
            pipeline.install(
                PostStage::Denoise,
                Box::new(BoxDenoiseFilter {
                    strength: self.denoise_strength,
                }),
            )?;
        }
        if self.deband {
            pipeline.install(
                PostStage::Deband,
                Box::new(DebandFilter {
                    threshold: self.deband_threshold,
                    dither: false,
                }),
            )?;
            if self.deband_dither {
                pipeline.install(
                    PostStage::DebandDither,
                    Box::new(DebandFilter {
                        threshold: self.deband_threshold,
                        dither: true,
                    }),
                )?;
            }
        }
        if self.sharpen_method != SharpenMethod::Off && self.sharpen_amount > 0.0 {
            pipeline.install(
                PostStage::Sharpen,
                Box::new(SharpenFilter {
                    method: self.sharpen_method,
                    amount: self.sharpen_amount,
                }),
            )?;
            if self.sharpen_extra_pass {
                pipeline.install(
                    PostStage::SharpenExtra,
                    Box::new(SharpenFilter {
                        method: self.sharpen_method,
                        amount: self.sharpen_amount * 0.5,
                    }),
                )?;
            }
        }
        if self.temporal_smoothing > 0.0 {
            pipeline.install(
                PostStage::TemporalSmooth,
                Box::new(TemporalSmoothFilter {
                    strength: self.temporal_smoothing,
                    previous: None,
                }),
            )?;
        }
        if self.gamma_blend_mix > 0.0 {
            pipeline.install(
                PostStage::GammaBlend,
                Box::new(GammaBlendFilter {
                    mix: self.gamma_blend_mix,
                }),
            )?;
        }

        Ok(pipeline)
    }
}

/// 3x3 median, run per channel. Kills isolated hot pixels before the
/// softer filters see them.
struct MedianFilter;

impl FrameFilter for MedianFilter {
    fn name(&self) -> &'static str {
        "median_prefilter"
    }

    fn apply(&mut self, frame: Frame, _original: &Frame) -> Result<Frame> {
        if frame.width < 3 || frame.height < 3 {
            return Ok(frame);
        }
        let mut out = frame.data.clone();
        for y in 1..frame.height - 1 {
            for x in 1..frame.width - 1 {
                for channel in 0..3 {
                    let mut window = [0_u8; 9];
                    let mut cursor = 0;
                    for dy in 0..3 {
                        for dx in 0..3 {
                            let offset = ((y + dy - 1) * frame.width + (x + dx - 1)) * 3 + channel;
                            window[cursor] = frame.data[offset];
                            cursor += 1;
                        }
                    }
                    window.sort_unstable();
                    out[(y * frame.width + x) * 3 + channel] = window[4];
                }
            }
        }
        Ok(Frame {
            data: out,
            ..frame
        })
    }
}

/// 3x3 box blur mixed with the input by `strength`.
struct BoxDenoiseFilter {
    strength: f32,
}

impl FrameFilter for BoxDenoiseFilter {
    fn name(&self) -> &'static str {
        "denoise"
    }

    fn apply(&mut self, frame: Frame, _original: &Frame) -> Result<Frame> {
        if frame.width < 3 || frame.height < 3 {
            return Ok(frame);
        }
        let mut out = frame.data.clone();
        for y in 1..frame.height - 1 {
            for x in 1..frame.width - 1 {
                for channel in 0..3 {
                    let mut sum = 0.0_f32;
                    for dy in 0..3 {
                        for dx in 0..3 {
                            let offset = ((y + dy - 1) * frame.width + (x + dx - 1)) * 3 + channel;
                            sum += frame.data[offset] as f32;
                        }
                    }
                    let blurred = sum / 9.0;
                    let offset = (y * frame.width + x) * 3 + channel;
                    let source = frame.data[offset] as f32;
                    let mixed = source + self.strength * (blurred - source);
                    out[offset] = mixed.clamp(0.0, 255.0).round() as u8;
                }
            }
        }
        Ok(Frame {
            data: out,
            ..frame
        })
    }
}

/// Averages near-flat neighborhoods to break up quantization banding.
/// The dithered pass additionally applies a small ordered offset so the
/// smoothed gradient does not re-quantize into new bands.
struct DebandFilter {
    threshold: f32,
    dither: bool,
}

const DITHER_PATTERN: [[f32; 4]; 4] = [
    [-0.5, 0.0, -0.375, 0.125],
    [0.25, -0.25, 0.375, -0.125],
    [-0.3125, 0.1875, -0.4375, 0.0625],
    [0.4375, -0.0625, 0.3125, -0.1875],
];

impl FrameFilter for DebandFilter {
    fn name(&self) -> &'static str {
        if self.dither {
            "deband_dither"
        } else {
            "deband"
        }
    }

    fn apply(&mut self, frame: Frame, _original: &Frame) -> Result<Frame> {
        if frame.width < 5 || frame.height < 5 {
            return Ok(frame);
        }
        let mut out = frame.data.clone();
        for y in 2..frame.height - 2 {
            for x in 2..frame.width - 2 {
                for channel in 0..3 {
                    let center = frame.data[(y * frame.width + x) * 3 + channel] as f32;
                    let mut sum = 0.0_f32;
                    let mut min = f32::MAX;
                    let mut max = f32::MIN;
                    for dy in 0..5 {
                        for dx in 0..5 {
                            let offset = ((y + dy - 2) * frame.width + (x + dx - 2)) * 3 + channel;
                            let value = frame.data[offset] as f32;
                            sum += value;
                            min = min.min(value);
                            max = max.max(value);
                        }
                    }
                    if max - min > self.threshold {
                        continue;
                    }
                    let mut smoothed = sum / 25.0;
                    if self.dither {
                        smoothed += DITHER_PATTERN[y % 4][x % 4];
                    }
                    out[(y * frame.width + x) * 3 + channel] =
                        smoothed.clamp(0.0, 255.0).round() as u8;
                }
            }
        }
        Ok(Frame {
            data: out,
            ..frame
        })
    }
}

/// Unsharp mask. `Luma` restricts the sharpening delta to the pixel's
/// luminance so chroma fringing does not amplify.
struct SharpenFilter {
    method: SharpenMethod,
    amount: f32,
}

impl FrameFilter for SharpenFilter {
    fn name(&self) -> &'static str {
        match self.method {
            SharpenMethod::Off => "sharpen_off",
            SharpenMethod::Unsharp => "sharpen_unsharp",
            SharpenMethod::Luma => "sharpen_luma",
        }
    }

    fn apply(&mut self, frame: Frame, _original: &Frame) -> Result<Frame> {
        if self.method == SharpenMethod::Off || frame.width < 3 || frame.height < 3 {
            return Ok(frame);
        }
        let mut out = frame.data.clone();
        for y in 1..frame.height - 1 {
            for x in 1..frame.width - 1 {
                let mut deltas = [0.0_f32; 3];
                for (channel, delta) in deltas.iter_mut().enumerate() {
                    let mut sum = 0.0_f32;
                    for dy in 0..3 {
                        for dx in 0..3 {
                            let offset = ((y + dy - 1) * frame.width + (x + dx - 1)) * 3 + channel;
                            sum += frame.data[offset] as f32;
                        }
                    }
                    let center = frame.data[(y * frame.width + x) * 3 + channel] as f32;
                    *delta = center - sum / 9.0;
                }

                if self.method == SharpenMethod::Luma {
                    let luma_delta = 0.299 * deltas[0] + 0.587 * deltas[1] + 0.114 * deltas[2];
                    deltas = [luma_delta; 3];
                }

                for channel in 0..3 {
                    let offset = (y * frame.width + x) * 3 + channel;
                    let value = frame.data[offset] as f32 + self.amount * deltas[channel];
                    out[offset] = value.clamp(0.0, 255.0).round() as u8;
                }
            }
        }
        Ok(Frame {
            data: out,
            ..frame
        })
    }
}

/// Exponential blend against the previous output frame. Resets whenever
/// the frame geometry changes.
struct TemporalSmoothFilter {
    strength: f32,
    previous: Option<Frame>,
}

impl FrameFilter for TemporalSmoothFilter {
    fn name(&self) -> &'static str {
        "temporal_smooth"
    }

    fn apply(&mut self, frame: Frame, _original: &Frame) -> Result<Frame> {
        let smoothed = match &self.previous {
            Some(previous)
                if previous.width == frame.width && previous.height == frame.height =>
            {
                let mut data = frame.data.clone();
                for (out, (&current, &prior)) in data
                    .iter_mut()
                    .zip(frame.data.iter().zip(previous.data.iter()))
                {
                    let mixed = (1.0 - self.strength) * current as f32
                        + self.strength * prior as f32;
                    *out = mixed.clamp(0.0, 255.0).round() as u8;
                }
                Frame { data, ..frame }
            }
            _ => frame,
        };
        self.previous = Some(smoothed.clone());
        Ok(smoothed)
    }
}

/// Mixes a fraction of the unfiltered frame back in, in gamma space.
struct GammaBlendFilter {
    mix: f32,
}

impl FrameFilter for GammaBlendFilter {
    fn name(&self) -> &'static str {
        "gamma_blend"
    }

    fn apply(&mut self, frame: Frame, original: &Frame) -> Result<Frame> {
        if original.width != frame.width || original.height != frame.height {
            return Ok(frame);
        }
        let mut data = frame.data.clone();
        for (out, (&filtered, &source)) in data
            .iter_mut()
            .zip(frame.data.iter().zip(original.data.iter()))
        {
            let mixed = (1.0 - self.mix) * filtered as f32 + self.mix * source as f32;
            *out = mixed.clamp(0.0, 255.0).round() as u8;
        }
        Ok(Frame { data, ..frame })
    }
}
