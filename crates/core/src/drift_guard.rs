use ndarray::ArrayView3;
use serde::{Deserialize, Serialize};

use crate::tensor::TensorCodec;

/// Thresholds for the statistical comparison between neural output and the
/// conventional baseline upscale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftGuardConfig {
    pub enabled: bool,
    /// Lowest blend weight the guard may assign.
    pub weight_floor: f32,
    /// Mean luma difference above which the drift penalty applies.
    pub luma_drift_threshold: f32,
    pub luma_drift_penalty: f32,
    /// High-frequency energy ratio above which the over-sharpening penalty
    /// ramps in.
    pub hf_ratio_threshold: f32,
    pub hf_penalty_gain: f32,
    pub hf_penalty_cap: f32,
}

impl Default for DriftGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weight_floor: 0.55,
            luma_drift_threshold: 6.0,
            luma_drift_penalty: 0.15,
            hf_ratio_threshold: 1.20,
            hf_penalty_gain: 0.4,
            hf_penalty_cap: 0.35,
        }
    }
}

/// Outcome of a drift evaluation: how much neural output to keep, and an
/// optional human-readable note when the guard intervened.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendDecision {
    pub weight: f32,
    pub note: Option<String>,
}

impl BlendDecision {
    pub fn pass_through() -> Self {
        Self {
            weight: 1.0,
            note: None,
        }
    }
}

/// Compares neural tile output against the baseline upscale on a sparse
/// pixel grid and derates the blend weight when the neural result drifts
/// in brightness or over-sharpens.
#[derive(Debug, Clone)]
pub struct DriftGuard {
    config: DriftGuardConfig,
}

impl DriftGuard {
    pub fn new(config: DriftGuardConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Evaluates over the tile's destination rectangle. `baseline` is the
    /// already-upscaled conventional image for the same rectangle,
    /// interleaved RGB at `target_width` x `target_height`; `scale_ratio` is
    /// output pixels per neural tensor pixel.
    pub fn evaluate(
        &self,
        neural: &ArrayView3<'_, f32>,
        baseline: &[u8],
        target_width: usize,
        target_height: usize,
        scale_ratio: f64,
    ) -> BlendDecision {
        if !self.config.enabled {
            return BlendDecision::pass_through();
        }
        if target_width < 3
            || target_height < 3
            || baseline.len() < target_width * target_height * 3
        {
            return BlendDecision::pass_through();
        }

        let step = (target_width / 64).clamp(2, 8);

        let mut neural_luma_sum = 0.0_f64;
        let mut baseline_luma_sum = 0.0_f64;
        let mut neural_hf_sum = 0.0_f64;
        let mut baseline_hf_sum = 0.0_f64;
        let mut samples = 0_u64;

        let mut y = 1;
        while y + 1 < target_height {
            let mut x = 1;
            while x + 1 < target_width {
                let neural_luma = neural_luma_at(neural, x, y, scale_ratio);
                let neural_right = neural_luma_at(neural, x + 1, y, scale_ratio);
                let neural_below = neural_luma_at(neural, x, y + 1, scale_ratio);

                let base_luma = baseline_luma_at(baseline, target_width, x, y);
                let base_right = baseline_luma_at(baseline, target_width, x + 1, y);
                let base_below = baseline_luma_at(baseline, target_width, x, y + 1);

                neural_luma_sum += neural_luma as f64;
                baseline_luma_sum += base_luma as f64;
                neural_hf_sum +=
                    ((neural_right - neural_luma).abs() + (neural_below - neural_luma).abs()) as f64;
                baseline_hf_sum +=
                    ((base_right - base_luma).abs() + (base_below - base_luma).abs()) as f64;
                samples += 1;

                x += step;
            }
            y += step;
        }

        if samples == 0 {
            return BlendDecision::pass_through();
        }

        let luma_drift =
            ((neural_luma_sum - baseline_luma_sum) / samples as f64).abs() as f32;
        let neural_hf_mean = neural_hf_sum / samples as f64;
        let baseline_hf_mean = baseline_hf_sum / samples as f64;
        let hf_ratio = (neural_hf_mean / baseline_hf_mean.max(1.0)) as f32;

        let mut weight = 1.0_f32;
        if luma_drift > self.config.luma_drift_threshold {
            weight -= self.config.luma_drift_penalty;
        }
        if hf_ratio > self.config.hf_ratio_threshold {
            let penalty = ((hf_ratio - self.config.hf_ratio_threshold)
                * self.config.hf_penalty_gain)
                .min(self.config.hf_penalty_cap);
            weight -= penalty;
        }
        weight = weight.clamp(self.config.weight_floor, 1.0);

        let note = if weight < 0.98 {
            Some(format!(
                "drift guard: luma_drift={luma_drift:.2} hf_ratio={hf_ratio:.2} weight={weight:.2}"
            ))
        } else {
            None
        };

        BlendDecision { weight, note }
    }
}

/// Rec.601 luma.
#[inline]
fn luma(rgb: [f32; 3]) -> f32 {
    0.299 * rgb[0] + 0.587 * rgb[1] + 0.114 * rgb[2]
}

#[inline]
fn neural_luma_at(tensor: &ArrayView3<'_, f32>, x: usize, y: usize, scale_ratio: f64) -> f32 {
    luma(TensorCodec::sample_rgb(tensor, x, y, scale_ratio))
}

#[inline]
fn baseline_luma_at(baseline: &[u8], width: usize, x: usize, y: usize) -> f32 {
    let offset = (y * width + x) * 3;
    luma([
        baseline[offset] as f32,
        baseline[offset + 1] as f32,
        baseline[offset + 2] as f32,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn flat_tensor(width: usize, height: usize, value: f32) -> Array3<f32> {
        Array3::from_elem((3, height, width), value)
    }

    fn flat_baseline(width: usize, height: usize, value: u8) -> Vec<u8> {
        vec![value; width * height * 3]
    }

    #[test]
    fn disabled_guard_passes_through() {
        let guard = DriftGuard::new(DriftGuardConfig {
            enabled: false,
            ..Default::default()
        });
        let tensor = flat_tensor(8, 8, 1.0);
        let baseline = flat_baseline(8, 8, 0);

        let decision = guard.evaluate(&tensor.view(), &baseline, 8, 8, 1.0);
        assert_eq!(decision, BlendDecision::pass_through());
    }

    #[test]
    fn identical_images_keep_full_weight_without_note() {
        let guard = DriftGuard::new(DriftGuardConfig::default());
        let tensor = flat_tensor(64, 64, 0.5);
        let baseline = flat_baseline(64, 64, 128);

        let decision = guard.evaluate(&tensor.view(), &baseline, 64, 64, 1.0);
        assert_eq!(decision.weight, 1.0);
        assert!(decision.note.is_none());
    }

    #[test]
    fn brightness_drift_triggers_penalty_and_note() {
        let guard = DriftGuard::new(DriftGuardConfig::default());
        // Neural output ~76 luma brighter than baseline.
        let tensor = flat_tensor(64, 64, 0.8);
        let baseline = flat_baseline(64, 64, 128);

        let decision = guard.evaluate(&tensor.view(), &baseline, 64, 64, 1.0);
        assert!((decision.weight - 0.85).abs() < 1e-4);
        assert!(decision.note.is_some());
    }

    #[test]
    fn penalties_combine_per_threshold_formula() {
        // Reproduce the reference point: drift 8.0 and hf ratio 1.35 must
        // derate the blend to 0.79.
        let config = DriftGuardConfig::default();
        let mut weight = 1.0_f32;
        let drift = 8.0_f32;
        let hf_ratio = 1.35_f32;

        if drift > config.luma_drift_threshold {
            weight -= config.luma_drift_penalty;
        }
        if hf_ratio > config.hf_ratio_threshold {
            weight -= ((hf_ratio - config.hf_ratio_threshold) * config.hf_penalty_gain)
                .min(config.hf_penalty_cap);
        }
        weight = weight.clamp(config.weight_floor, 1.0);

        assert!((weight - 0.79).abs() < 1e-4);
    }

    #[test]
    fn weight_never_falls_below_floor() {
        let guard = DriftGuard::new(DriftGuardConfig::default());
        // Checkerboard neural output over a flat baseline maximizes both
        // drift and high-frequency energy.
        let mut tensor = flat_tensor(64, 64, 0.0);
        for y in 0..64 {
            for x in 0..64 {
                if (x + y) % 2 == 0 {
                    for channel in 0..3 {
                        tensor[[channel, y, x]] = 1.0;
                    }
                }
            }
        }
        let baseline = flat_baseline(64, 64, 200);

        let decision = guard.evaluate(&tensor.view(), &baseline, 64, 64, 1.0);
        assert!(decision.weight >= 0.55);
        assert!(decision.weight < 1.0);
    }

    #[test]
    fn tiny_targets_pass_through() {
        let guard = DriftGuard::new(DriftGuardConfig::default());
        let tensor = flat_tensor(2, 2, 1.0);
        let baseline = flat_baseline(2, 2, 0);

        let decision = guard.evaluate(&tensor.view(), &baseline, 2, 2, 1.0);
        assert_eq!(decision.weight, 1.0);
    }
}
