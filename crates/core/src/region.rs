use serde::{Deserialize, Serialize};

use crate::types::Frame;

/// Per-cell content statistics from frame analysis, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegionMaskSample {
    pub edge: f32,
    pub noise: f32,
    pub block: f32,
    pub band: f32,
    pub text: f32,
}

/// Coarse grid of content masks over a frame. Tiles look up the cell under
/// their center to decide how aggressively neural output may be trusted.
#[derive(Debug, Clone)]
pub struct RegionMaskGrid {
    width: usize,
    height: usize,
    cells: Vec<RegionMaskSample>,
}

impl RegionMaskGrid {
    pub fn new(width: usize, height: usize, cells: Vec<RegionMaskSample>) -> Self {
        debug_assert_eq!(cells.len(), width * height);
        Self {
            width,
            height,
            cells,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Looks up the cell under normalized coordinates. Coordinates outside
    /// `[0, 1]` are clamped, so callers may pass tile centers that round
    /// past the frame border.
    pub fn sample(&self, norm_x: f64, norm_y: f64) -> RegionMaskSample {
        if self.cells.is_empty() {
            return RegionMaskSample::default();
        }
        let x = ((norm_x.clamp(0.0, 1.0) * self.width as f64) as usize).min(self.width - 1);
        let y = ((norm_y.clamp(0.0, 1.0) * self.height as f64) as usize).min(self.height - 1);
        self.cells[y * self.width + x]
    }

    /// Analyzes luma statistics over a sparse pixel lattice and bins them
    /// into a coarse cell grid.
    ///
    /// Heuristics per cell: `edge` tracks mean gradient magnitude, `noise`
    /// mean high-pass energy, `block` gradient energy landing on 8-pixel
    /// boundaries, `band` the fraction of near-flat pixels, `text` the
    /// fraction of hard edges at readable brightness.
    pub fn analyze(frame: &Frame) -> Self {
        let grid_width = (frame.width / 16).clamp(8, 48).min(frame.width.max(1));
        let grid_height = (frame.height / 16).clamp(8, 48).min(frame.height.max(1));

        if frame.width < 3 || frame.height < 3 {
            return Self::new(
                grid_width,
                grid_height,
                vec![RegionMaskSample::default(); grid_width * grid_height],
            );
        }

        let luma: Vec<f32> = (0..frame.width * frame.height)
            .map(|pixel| {
                let offset = pixel * 3;
                0.299 * frame.data[offset] as f32
                    + 0.587 * frame.data[offset + 1] as f32
                    + 0.114 * frame.data[offset + 2] as f32
            })
            .collect();
        let luma_at = |x: usize, y: usize| luma[y * frame.width + x];

        #[derive(Default, Clone, Copy)]
        struct CellAccum {
            grad_sum: f32,
            highpass_sum: f32,
            block_sum: f32,
            flat_count: u32,
            text_count: u32,
            count: u32,
        }
        let mut accums = vec![CellAccum::default(); grid_width * grid_height];

        let mut y = 1;
        while y + 1 < frame.height {
            let cell_y = (y * grid_height / frame.height).min(grid_height - 1);
            let mut x = 1;
            while x + 1 < frame.width {
                let center = luma_at(x, y);
                let grad =
                    (luma_at(x + 1, y) - center).abs() + (luma_at(x, y + 1) - center).abs();
                let neighbor_mean = (luma_at(x - 1, y)
                    + luma_at(x + 1, y)
                    + luma_at(x, y - 1)
                    + luma_at(x, y + 1))
                    / 4.0;
                let highpass = (center - neighbor_mean).abs();

                let cell_x = (x * grid_width / frame.width).min(grid_width - 1);
                let accum = &mut accums[cell_y * grid_width + cell_x];
                accum.grad_sum += grad;
                accum.highpass_sum += highpass;
                if x % 8 == 0 || y % 8 == 0 {
                    accum.block_sum += grad;
                }
                if grad < 1.5 {
                    accum.flat_count += 1;
                }
                if grad > 24.0 && center > 32.0 && center < 224.0 {
                    accum.text_count += 1;
                }
                accum.count += 1;

                x += 2;
            }
            y += 2;
        }

        let cells = accums
            .into_iter()
            .map(|accum| {
                if accum.count == 0 {
                    return RegionMaskSample::default();
                }
                let count = accum.count as f32;
                RegionMaskSample {
                    edge: (accum.grad_sum / count / 64.0).clamp(0.0, 1.0),
                    noise: (accum.highpass_sum / count / 24.0).clamp(0.0, 1.0),
                    block: (accum.block_sum / count / 48.0).clamp(0.0, 1.0),
                    band: (accum.flat_count as f32 / count).clamp(0.0, 1.0),
                    text: (0.5 * accum.text_count as f32 / count).clamp(0.0, 1.0),
                }
            })
            .collect();

        Self::new(grid_width, grid_height, cells)
    }
}

/// Turns a mask sample into a blend weight. Noisy, blocky, banded or texty
/// regions pull neural output down; strong edges earn some of it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionWeighterConfig {
    pub enabled: bool,
    pub weight_floor: f32,
}

impl Default for RegionWeighterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weight_floor: 0.55,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegionWeighter {
    config: RegionWeighterConfig,
}

impl RegionWeighter {
    pub fn new(config: RegionWeighterConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn weight_for(&self, sample: &RegionMaskSample) -> f32 {
        if !self.config.enabled {
            return 1.0;
        }
        let weight = 1.0 - 0.22 * sample.noise - 0.20 * sample.block - 0.15 * sample.band
            - 0.12 * sample.text
            + 0.12 * sample.edge;
        weight.clamp(self.config.weight_floor, 1.0)
    }
}

/// Both safety systems derate independently; the stricter one wins.
#[inline]
pub fn combine_weights(drift_weight: f32, region_weight: f32) -> f32 {
    drift_weight.min(region_weight)
}
