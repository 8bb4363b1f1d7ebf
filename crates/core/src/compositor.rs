use std::f32::consts::PI;

use ndarray::ArrayView3;
use serde::{Deserialize, Serialize};

use crate::tensor::TensorCodec;
use crate::tile::Tile;
use crate::types::AccumulationBuffer;

/// Shape of the feather ramp across the overlap margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatherMode {
    Linear,
    #[default]
    Cosine,
}

impl FeatherMode {
    #[inline]
    fn profile(self, t: f32) -> f32 {
        match self {
            Self::Linear => t,
            Self::Cosine => 0.5 * (1.0 - (PI * t).cos()),
        }
    }
}

/// Feather weight of a pixel inside a tile's destination rectangle.
///
/// Interior pixels weigh 1.0. Pixels within `margin` output pixels of a
/// border fade toward 0, but only on borders that meet another tile.
/// Borders on the frame edge keep full weight so the frame boundary never
/// darkens.
pub fn feather_weight(
    tile: &Tile,
    local_x: usize,
    local_y: usize,
    margin: usize,
    mode: FeatherMode,
) -> f32 {
    if margin == 0 {
        return 1.0;
    }
    let x_weight = axis_weight(
        local_x,
        tile.dest_width,
        margin,
        tile.is_left_edge,
        tile.is_right_edge,
        mode,
    );
    let y_weight = axis_weight(
        local_y,
        tile.dest_height,
        margin,
        tile.is_top_edge,
        tile.is_bottom_edge,
        mode,
    );
    x_weight * y_weight
}

fn axis_weight(
    coord: usize,
    extent: usize,
    margin: usize,
    low_is_frame_edge: bool,
    high_is_frame_edge: bool,
    mode: FeatherMode,
) -> f32 {
    let mut weight = 1.0_f32;
    if !low_is_frame_edge && coord < margin {
        let t = (coord + 1) as f32 / margin as f32;
        weight = weight.min(mode.profile(t.min(1.0)));
    }
    if !high_is_frame_edge {
        let from_high = extent.saturating_sub(1).saturating_sub(coord);
        if from_high < margin {
            let t = (from_high + 1) as f32 / margin as f32;
            weight = weight.min(mode.profile(t.min(1.0)));
        }
    }
    weight
}

/// Accumulates one processed tile into the frame buffer.
///
/// Each destination pixel samples the neural tensor (nearest-neighbor at
/// `scale_ratio`), optionally mixes it against the baseline upscale of the
/// same rectangle by `blend_weight`, and adds the result weighted by its
/// feather value. Pixels falling outside the buffer are dropped.
#[allow(clippy::too_many_arguments)]
pub fn composite_tile(
    buffer: &mut AccumulationBuffer,
    tile: &Tile,
    neural: &ArrayView3<'_, f32>,
    scale_ratio: f64,
    blend_weight: f32,
    baseline: Option<&[u8]>,
    margin: usize,
    mode: FeatherMode,
) {
    let blend_weight = blend_weight.clamp(0.0, 1.0);

    for local_y in 0..tile.dest_height {
        let out_y = tile.dest_y + local_y;
        if out_y >= buffer.height() {
            break;
        }
        for local_x in 0..tile.dest_width {
            let out_x = tile.dest_x + local_x;
            if out_x >= buffer.width() {
                break;
            }

            let mut rgb = TensorCodec::sample_rgb(neural, local_x, local_y, scale_ratio);
            if blend_weight < 1.0 {
                if let Some(baseline) = baseline {
                    let offset = (local_y * tile.dest_width + local_x) * 3;
                    if offset + 3 <= baseline.len() {
                        for channel in 0..3 {
                            let base = baseline[offset + channel] as f32;
                            rgb[channel] =
                                blend_weight * rgb[channel] + (1.0 - blend_weight) * base;
                        }
                    }
                }
            }

            let feather = feather_weight(tile, local_x, local_y, margin, mode);
            buffer.accumulate(out_x, out_y, feather, rgb);
        }
    }
}
