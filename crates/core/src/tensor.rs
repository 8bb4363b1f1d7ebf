use ndarray::{Array3, ArrayView3};

use crate::error::EngineError;
use crate::tile::Tile;
use crate::types::Frame;

/// Converts between interleaved 8-bit RGB and the planar float tensors the
/// inference backend consumes and produces. Tensor layout is `[C, H, W]`
/// with values normalized to `[0, 1]`.
pub struct TensorCodec;

impl TensorCodec {
    /// Extracts the tile's source rectangle from `frame` into a planar
    /// tensor. Models wanting more than 3 input channels get the RGB planes
    /// replicated (channel `c` reads plane `c % 3`).
    pub fn encode_tile(
        frame: &Frame,
        tile: &Tile,
        channels: usize,
    ) -> Result<Array3<f32>, EngineError> {
        if channels == 0 {
            return Err(EngineError::invalid_configuration(
                "model input must have at least one channel",
            ));
        }
        if tile.source_x + tile.source_width > frame.width
            || tile.source_y + tile.source_height > frame.height
        {
            return Err(EngineError::tile_extraction(format!(
                "tile rect {}x{} at ({}, {}) exceeds {}x{} frame",
                tile.source_width,
                tile.source_height,
                tile.source_x,
                tile.source_y,
                frame.width,
                frame.height
            )));
        }
        let expected = frame.width * frame.height * 3;
        if frame.data.len() < expected {
            return Err(EngineError::tile_extraction(format!(
                "frame payload truncated: {} bytes, expected {expected}",
                frame.data.len()
            )));
        }

        let mut tensor = Array3::<f32>::zeros((channels, tile.source_height, tile.source_width));
        for channel in 0..channels {
            let plane = channel % 3;
            for y in 0..tile.source_height {
                let row_offset = ((tile.source_y + y) * frame.width + tile.source_x) * 3;
                for x in 0..tile.source_width {
                    let value = frame.data[row_offset + x * 3 + plane];
                    tensor[[channel, y, x]] = value as f32 / 255.0;
                }
            }
        }
        Ok(tensor)
    }

    /// Samples one output pixel from a model tensor using nearest-neighbor
    /// lookup. `scale_ratio` is output pixels per tensor pixel; a ratio of
    /// 1.0 means the tensor is already at output resolution. Returned
    /// channels are in the `[0, 255]` domain, clamped.
    #[inline]
    pub fn sample_rgb(
        tensor: &ArrayView3<'_, f32>,
        out_x: usize,
        out_y: usize,
        scale_ratio: f64,
    ) -> [f32; 3] {
        let (_, tensor_height, tensor_width) = tensor.dim();
        let src_x = ((out_x as f64 / scale_ratio) as usize).min(tensor_width - 1);
        let src_y = ((out_y as f64 / scale_ratio) as usize).min(tensor_height - 1);

        let mut rgb = [0.0_f32; 3];
        for (channel, value) in rgb.iter_mut().enumerate() {
            *value = (tensor[[channel, src_y, src_x]] * 255.0).clamp(0.0, 255.0);
        }
        rgb
    }

    /// Decodes a full model tensor into interleaved RGB at the requested
    /// output size, resampling with the same nearest-neighbor rule as
    /// `sample_rgb`.
    pub fn decode_region(
        tensor: &ArrayView3<'_, f32>,
        out_width: usize,
        out_height: usize,
        scale_ratio: f64,
    ) -> Result<Vec<u8>, EngineError> {
        let (tensor_channels, tensor_height, tensor_width) = tensor.dim();
        if tensor_channels < 3 || tensor_width == 0 || tensor_height == 0 {
            return Err(EngineError::inference(format!(
                "backend produced unusable tensor shape [{tensor_channels}, {tensor_height}, {tensor_width}]"
            )));
        }
        if !(scale_ratio.is_finite() && scale_ratio > 0.0) {
            return Err(EngineError::invalid_configuration(format!(
                "scale ratio {scale_ratio} must be a positive finite number"
            )));
        }

        let mut rgb = vec![0_u8; out_width * out_height * 3];
        for y in 0..out_height {
            for x in 0..out_width {
                let sample = Self::sample_rgb(tensor, x, y, scale_ratio);
                let offset = (y * out_width + x) * 3;
                for channel in 0..3 {
                    rgb[offset + channel] = sample[channel].round() as u8;
                }
            }
        }
        Ok(rgb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_frame_tile(width: usize, height: usize) -> Tile {
        Tile {
            source_x: 0,
            source_y: 0,
            source_width: width,
            source_height: height,
            dest_x: 0,
            dest_y: 0,
            dest_width: width * 2,
            dest_height: height * 2,
            is_left_edge: true,
            is_right_edge: true,
            is_top_edge: true,
            is_bottom_edge: true,
        }
    }

    #[test]
    fn encode_normalizes_and_planarizes() {
        let frame = Frame::new(vec![255, 0, 51, 0, 255, 102], 2, 1).expect("frame");
        let tensor = TensorCodec::encode_tile(&frame, &full_frame_tile(2, 1), 3).expect("encode");

        assert_eq!(tensor.dim(), (3, 1, 2));
        assert_eq!(tensor[[0, 0, 0]], 1.0);
        assert_eq!(tensor[[1, 0, 0]], 0.0);
        assert_eq!(tensor[[2, 0, 0]], 0.2);
        assert_eq!(tensor[[0, 0, 1]], 0.0);
        assert_eq!(tensor[[1, 0, 1]], 1.0);
        assert_eq!(tensor[[2, 0, 1]], 0.4);
    }

    #[test]
    fn extra_channels_replicate_rgb_planes() {
        let frame = Frame::new(vec![255, 128, 0], 1, 1).expect("frame");
        let tensor = TensorCodec::encode_tile(&frame, &full_frame_tile(1, 1), 5).expect("encode");

        assert_eq!(tensor.dim(), (5, 1, 1));
        assert_eq!(tensor[[3, 0, 0]], tensor[[0, 0, 0]]);
        assert_eq!(tensor[[4, 0, 0]], tensor[[1, 0, 0]]);
    }

    #[test]
    fn encode_rejects_tile_outside_frame() {
        let frame = Frame::black(4, 4).expect("frame");
        let mut tile = full_frame_tile(4, 4);
        tile.source_x = 2;

        let result = TensorCodec::encode_tile(&frame, &tile, 3);
        assert!(matches!(
            result,
            Err(EngineError::TileExtractionFailed { .. })
        ));
    }

    #[test]
    fn sample_clamps_at_tensor_border() {
        let mut tensor = Array3::<f32>::zeros((3, 2, 2));
        tensor[[0, 1, 1]] = 1.0;

        // Sampling past the tensor extent snaps to the last texel.
        let rgb = TensorCodec::sample_rgb(&tensor.view(), 7, 7, 2.0);
        assert_eq!(rgb, [255.0, 0.0, 0.0]);
    }

    #[test]
    fn decode_upsamples_with_nearest_neighbor() {
        let mut tensor = Array3::<f32>::zeros((3, 1, 2));
        tensor[[0, 0, 0]] = 1.0;
        tensor[[1, 0, 1]] = 1.0;

        let rgb = TensorCodec::decode_region(&tensor.view(), 4, 1, 2.0).expect("decode");
        assert_eq!(rgb, vec![255, 0, 0, 255, 0, 0, 0, 255, 0, 0, 255, 0]);
    }

    #[test]
    fn decode_clamps_out_of_range_values() {
        let mut tensor = Array3::<f32>::zeros((3, 1, 1));
        tensor[[0, 0, 0]] = 1.7;
        tensor[[1, 0, 0]] = -0.3;
        tensor[[2, 0, 0]] = 0.5;

        let rgb = TensorCodec::decode_region(&tensor.view(), 1, 1, 1.0).expect("decode");
        assert_eq!(rgb, vec![255, 0, 128]);
    }

    #[test]
    fn decode_rejects_grayscale_tensor() {
        let tensor = Array3::<f32>::zeros((1, 4, 4));
        let result = TensorCodec::decode_region(&tensor.view(), 4, 4, 1.0);
        assert!(matches!(result, Err(EngineError::InferenceFailed { .. })));
    }
}
