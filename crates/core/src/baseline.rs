/// Deterministic CPU resamplers used for the conventional upscale path.
///
/// The baseline image is blended against neural output when the drift guard
/// or region weighting pulls the blend weight below 1.0, and doubles as a
/// stand-in inference path when no model is available.
pub trait BaselineResampler: Send + Sync {
    fn name(&self) -> &str;

    /// Resizes interleaved RGB. `src.len()` must be `src_width * src_height * 3`;
    /// the result is `dst_width * dst_height * 3`.
    fn resize(
        &self,
        src: &[u8],
        src_width: usize,
        src_height: usize,
        dst_width: usize,
        dst_height: usize,
    ) -> Vec<u8>;
}

/// Catmull-Rom bicubic resampler. Source positions use pixel-center
/// mapping so the image does not shift by half a texel when scaled.
#[derive(Debug, Default, Clone, Copy)]
pub struct BicubicResampler;

impl BaselineResampler for BicubicResampler {
    fn name(&self) -> &str {
        "bicubic"
    }

    fn resize(
        &self,
        src: &[u8],
        src_width: usize,
        src_height: usize,
        dst_width: usize,
        dst_height: usize,
    ) -> Vec<u8> {
        let mut dst = vec![0_u8; dst_width * dst_height * 3];
        if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
            return dst;
        }

        let x_ratio = src_width as f32 / dst_width as f32;
        let y_ratio = src_height as f32 / dst_height as f32;

        for dst_y in 0..dst_height {
            let src_y = (dst_y as f32 + 0.5) * y_ratio - 0.5;
            let y0 = src_y.floor() as isize;
            let fy = src_y - y0 as f32;
            let wy = catmull_rom_weights(fy);

            for dst_x in 0..dst_width {
                let src_x = (dst_x as f32 + 0.5) * x_ratio - 0.5;
                let x0 = src_x.floor() as isize;
                let fx = src_x - x0 as f32;
                let wx = catmull_rom_weights(fx);

                let mut accum = [0.0_f32; 3];
                for (tap_y, &weight_y) in wy.iter().enumerate() {
                    let sample_y = clamp_index(y0 + tap_y as isize - 1, src_height);
                    for (tap_x, &weight_x) in wx.iter().enumerate() {
                        let sample_x = clamp_index(x0 + tap_x as isize - 1, src_width);
                        let offset = (sample_y * src_width + sample_x) * 3;
                        let weight = weight_y * weight_x;
                        for channel in 0..3 {
                            accum[channel] += weight * src[offset + channel] as f32;
                        }
                    }
                }

                let dst_offset = (dst_y * dst_width + dst_x) * 3;
                for channel in 0..3 {
                    dst[dst_offset + channel] = accum[channel].clamp(0.0, 255.0).round() as u8;
                }
            }
        }

        dst
    }
}

/// Nearest-neighbor resampler. Useful when the caller wants hard pixel
/// edges preserved, and as the cheapest possible baseline.
#[derive(Debug, Default, Clone, Copy)]
pub struct NearestResampler;

impl BaselineResampler for NearestResampler {
    fn name(&self) -> &str {
        "nearest"
    }

    fn resize(
        &self,
        src: &[u8],
        src_width: usize,
        src_height: usize,
        dst_width: usize,
        dst_height: usize,
    ) -> Vec<u8> {
        let mut dst = vec![0_u8; dst_width * dst_height * 3];
        if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
            return dst;
        }

        for dst_y in 0..dst_height {
            let src_y = (dst_y * src_height / dst_height).min(src_height - 1);
            for dst_x in 0..dst_width {
                let src_x = (dst_x * src_width / dst_width).min(src_width - 1);
                let src_offset = (src_y * src_width + src_x) * 3;
                let dst_offset = (dst_y * dst_width + dst_x) * 3;
                dst[dst_offset..dst_offset + 3].copy_from_slice(&src[src_offset..src_offset + 3]);
            }
        }

        dst
    }
}

/// Catmull-Rom spline weights for the 4 taps around fractional offset `t`.
fn catmull_rom_weights(t: f32) -> [f32; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        0.5 * (-t3 + 2.0 * t2 - t),
        0.5 * (3.0 * t3 - 5.0 * t2 + 2.0),
        0.5 * (-3.0 * t3 + 4.0 * t2 + t),
        0.5 * (t3 - t2),
    ]
}

#[inline]
fn clamp_index(index: isize, len: usize) -> usize {
    index.clamp(0, len as isize - 1) as usize
}
