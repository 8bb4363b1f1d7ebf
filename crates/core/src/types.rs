use std::time::Duration;

use crate::error::EngineError;

/// Interleaved 8-bit RGB frame. `data.len()` is always `width * height * 3`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub timestamp: Option<Duration>,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: usize, height: usize) -> Result<Self, EngineError> {
        let expected = width
            .checked_mul(height)
            .and_then(|pixels| pixels.checked_mul(3))
            .ok_or(EngineError::BufferAllocationFailed {
                width: width as u64,
                height: height as u64,
            })?;
        if data.len() != expected {
            return Err(EngineError::tile_extraction(format!(
                "frame payload is {} bytes, expected {} for {width}x{height} rgb",
                data.len(),
                expected
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: None,
        })
    }

    pub fn black(width: usize, height: usize) -> Result<Self, EngineError> {
        let len = width
            .checked_mul(height)
            .and_then(|pixels| pixels.checked_mul(3))
            .ok_or(EngineError::BufferAllocationFailed {
                width: width as u64,
                height: height as u64,
            })?;
        Ok(Self {
            data: vec![0; len],
            width,
            height,
            timestamp: None,
        })
    }

    pub fn with_timestamp(mut self, timestamp: Option<Duration>) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let offset = (y * self.width + x) * 3;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ]
    }
}

/// Weighted color accumulator for overlapping tile composition.
///
/// Tiles add feathered contributions with `accumulate`; `normalize` divides
/// color sums by weight sums to produce the final frame. Pixels no tile
/// touched normalize to black.
#[derive(Debug)]
pub struct AccumulationBuffer {
    width: usize,
    height: usize,
    color_sum: Vec<f32>,
    weight_sum: Vec<f32>,
}

impl AccumulationBuffer {
    pub fn allocate(width: usize, height: usize) -> Result<Self, EngineError> {
        let pixels = width
            .checked_mul(height)
            .ok_or(EngineError::BufferAllocationFailed {
                width: width as u64,
                height: height as u64,
            })?;
        let color_len = pixels
            .checked_mul(3)
            .ok_or(EngineError::BufferAllocationFailed {
                width: width as u64,
                height: height as u64,
            })?;

        let mut color_sum = Vec::new();
        color_sum
            .try_reserve_exact(color_len)
            .map_err(|_| EngineError::BufferAllocationFailed {
                width: width as u64,
                height: height as u64,
            })?;
        color_sum.resize(color_len, 0.0);

        let mut weight_sum = Vec::new();
        weight_sum
            .try_reserve_exact(pixels)
            .map_err(|_| EngineError::BufferAllocationFailed {
                width: width as u64,
                height: height as u64,
            })?;
        weight_sum.resize(pixels, 0.0);

        Ok(Self {
            width,
            height,
            color_sum,
            weight_sum,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn accumulate(&mut self, x: usize, y: usize, weight: f32, rgb: [f32; 3]) {
        debug_assert!(x < self.width && y < self.height);
        let pixel = y * self.width + x;
        let offset = pixel * 3;
        self.color_sum[offset] += weight * rgb[0];
        self.color_sum[offset + 1] += weight * rgb[1];
        self.color_sum[offset + 2] += weight * rgb[2];
        self.weight_sum[pixel] += weight;
    }

    #[inline]
    pub fn weight_at(&self, x: usize, y: usize) -> f32 {
        self.weight_sum[y * self.width + x]
    }

    /// Divides accumulated color by accumulated weight and packs the result
    /// back into 8-bit RGB. Untouched pixels come out black.
    pub fn normalize(&self) -> Frame {
        let mut data = vec![0_u8; self.width * self.height * 3];
        for pixel in 0..self.width * self.height {
            let weight = self.weight_sum[pixel];
            if weight <= 0.0 {
                continue;
            }
            let offset = pixel * 3;
            for channel in 0..3 {
                let value = self.color_sum[offset + channel] / weight;
                data[offset + channel] = value.clamp(0.0, 255.0).round() as u8;
            }
        }
        Frame {
            data,
            width: self.width,
            height: self.height,
            timestamp: None,
        }
    }
}
