use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use uptile_core::orchestrator::FrameSink;
use uptile_core::types::Frame;

/// Reads headerless interleaved RGB24 frames of fixed geometry from a
/// file, the layout `ffmpeg -pix_fmt rgb24 -f rawvideo` produces.
pub struct RawFrameSource {
    reader: BufReader<File>,
    width: usize,
    height: usize,
    fps: Option<f64>,
    next_index: u64,
    finished: bool,
}

impl RawFrameSource {
    pub fn open(path: &Path, width: usize, height: usize, fps: Option<f64>) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("frame geometry {width}x{height} is degenerate");
        }
        let file = File::open(path)
            .with_context(|| format!("failed to open input file: {}", path.display()))?;
        Ok(Self {
            reader: BufReader::new(file),
            width,
            height,
            fps,
            next_index: 0,
            finished: false,
        })
    }

    fn timestamp_for(&self, index: u64) -> Option<Duration> {
        self.fps
            .filter(|fps| *fps > 0.0)
            .map(|fps| Duration::from_secs_f64(index as f64 / fps))
    }
}

impl Iterator for RawFrameSource {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let frame_len = self.width * self.height * 3;
        let mut data = vec![0_u8; frame_len];
        let mut filled = 0;
        while filled < frame_len {
            match self.reader.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    self.finished = true;
                    return Some(Err(error).context("failed to read input frame"));
                }
            }
        }

        if filled == 0 {
            self.finished = true;
            return None;
        }
        if filled < frame_len {
            self.finished = true;
            return Some(Err(anyhow::anyhow!(
                "input ends mid-frame: frame {} has {filled} of {frame_len} bytes",
                self.next_index
            )));
        }

        let index = self.next_index;
        self.next_index += 1;
        let timestamp = self.timestamp_for(index);
        Some(
            Frame::new(data, self.width, self.height)
                .map(|frame| frame.with_timestamp(timestamp))
                .map_err(anyhow::Error::from),
        )
    }
}

/// Writes frames back out as headerless RGB24. The first frame fixes the
/// geometry; later frames must match it.
pub struct RawFrameSink {
    writer: BufWriter<File>,
    geometry: Option<(usize, usize)>,
    frames_written: u64,
}

impl RawFrameSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create output file: {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            geometry: None,
            frames_written: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl FrameSink for RawFrameSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        match self.geometry {
            None => self.geometry = Some((frame.width, frame.height)),
            Some((width, height)) if (width, height) != (frame.width, frame.height) => {
                bail!(
                    "frame geometry changed from {width}x{height} to {}x{}",
                    frame.width,
                    frame.height
                );
            }
            Some(_) => {}
        }

        self.writer
            .write_all(&frame.data)
            .context("failed to write output frame")?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush output file")
    }
}
