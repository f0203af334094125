//! Raw BGRA video output.
//!
//! The sink has fixed dimensions declared at construction. Frames that do
//! not match exactly are rejected rather than padded or cropped.

use faceon_core::Raster;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("cannot open sink {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("frame is {actual_width}x{actual_height}x{actual_channels}, sink expects {width}x{height}x4")]
    DimensionMismatch {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
        actual_channels: u8,
    },
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for finished BGRA frames.
pub trait OutputSink: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn publish(&mut self, frame: &Raster) -> Result<(), SinkError>;
}

/// Writes each frame as one contiguous BGRA buffer, paced to a fixed rate.
pub struct RawVideoSink<W: Write + Send> {
    writer: W,
    width: u32,
    height: u32,
    /// `None` disables pacing.
    frame_interval: Option<Duration>,
    next_deadline: Option<Instant>,
}

impl RawVideoSink<File> {
    /// Open a FIFO, v4l2loopback node or plain file for writing.
    pub fn open(path: &Path, width: u32, height: u32, fps: u32) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| SinkError::Open {
                path: path.display().to_string(),
                source,
            })?;
        tracing::info!(path = %path.display(), width, height, fps, "output sink opened");
        Ok(Self::new(file, width, height, fps))
    }
}

impl<W: Write + Send> RawVideoSink<W> {
    /// Wrap a writer. `fps == 0` writes as fast as frames arrive.
    pub fn new(writer: W, width: u32, height: u32, fps: u32) -> Self {
        let frame_interval = (fps > 0).then(|| Duration::from_nanos(1_000_000_000 / fps as u64));
        Self {
            writer,
            width,
            height,
            frame_interval,
            next_deadline: None,
        }
    }

    pub fn frame_interval(&self) -> Option<Duration> {
        self.frame_interval
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn pace(&mut self) {
        let Some(interval) = self.frame_interval else {
            return;
        };
        let now = Instant::now();
        match self.next_deadline {
            Some(deadline) if deadline > now => {
                std::thread::sleep(deadline - now);
                self.next_deadline = Some(deadline + interval);
            }
            // First frame, or running late: restart the cadence from now.
            _ => self.next_deadline = Some(now + interval),
        }
    }
}

impl<W: Write + Send> OutputSink for RawVideoSink<W> {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn publish(&mut self, frame: &Raster) -> Result<(), SinkError> {
        if frame.width() != self.width || frame.height() != self.height || frame.channels() != 4 {
            return Err(SinkError::DimensionMismatch {
                width: self.width,
                height: self.height,
                actual_width: frame.width(),
                actual_height: frame.height(),
                actual_channels: frame.channels(),
            });
        }
        self.pace();
        self.writer.write_all(frame.data())?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_writes_exact_frame() {
        let mut sink = RawVideoSink::new(Vec::new(), 4, 2, 0);
        let frame = Raster::filled(4, 2, 4, 7);
        sink.publish(&frame).unwrap();
        sink.publish(&frame).unwrap();
        let written = sink.into_inner();
        assert_eq!(written.len(), 4 * 2 * 4 * 2);
        assert!(written.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let mut sink = RawVideoSink::new(Vec::new(), 4, 2, 0);
        let err = sink.publish(&Raster::filled(4, 3, 4, 0)).unwrap_err();
        assert!(matches!(err, SinkError::DimensionMismatch { actual_height: 3, .. }));
        assert!(sink.into_inner().is_empty());
    }

    #[test]
    fn test_bgr_frame_is_rejected() {
        let mut sink = RawVideoSink::new(Vec::new(), 4, 2, 0);
        let err = sink.publish(&Raster::filled(4, 2, 3, 0)).unwrap_err();
        assert!(matches!(err, SinkError::DimensionMismatch { actual_channels: 3, .. }));
    }

    #[test]
    fn test_pacing_spaces_frames() {
        let mut sink = RawVideoSink::new(Vec::new(), 2, 2, 50);
        assert_eq!(sink.frame_interval(), Some(Duration::from_millis(20)));
        let frame = Raster::filled(2, 2, 4, 0);
        let start = Instant::now();
        for _ in 0..4 {
            sink.publish(&frame).unwrap();
        }
        // First frame goes out immediately, the next three wait one interval each.
        assert!(start.elapsed() >= Duration::from_millis(55), "elapsed {:?}", start.elapsed());
    }

    #[test]
    fn test_open_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.raw");
        let mut sink = RawVideoSink::open(&path, 2, 1, 0).unwrap();
        sink.publish(&Raster::filled(2, 1, 4, 9)).unwrap();
        drop(sink);
        assert_eq!(std::fs::read(&path).unwrap(), vec![9u8; 8]);
    }
}
