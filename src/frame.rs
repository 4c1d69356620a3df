//! Frame values and capture sources.
//!
//! A `Frame` is one captured image buffer plus its presentation timestamp and
//! the sequence number assigned when it entered the bus. Frames are shared as
//! `Arc<Frame>` so the synchronous effects path operates on the same buffer
//! capture produced (no copy), while asynchronous consumers hold cheap clones
//! of the handle.
//!
//! `FrameSource` abstracts the platform capture callback. Real camera stacks
//! live below this seam (out of scope here); `SyntheticSource` generates a
//! deterministic test pattern at the configured rate, the stand-in this crate
//! ships for tests and examples.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CameraConfig;
use crate::error::Result;

/// One captured image plus timing metadata.
#[derive(Clone, Debug)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Packed RGB pixel data (opaque to the kernel; stages know the layout).
    pub data: Vec<u8>,
    /// Presentation timestamp relative to session start.
    pub pts: Duration,
    /// Monotonically increasing per-bus sequence number. Consumers detect
    /// drops via gaps; drops are degradation, never errors.
    pub sequence: u64,
}

pub type SharedFrame = Arc<Frame>;

/// Frame payload as produced by a source, before the bus assigns a sequence.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub pts: Duration,
}

/// A source of captured frames. Implementations deliver frames on the
/// dedicated capture context; `next_frame` paces itself to the configured
/// frame rate.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<()>;
    fn next_frame(&mut self) -> Result<CapturedFrame>;
}

/// Deterministic test-pattern source.
///
/// Paced sources sleep to the next frame tick so a session approximates the
/// configured rate in wall time; unpaced sources run flat out with synthetic
/// timestamps, which integration tests use to run thousands of frames fast.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame_interval: Duration,
    paced: bool,
    frame_count: u64,
    started: Option<Instant>,
}

impl SyntheticSource {
    pub fn from_config(config: &CameraConfig) -> Self {
        let (width, height) = config.preview_size();
        Self {
            width,
            height,
            frame_interval: config.frame_interval(),
            paced: true,
            frame_count: 0,
            started: None,
        }
    }

    /// Unpaced variant: frames carry ideal timestamps but are produced as
    /// fast as the caller pulls them.
    pub fn unpaced(width: u32, height: u32, frame_interval: Duration) -> Self {
        Self {
            width,
            height,
            frame_interval,
            paced: false,
            frame_count: 0,
            started: None,
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        // Shifting gradient so consecutive frames differ.
        let shift = (self.frame_count % 256) as u8;
        let mut pixels = vec![0u8; pixel_count];
        for (i, px) in pixels.iter_mut().enumerate() {
            *px = ((i % 256) as u8).wrapping_add(shift);
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> Result<()> {
        self.started = Some(Instant::now());
        self.frame_count = 0;
        log::info!(
            "SyntheticSource: opened {}x{} at {:?}/frame",
            self.width,
            self.height,
            self.frame_interval
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<CapturedFrame> {
        let started = *self.started.get_or_insert_with(Instant::now);
        let pts = self.frame_interval * self.frame_count as u32;

        if self.paced {
            let due = started + pts;
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }

        let data = self.generate_pixels();
        self.frame_count += 1;

        Ok(CapturedFrame {
            width: self.width,
            height: self.height,
            data,
            pts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpaced_source_produces_ideal_timestamps() {
        let interval = Duration::from_millis(33);
        let mut source = SyntheticSource::unpaced(64, 48, interval);
        source.open().unwrap();

        let first = source.next_frame().unwrap();
        let second = source.next_frame().unwrap();
        assert_eq!(first.pts, Duration::ZERO);
        assert_eq!(second.pts, interval);
        assert_eq!(first.data.len(), 64 * 48 * 3);
    }

    #[test]
    fn consecutive_frames_differ() {
        let mut source = SyntheticSource::unpaced(16, 16, Duration::from_millis(1));
        source.open().unwrap();
        let a = source.next_frame().unwrap();
        let b = source.next_frame().unwrap();
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn open_resets_the_clock() {
        let mut source = SyntheticSource::unpaced(8, 8, Duration::from_millis(10));
        source.open().unwrap();
        source.next_frame().unwrap();
        source.next_frame().unwrap();
        source.open().unwrap();
        let frame = source.next_frame().unwrap();
        assert_eq!(frame.pts, Duration::ZERO);
    }
}
