//! A frame of audio: one hardware buffer period worth of samples.
//!
//! Frames are fixed size storage (`Copy`) so they can be moved through the
//! jitter buffer ring and the mixer without touching the allocator.
use num::FromPrimitive;
use serde::{Deserialize, Serialize};
use simple_error::bail;
use std::fmt;

use super::box_error::BoxError;

/// Everything runs at one sample rate.
pub const SAMPLE_RATE: u32 = 48_000;
/// Largest frame we will ever carry
pub const MAX_FRAME_SIZE: usize = 256;
pub const MAX_CHANNELS: usize = 2;

/// The hardware buffer sizes the system negotiates
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum FrameSize {
    Samples64 = 64,
    Samples128 = 128,
    Samples256 = 256,
}

impl FrameSize {
    pub fn from_samples(n: usize) -> Option<FrameSize> {
        FromPrimitive::from_usize(n)
    }
    pub fn samples(self) -> usize {
        self as usize
    }
    /// wire code: frame length in units of 64 samples
    pub fn code(self) -> u8 {
        (self.samples() / 64) as u8
    }
    pub fn from_code(code: u8) -> Option<FrameSize> {
        Self::from_samples(code as usize * 64)
    }
    /// length of one frame in microseconds
    pub fn period_us(self) -> f64 {
        self.samples() as f64 * 1_000_000.0 / SAMPLE_RATE as f64
    }
    pub fn period_ms(self) -> f64 {
        self.period_us() / 1000.0
    }
}

impl Default for FrameSize {
    fn default() -> Self {
        FrameSize::Samples128
    }
}

#[derive(Clone, Copy)]
pub struct AudioFrame {
    samples: [[f32; MAX_FRAME_SIZE]; MAX_CHANNELS],
    len: usize,
    channels: usize,
}

impl AudioFrame {
    /// A frame of silence
    pub fn silent(size: FrameSize, channels: usize) -> AudioFrame {
        AudioFrame {
            samples: [[0.0; MAX_FRAME_SIZE]; MAX_CHANNELS],
            len: size.samples(),
            channels: channels.clamp(1, MAX_CHANNELS),
        }
    }
    /// Capture a frame from the callback buffers.  `right` is None for mono.
    pub fn capture(left: &[f32], right: Option<&[f32]>) -> Result<AudioFrame, BoxError> {
        let size = match FrameSize::from_samples(left.len()) {
            Some(s) => s,
            None => bail!("unsupported frame length {}", left.len()),
        };
        let mut frame = AudioFrame::silent(size, 1);
        frame.samples[0][..left.len()].copy_from_slice(left);
        if let Some(r) = right {
            if r.len() != left.len() {
                bail!("channel lengths differ: {} vs {}", left.len(), r.len());
            }
            frame.samples[1][..r.len()].copy_from_slice(r);
            frame.channels = 2;
        }
        Ok(frame)
    }
    /// reshape into an all zero frame (used by the mixer for its output)
    pub fn reset(&mut self, size: FrameSize, channels: usize) {
        self.len = size.samples();
        self.channels = channels.clamp(1, MAX_CHANNELS);
        for ch in self.samples.iter_mut() {
            ch[..MAX_FRAME_SIZE].fill(0.0);
        }
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn frame_size(&self) -> Option<FrameSize> {
        FrameSize::from_samples(self.len)
    }
    pub fn channels(&self) -> usize {
        self.channels
    }
    pub fn is_stereo(&self) -> bool {
        self.channels == 2
    }
    pub fn channel(&self, idx: usize) -> &[f32] {
        // mono frames hand out the one channel for both sides
        let idx = idx.min(self.channels - 1);
        &self.samples[idx][..self.len]
    }
    pub(crate) fn channel_mut(&mut self, idx: usize) -> &mut [f32] {
        let idx = idx.min(self.channels - 1);
        &mut self.samples[idx][..self.len]
    }
    /// copy the frame out to a pair of callback buffers.  Mono goes to both sides
    pub fn write_out(&self, out_a: &mut [f32], out_b: &mut [f32]) {
        let n = self.len.min(out_a.len()).min(out_b.len());
        out_a[..n].copy_from_slice(&self.channel(0)[..n]);
        out_b[..n].copy_from_slice(&self.channel(1)[..n]);
        out_a[n..].fill(0.0);
        out_b[n..].fill(0.0);
    }
    /// peak absolute sample value over all channels
    pub fn peak(&self) -> f32 {
        let mut peak = 0.0f32;
        for ch in 0..self.channels {
            for v in self.channel(ch) {
                peak = peak.max(v.abs());
            }
        }
        peak
    }
}

impl Default for AudioFrame {
    fn default() -> Self {
        AudioFrame::silent(FrameSize::default(), MAX_CHANNELS)
    }
}

impl fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "AudioFrame {{ len: {}, channels: {}, peak: {:.3} }}",
            self.len,
            self.channels,
            self.peak()
        )
    }
}
