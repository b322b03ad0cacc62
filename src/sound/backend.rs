//! Contract every audio device adapter implements.
//!
//! The engine code never talks to a sound system directly.  It hands a
//! [`SoundCallback`] to something implementing [`AudioBackend`] and that
//! thing calls it once per frame.  The timer backend ships with the crate,
//! a jack adapter is behind the `jack` feature.
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use std::fmt;

use super::SoundCallback;
use crate::common::audio_frame::{FrameSize, MAX_CHANNELS, SAMPLE_RATE};
use crate::common::jam_error::AudioIoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub frame_size: FrameSize,
    pub channels: usize,
}

impl AudioFormat {
    pub fn new(frame_size: FrameSize, channels: usize) -> AudioFormat {
        AudioFormat {
            sample_rate: SAMPLE_RATE,
            frame_size: frame_size,
            channels: channels,
        }
    }
    /// Everything in the crate runs at one rate with one or two channels
    pub fn check(&self) -> Result<(), AudioIoError> {
        if self.sample_rate != SAMPLE_RATE {
            return Err(AudioIoError::FormatUnsupported(format!(
                "sample rate {} (only {} is supported)",
                self.sample_rate, SAMPLE_RATE
            )));
        }
        if self.channels < 1 || self.channels > MAX_CHANNELS {
            return Err(AudioIoError::FormatUnsupported(format!(
                "{} channels",
                self.channels
            )));
        }
        Ok(())
    }
}

impl Default for AudioFormat {
    fn default() -> AudioFormat {
        AudioFormat::new(FrameSize::default(), MAX_CHANNELS)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}Hz {} samples {}ch",
            self.sample_rate,
            self.frame_size.samples(),
            self.channels
        )
    }
}

/// One audio device.  `open` negotiates, `start` hands over the callback and
/// begins calling it, `stop` releases the device.
///
/// `format` reports what is running right now.  A backend that loses its
/// device returns None from here so the owner can notice and reconfigure.
#[cfg_attr(test, automock)]
pub trait AudioBackend: Send {
    fn open(&mut self, format: AudioFormat) -> Result<AudioFormat, AudioIoError>;
    fn start(&mut self, callback: Box<dyn SoundCallback>) -> Result<(), AudioIoError>;
    fn stop(&mut self);
    fn format(&self) -> Option<AudioFormat>;
}
