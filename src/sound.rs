//! components used to make the rtmix client, plus the audio backends both
//! executables drive their callbacks with.

use crate::common::box_error::BoxError;

/// Anything that wants a frame of audio every period.
///
/// The backend calls `process` from its real time thread with one slice per
/// channel.  Implementations must not block.
pub trait SoundCallback: Send {
    fn process(
        &mut self,
        in_a: &[f32],
        in_b: &[f32],
        out_a: &mut [f32],
        out_b: &mut [f32],
    ) -> Result<(), BoxError>;
}

pub mod backend;
pub mod client;
#[cfg(feature = "jack")]
pub mod jack_backend;
pub mod jam_engine;
pub mod net_thread;
pub mod param_message;
pub mod timer_backend;
