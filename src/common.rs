//! These modules are shared among both the client and server executables.
use std::time::{SystemTime, UNIX_EPOCH};

pub mod audio_frame;
pub mod box_error;
pub mod config;
pub mod delay_estimator;
pub mod fader;
pub mod jam_error;
pub mod jam_packet;
pub mod jitter_buffer;
pub mod link;
pub mod settings;
pub mod sock_with_tos;
pub mod stream_time_stat;
pub mod transport;

/// wall clock in microseconds.  All the timers and packet timestamps use this.
pub fn get_micro_time() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros(),
        Err(_) => 0,
    }
}
