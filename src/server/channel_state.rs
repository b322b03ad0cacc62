//! One cell of the mix matrix: how one contributor sounds in one listener's mix.
use serde::Serialize;
use std::fmt;

use crate::common::fader::Fader;

#[derive(Debug, Clone, Serialize)]
pub struct ChannelState {
    pub client_id: u32,
    gain: f32,
    #[serde(skip)]
    pan: Fader,
    pub muted: bool,
    pub solo: bool,
    /// what a mixer view shows for the channel
    pub name: String,
}

impl ChannelState {
    pub fn new(client_id: u32) -> ChannelState {
        ChannelState::named(client_id, &format!("client {}", client_id))
    }
    pub fn named(client_id: u32, name: &str) -> ChannelState {
        ChannelState {
            client_id: client_id,
            gain: 1.0,
            pan: Fader::new(),
            muted: false,
            solo: false,
            name: name.to_string(),
        }
    }
    pub fn get_gain(&self) -> f32 {
        self.gain
    }
    /// linear gain, clamped to 0..1.  NaN is ignored.
    pub fn set_gain(&mut self, v: f32) {
        if v.is_nan() {
            return;
        }
        self.gain = v.clamp(0.0, 1.0);
    }
    pub fn get_pan(&self) -> f32 {
        self.pan.get()
    }
    pub fn set_pan(&mut self, v: f32) {
        self.pan.set(v);
    }
    /// gain times the pan law for each side
    pub fn left(&self) -> f32 {
        self.gain * self.pan.left()
    }
    pub fn right(&self) -> f32 {
        self.gain * self.pan.right()
    }
}

impl Default for ChannelState {
    fn default() -> ChannelState {
        ChannelState::new(0)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ id: {}, name: {}, gain: {:.2}, pan: {:.2}, mute: {}, solo: {} }}",
            self.client_id,
            self.name,
            self.gain,
            self.pan.get(),
            self.muted,
            self.solo
        )
    }
}

#[cfg(test)]
mod test_channel_state {
    use super::*;

    #[test]
    fn defaults_to_unity_center() {
        let state = ChannelState::new(3);
        assert_eq!(state.get_gain(), 1.0);
        assert_eq!(state.get_pan(), 0.0);
        assert!(!state.muted && !state.solo);
        assert_eq!(state.name, "client 3");
        assert!((state.left() - 1.0).abs() < 1e-6);
        assert!((state.right() - 1.0).abs() < 1e-6);
    }
    #[test]
    fn named_channel() {
        let state = ChannelState::named(4, "keys");
        assert_eq!(state.client_id, 4);
        assert_eq!(state.name, "keys");
        assert_eq!(state.get_gain(), 1.0);
    }
    #[test]
    fn gain_and_pan() {
        let mut state = ChannelState::new(3);
        state.set_gain(0.5);
        state.set_pan(-1.0);
        assert!((state.left() - 0.5 * 2.0f32.sqrt()).abs() < 1e-6);
        assert!(state.right().abs() < 1e-6);
        state.set_gain(4.0);
        assert_eq!(state.get_gain(), 1.0);
        state.set_gain(f32::NAN);
        assert_eq!(state.get_gain(), 1.0);
        state.set_gain(-1.0);
        assert_eq!(state.get_gain(), 0.0);
    }
}
