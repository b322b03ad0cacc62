//! Personal mixes for everybody in the session.
//!
//! Every connected client is a member with one upstream jitter buffer.  The
//! mix matrix holds a [`ChannelState`] for every (listener, contributor) pair,
//! so each listener controls its own view of everybody else.  Once per tick
//! the mix thread calls [`MixEngine::pull_inputs`] (pops each buffer exactly
//! once) and then [`MixEngine::compute_mix`] for each listener.
//!
//! All changes come in as [`MixCommand`]s applied by the mix thread between
//! ticks, so a tick never sees a half applied change.
use log::{info, warn};
use serde_json::json;
use simple_error::bail;
use std::{collections::HashMap, fmt, net::SocketAddr};

use super::channel_state::ChannelState;
use crate::common::{
    audio_frame::{AudioFrame, FrameSize},
    box_error::BoxError,
    jam_packet::AudioQuality,
    jitter_buffer::JitterConsumer,
};
use crate::utils::{clip_float, to_db};

/// how much a member's level meter falls each tick without a louder frame
const LEVEL_RELEASE: f32 = 0.98;

/// Changes to the session, applied at the start of a mix tick
pub enum MixCommand {
    AddClient {
        client_id: u32,
        name: String,
        address: SocketAddr,
        channels: usize,
        quality: AudioQuality,
        consumer: JitterConsumer,
    },
    RemoveClient(u32),
    SetGain {
        listener: u32,
        contributor: u32,
        value: f32,
    },
    SetPan {
        listener: u32,
        contributor: u32,
        value: f32,
    },
    SetMute {
        listener: u32,
        contributor: u32,
        value: bool,
    },
    SetSolo {
        listener: u32,
        contributor: u32,
        value: bool,
    },
}

/// One connected client: where its mix goes and where its audio comes from
pub struct Member {
    pub client_id: u32,
    pub name: String,
    pub address: SocketAddr,
    pub channels: usize,
    pub quality: AudioQuality,
    consumer: JitterConsumer,
    frame: AudioFrame,
    has_frame: bool,
    level: f32,
    seq: u16,
}

impl Member {
    /// did this member's buffer deliver a frame this tick
    pub fn has_frame(&self) -> bool {
        self.has_frame
    }
    /// peak input level, held and released over a few hundred ticks
    pub fn level(&self) -> f32 {
        self.level
    }
}

pub struct MixEngine {
    frame_size: FrameSize,
    mix_own_audio: bool,
    max_clients: usize,
    members: Vec<Option<Member>>,
    ids: HashMap<u32, usize>,
    /// row = listener slot, column = contributor slot
    matrix: Vec<ChannelState>,
}

impl MixEngine {
    pub fn new(max_clients: usize, frame_size: FrameSize, mix_own_audio: bool) -> MixEngine {
        let mut members = Vec::with_capacity(max_clients);
        members.resize_with(max_clients, || None);
        MixEngine {
            frame_size: frame_size,
            mix_own_audio: mix_own_audio,
            max_clients: max_clients,
            members: members,
            ids: HashMap::with_capacity(max_clients),
            matrix: vec![ChannelState::default(); max_clients * max_clients],
        }
    }
    pub fn frame_size(&self) -> FrameSize {
        self.frame_size
    }
    pub fn max_clients(&self) -> usize {
        self.max_clients
    }
    pub fn len(&self) -> usize {
        self.ids.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
    pub fn contains(&self, client_id: u32) -> bool {
        self.ids.contains_key(&client_id)
    }
    pub fn set_mix_own_audio(&mut self, on: bool) {
        self.mix_own_audio = on;
    }
    /// member by slot, for walking every listener without allocating
    pub fn member_at(&self, slot: usize) -> Option<&Member> {
        match self.members.get(slot) {
            Some(Some(m)) => Some(m),
            _ => None,
        }
    }
    pub fn member(&self, client_id: u32) -> Option<&Member> {
        self.ids.get(&client_id).and_then(|s| self.member_at(*s))
    }

    /// Apply one change.  Returns false if it referred to somebody who isn't here.
    pub fn apply(&mut self, cmd: MixCommand) -> bool {
        match cmd {
            MixCommand::AddClient {
                client_id,
                name,
                address,
                channels,
                quality,
                consumer,
            } => match self.add_client(client_id, &name, address, channels, quality, consumer) {
                Ok(_) => true,
                Err(e) => {
                    warn!("mix: {}", e);
                    false
                }
            },
            MixCommand::RemoveClient(id) => self.remove_client(id),
            MixCommand::SetGain {
                listener,
                contributor,
                value,
            } => self.update(listener, contributor, |c| c.set_gain(value)),
            MixCommand::SetPan {
                listener,
                contributor,
                value,
            } => self.update(listener, contributor, |c| c.set_pan(value)),
            MixCommand::SetMute {
                listener,
                contributor,
                value,
            } => self.update(listener, contributor, |c| c.muted = value),
            MixCommand::SetSolo {
                listener,
                contributor,
                value,
            } => self.update(listener, contributor, |c| c.solo = value),
        }
    }

    /// New member.  Its row starts at unity/center for everybody and its
    /// column starts at unity/center in everybody else's mix.  `name` labels
    /// its column in every view.
    pub fn add_client(
        &mut self,
        client_id: u32,
        name: &str,
        address: SocketAddr,
        channels: usize,
        quality: AudioQuality,
        consumer: JitterConsumer,
    ) -> Result<usize, BoxError> {
        if self.ids.contains_key(&client_id) {
            bail!("client {} is already in the mix", client_id);
        }
        let slot = match self.members.iter().position(|m| m.is_none()) {
            Some(s) => s,
            None => bail!("mix is full ({} clients)", self.max_clients),
        };
        let max = self.max_clients;
        for listener in 0..max {
            self.matrix[listener * max + slot] = ChannelState::named(client_id, name);
        }
        for contributor in 0..max {
            self.matrix[slot * max + contributor] = match &self.members[contributor] {
                Some(m) => ChannelState::named(m.client_id, &m.name),
                None => ChannelState::default(),
            };
        }
        self.matrix[slot * max + slot] = ChannelState::named(client_id, name);
        self.members[slot] = Some(Member {
            client_id: client_id,
            name: name.to_string(),
            address: address,
            channels: channels.clamp(1, 2),
            quality: quality,
            consumer: consumer,
            frame: AudioFrame::silent(self.frame_size, channels),
            has_frame: false,
            level: 0.0,
            seq: 0,
        });
        self.ids.insert(client_id, slot);
        info!(
            "mix: client {} ({}) at {} in slot {}",
            client_id, name, address, slot
        );
        Ok(slot)
    }

    /// Drop a member and its buffer.  Nothing of theirs is mixed after this.
    pub fn remove_client(&mut self, client_id: u32) -> bool {
        match self.ids.remove(&client_id) {
            Some(slot) => {
                if let Some(member) = self.members[slot].take() {
                    member.consumer.handle().close();
                }
                info!("mix: client {} removed from slot {}", client_id, slot);
                true
            }
            None => false,
        }
    }

    fn update<F: FnOnce(&mut ChannelState)>(&mut self, listener: u32, contributor: u32, f: F) -> bool {
        match self.channel_mut(listener, contributor) {
            Some(c) => {
                f(c);
                true
            }
            None => false,
        }
    }

    /// how `contributor` sounds in `listener`'s mix
    pub fn channel(&self, listener: u32, contributor: u32) -> Option<&ChannelState> {
        let l = self.ids.get(&listener)?;
        let c = self.ids.get(&contributor)?;
        self.matrix.get(l * self.max_clients + c)
    }
    fn channel_mut(&mut self, listener: u32, contributor: u32) -> Option<&mut ChannelState> {
        let l = *self.ids.get(&listener)?;
        let c = *self.ids.get(&contributor)?;
        self.matrix.get_mut(l * self.max_clients + c)
    }

    /// Pop every member's buffer once.  A member with nothing this tick
    /// contributes silence.
    pub fn pull_inputs(&mut self) {
        for member in self.members.iter_mut().flatten() {
            let peak = match member.consumer.pop() {
                Some(frame) => {
                    member.frame = *frame;
                    member.has_frame = true;
                    member.frame.peak()
                }
                None => {
                    member.has_frame = false;
                    0.0
                }
            };
            member.level = peak.max(member.level * LEVEL_RELEASE);
        }
    }

    /// Build `listener_id`'s personal mix from the frames of the last
    /// [`MixEngine::pull_inputs`].  Returns false for an unknown listener.
    pub fn compute_mix(&self, listener_id: u32, out: &mut AudioFrame) -> bool {
        let l = match self.ids.get(&listener_id) {
            Some(s) => *s,
            None => return false,
        };
        let listener = match &self.members[l] {
            Some(m) => m,
            None => return false,
        };
        out.reset(self.frame_size, listener.channels);
        let max = self.max_clients;
        let row = &self.matrix[l * max..(l + 1) * max];
        let included = |c: usize| c != l || self.mix_own_audio;
        let any_solo = self
            .members
            .iter()
            .enumerate()
            .any(|(c, m)| m.is_some() && included(c) && row[c].solo);

        for (c, member) in self.members.iter().enumerate() {
            let m = match member {
                Some(m) if m.has_frame && included(c) => m,
                _ => continue,
            };
            let state = &row[c];
            if state.muted || (any_solo && !state.solo) {
                continue;
            }
            if out.is_stereo() {
                // gain then pan, per side
                let gains = [state.left(), state.right()];
                for (side, g) in gains.iter().enumerate() {
                    for (o, s) in out.channel_mut(side).iter_mut().zip(m.frame.channel(side)) {
                        *o += s * g;
                    }
                }
            } else {
                let g = state.get_gain();
                if m.frame.is_stereo() {
                    let left = m.frame.channel(0);
                    let right = m.frame.channel(1);
                    for (i, o) in out.channel_mut(0).iter_mut().enumerate() {
                        if i < left.len() {
                            *o += (left[i] + right[i]) * 0.5 * g;
                        }
                    }
                } else {
                    for (o, s) in out.channel_mut(0).iter_mut().zip(m.frame.channel(0)) {
                        *o += s * g;
                    }
                }
            }
        }
        for ch in 0..out.channels() {
            for v in out.channel_mut(ch).iter_mut() {
                *v = clip_float(*v);
            }
        }
        true
    }

    /// sequence number for the next mix packet going to this listener
    pub fn next_sequence(&mut self, listener_id: u32) -> u16 {
        let slot = match self.ids.get(&listener_id) {
            Some(s) => *s,
            None => return 0,
        };
        match &mut self.members[slot] {
            Some(m) => {
                let seq = m.seq;
                m.seq = m.seq.wrapping_add(1);
                seq
            }
            None => 0,
        }
    }

    /// A listener's whole mixer view, for status reports
    pub fn mixer_view(&self, listener_id: u32) -> serde_json::Value {
        let l = match self.ids.get(&listener_id) {
            Some(s) => *s,
            None => return serde_json::Value::Null,
        };
        let mut channels = vec![];
        for (c, m) in self.members.iter().enumerate() {
            if let Some(m) = m {
                let state = &self.matrix[l * self.max_clients + c];
                channels.push(json!({
                    "clientId": state.client_id,
                    "name": state.name,
                    "levelDb": to_db(m.level).round(),
                    "gainDb": to_db(state.get_gain()).round(),
                    "pan": state.get_pan(),
                    "muted": state.muted,
                    "solo": state.solo,
                }));
            }
        }
        json!({ "listener": listener_id, "channels": channels })
    }
}

impl fmt::Display for MixEngine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[ ")?;
        for m in self.members.iter().flatten() {
            write!(f, "{{ id: {}, addr: {}, ch: {} }} ", m.client_id, m.address, m.channels)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod test_mix_engine {
    use super::*;
    use crate::common::jitter_buffer::{JitterBuffer, JitterProducer};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn join(engine: &mut MixEngine, id: u32, channels: usize) -> JitterProducer {
        let (producer, consumer) = JitterBuffer::new(1).unwrap();
        engine
            .add_client(
                id,
                &format!("client {}", id),
                addr(9000 + id as u16),
                channels,
                AudioQuality::High,
                consumer,
            )
            .unwrap();
        producer
    }

    #[test]
    fn add_and_remove() {
        let mut engine = MixEngine::new(2, FrameSize::Samples128, true);
        let _a = join(&mut engine, 1, 2);
        let b = join(&mut engine, 2, 1);
        assert_eq!(engine.len(), 2);
        // full
        let (_p, consumer) = JitterBuffer::new(1).unwrap();
        assert!(engine
            .add_client(3, "late", addr(1), 2, AudioQuality::High, consumer)
            .is_err());
        assert!(engine.remove_client(2));
        assert!(!engine.remove_client(2));
        assert!(b.handle().is_closed());
        // the freed slot gets reused with fresh settings
        assert!(engine.apply(MixCommand::SetGain {
            listener: 1,
            contributor: 1,
            value: 0.1
        }));
        let _c = join(&mut engine, 3, 2);
        assert_eq!(engine.channel(1, 3).unwrap().get_gain(), 1.0);
        assert_eq!(engine.channel(3, 1).unwrap().client_id, 1);
        assert_eq!(engine.channel(1, 1).unwrap().get_gain(), 0.1);
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let mut engine = MixEngine::new(4, FrameSize::Samples128, true);
        let _a = join(&mut engine, 1, 2);
        let (_p, consumer) = JitterBuffer::new(1).unwrap();
        assert!(engine
            .add_client(1, "again", addr(2), 2, AudioQuality::High, consumer)
            .is_err());
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn settings_are_per_listener() {
        let mut engine = MixEngine::new(4, FrameSize::Samples128, true);
        let _a = join(&mut engine, 1, 2);
        let _b = join(&mut engine, 2, 2);
        assert!(engine.apply(MixCommand::SetMute {
            listener: 1,
            contributor: 2,
            value: true
        }));
        assert!(engine.channel(1, 2).unwrap().muted);
        assert!(!engine.channel(2, 2).unwrap().muted);
        assert!(!engine.apply(MixCommand::SetPan {
            listener: 1,
            contributor: 7,
            value: 0.5
        }));
        let view = engine.mixer_view(1);
        assert_eq!(view["channels"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn own_audio_follows_the_setting() {
        let mut engine = MixEngine::new(2, FrameSize::Samples64, false);
        let mut a = join(&mut engine, 1, 1);
        let frame = AudioFrame::capture(&[0.5; 64], None).unwrap();
        a.push(0, &frame);
        engine.pull_inputs();
        let mut out = AudioFrame::default();
        assert!(engine.compute_mix(1, &mut out));
        assert_eq!(out.len(), 64);
        assert_eq!(out.channels(), 1);
        assert_eq!(out.peak(), 0.0);

        engine.set_mix_own_audio(true);
        assert!(engine.compute_mix(1, &mut out));
        assert!((out.channel(0)[0] - 0.5).abs() < 1e-6);
        assert!(!engine.compute_mix(99, &mut out));
    }

    #[test]
    fn stereo_sources_fold_down_for_mono_listeners() {
        let mut engine = MixEngine::new(2, FrameSize::Samples64, true);
        let _mono = join(&mut engine, 1, 1);
        let mut stereo = join(&mut engine, 2, 2);
        let frame = AudioFrame::capture(&[0.4; 64], Some(&[0.2; 64])).unwrap();
        stereo.push(0, &frame);
        engine.pull_inputs();
        let mut out = AudioFrame::default();
        engine.compute_mix(1, &mut out);
        assert!((out.channel(0)[5] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn views_show_names_and_levels() {
        let mut engine = MixEngine::new(3, FrameSize::Samples64, true);
        let (_p, consumer) = JitterBuffer::new(1).unwrap();
        engine
            .add_client(1, "bass", addr(1), 1, AudioQuality::High, consumer)
            .unwrap();
        let (mut drums, consumer) = JitterBuffer::new(1).unwrap();
        engine
            .add_client(2, "drums", addr(2), 1, AudioQuality::High, consumer)
            .unwrap();
        // both directions carry the contributor's name
        assert_eq!(engine.channel(1, 2).unwrap().name, "drums");
        assert_eq!(engine.channel(2, 1).unwrap().name, "bass");

        drums.push(0, &AudioFrame::capture(&[0.5; 64], None).unwrap());
        engine.pull_inputs();
        assert_eq!(engine.member(2).unwrap().level(), 0.5);
        let view = engine.mixer_view(1);
        let channels = view["channels"].as_array().unwrap();
        assert_eq!(channels[0]["name"], "bass");
        assert_eq!(channels[0]["levelDb"], -100.0);
        assert_eq!(channels[1]["name"], "drums");
        assert_eq!(channels[1]["levelDb"], -6.0);

        // nothing new, the meter falls back slowly
        engine.pull_inputs();
        let level = engine.member(2).unwrap().level();
        assert!(level < 0.5 && level > 0.45);
    }

    #[test]
    fn listener_sequence_numbers() {
        let mut engine = MixEngine::new(2, FrameSize::Samples64, true);
        let _a = join(&mut engine, 1, 1);
        assert_eq!(engine.next_sequence(1), 0);
        assert_eq!(engine.next_sequence(1), 1);
        assert_eq!(engine.next_sequence(5), 0);
    }
}
