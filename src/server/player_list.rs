//! List of the clients connected to the mix server, as the network thread
//! sees them.
//!
//! Each player owns the producer half of its upstream jitter buffer, the
//! estimator sizing that buffer and the link watching for silence.  The
//! consumer half lives in the mix engine.
use log::{debug, info, trace};
use std::fmt;
use std::net::SocketAddr;

use crate::common::{
    audio_frame::FrameSize,
    delay_estimator::{DelayEstimator, EstimatorConfig},
    jam_error::CapacityError,
    jam_packet::{AudioQuality, JamPacket},
    jitter_buffer::{JitterBuffer, JitterConsumer, JitterHandle, JitterProducer, PushResult},
    link::{buffer_light, Link, LinkAction, LinkConfig},
};

///  structure that represents a player.  The players have
///
/// - client_id - assigned by the server when the handshake is accepted
/// - address - IP address to where we will send the personal mix
/// - link - watches for the player going silent
/// - the producer side of the player's upstream buffer and its estimator
pub struct Player {
    pub client_id: u32,
    pub address: SocketAddr,
    pub channels: usize,
    pub quality: AudioQuality,
    pub link: Link,
    frame_size: FrameSize,
    producer: JitterProducer,
    handle: JitterHandle,
    estimator: DelayEstimator,
    decode_errors: u64,
}

impl Player {
    /// Build a player and its buffer.  The consumer half goes to the mixer.
    pub fn new(
        now: u128,
        id: u32,
        addr: SocketAddr,
        channels: usize,
        quality: AudioQuality,
        capacity: usize,
        estimator_config: EstimatorConfig,
        link_config: LinkConfig,
    ) -> Result<(Player, JitterConsumer), CapacityError> {
        let (producer, consumer) = JitterBuffer::new(capacity)?;
        let player = Player {
            client_id: id,
            address: addr,
            channels: channels,
            quality: quality,
            link: Link::accepted(link_config, now),
            frame_size: estimator_config.frame_size,
            handle: producer.handle(),
            producer: producer,
            estimator: DelayEstimator::new(estimator_config),
            decode_errors: 0,
        };
        Ok((player, consumer))
    }
    pub fn capacity(&self) -> usize {
        self.handle.capacity()
    }
    pub fn is_auto(&self) -> bool {
        self.estimator.is_auto()
    }
    /// anything heard from the player keeps it alive
    pub fn heard(&mut self, now: u128) {
        self.link.heard(now);
    }

    /// An audio packet from this player
    pub fn push_audio(&mut self, now: u128, packet: &JamPacket) -> PushResult {
        self.link.heard(now);
        match packet.decode_audio() {
            Ok(frame) if frame.frame_size() != Some(self.frame_size) => {
                self.decode_errors += 1;
                trace!("client {}: wrong frame size", self.client_id);
                PushResult::OutOfWindow
            }
            Ok(frame) => {
                let seq = packet.get_sequence_num();
                let res = self.producer.push(seq, &frame);
                // late and early packets are exactly what the estimator needs to see
                if let PushResult::Stored | PushResult::OutOfWindow = res {
                    self.estimator.add_arrival(now, seq);
                }
                res
            }
            Err(e) => {
                self.decode_errors += 1;
                trace!("client {}: {}", self.client_id, e);
                PushResult::OutOfWindow
            }
        }
    }

    /// fixed capacity asked for by the player.  Turns auto sizing off.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<(), CapacityError> {
        self.handle.request_capacity(capacity)?;
        self.estimator.set_auto(false);
        Ok(())
    }
    pub fn set_auto(&mut self, auto: bool) {
        self.estimator.set_auto(auto);
    }

    /// let the estimator resize the buffer if it wants to
    pub fn evaluate(&mut self, now: u128) {
        let stats = self.handle.stats();
        let current = self.handle.capacity();
        if let Some(capacity) = self.estimator.evaluate(now, current, stats.underruns) {
            match self.handle.request_capacity(capacity) {
                Ok(()) => info!(
                    "client {}: buffer {} -> {} frames",
                    self.client_id, current, capacity
                ),
                Err(e) => debug!("client {}: {}", self.client_id, e),
            }
        }
    }

    /// stop taking audio.  The mixer drops its half on RemoveClient.
    pub fn close(&self) {
        self.handle.close();
    }

    pub fn stats(&self) -> serde_json::Value {
        let stats = self.handle.stats();
        serde_json::json!({
            "clientId": self.client_id,
            "address": self.address.to_string(),
            "capacity": stats.capacity,
            "fill": stats.fill,
            "dropouts": stats.window_dropouts,
            "dropoutRate": stats.dropout_rate(),
            "bufferLight": buffer_light(stats.dropout_rate()),
            "duplicates": stats.duplicates,
            "late": stats.out_of_window,
            "decodeErrors": self.decode_errors,
            "estimator": self.estimator.report(),
        })
    }
}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ id: {}, address: {}, ch: {}, buffer: {} }}",
            self.client_id,
            self.address,
            self.channels,
            self.handle.stats()
        )
    }
}

/// Structure to hold the list of players
pub struct PlayerList {
    players: Vec<Player>,
}

impl PlayerList {
    pub fn new() -> PlayerList {
        PlayerList { players: vec![] }
    }
    pub fn len(&self) -> usize {
        self.players.len()
    }
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
    pub fn add(&mut self, player: Player) {
        self.players.push(player);
    }
    /// players are found by the address their packets come from
    pub fn find(&mut self, addr: SocketAddr) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.address == addr)
    }
    pub fn get(&self, id: u32) -> Option<&Player> {
        self.players.iter().find(|p| p.client_id == id)
    }
    /// take a player out of the list and stop its buffer
    pub fn remove(&mut self, addr: SocketAddr) -> Option<Player> {
        let idx = self.players.iter().position(|p| p.address == addr)?;
        let player = self.players.remove(idx);
        player.close();
        Some(player)
    }
    /// Drop everybody whose link timed out.  Returns their ids so the mixer
    /// can forget them too.
    pub fn prune(&mut self, now: u128) -> Vec<u32> {
        let mut gone = vec![];
        for player in self.players.iter_mut() {
            if let Some(LinkAction::TimedOut) = player.link.poll(now) {
                player.close();
                gone.push(player.client_id);
            }
        }
        if !gone.is_empty() {
            self.players.retain(|p| !gone.contains(&p.client_id));
        }
        gone
    }
    pub fn evaluate(&mut self, now: u128) {
        for player in self.players.iter_mut() {
            player.evaluate(now);
        }
    }
    pub fn get_players(&self) -> &Vec<Player> {
        &self.players
    }

    /// Get a json representation of every player's buffer and link health
    pub fn get_latency(&self) -> serde_json::Value {
        let players: Vec<serde_json::Value> = self.players.iter().map(|p| p.stats()).collect();
        serde_json::json!({
            "players": players,
        })
    }
}

impl fmt::Display for PlayerList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[ ")?;
        for player in &self.players {
            write!(f, "{} ", player)?;
        }
        write!(f, "]")
    }
}
