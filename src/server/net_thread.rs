//! Server network thread.
//!
//! Receives everything that comes in on the server socket.  It runs the
//! handshake, answers pings, feeds each client's upstream jitter buffer and
//! turns mix settings into [`MixCommand`]s for the mix thread.  It never
//! touches the mix itself.
use log::{debug, info, trace, warn};
use serde_json::json;
use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    sync::mpsc,
    time::Duration,
};

use super::{
    mix_engine::MixCommand,
    player_list::{Player, PlayerList},
};
use crate::common::{
    box_error::BoxError,
    get_micro_time,
    jam_error::ConnectError,
    jam_packet::{ControlParam, JamPacket, PacketKind},
    jitter_buffer::{PushResult, MAX_CAPACITY, MIN_CAPACITY},
    link::LinkConfig,
    settings::JamSettings,
    stream_time_stat::MicroTimer,
    transport::PacketTransport,
};

const RECV_TIMEOUT_US: u64 = 1_000;
/// how often the per client report goes out
pub const STATUS_INTERVAL: u128 = 2_000_000;

pub struct ServerNet {
    settings: JamSettings,
    link_config: LinkConfig,
    transport: Box<dyn PacketTransport>,
    players: PlayerList,
    mix_tx: mpsc::Sender<MixCommand>,
    status_tx: mpsc::Sender<serde_json::Value>,
    next_id: u32,
    xmit: JamPacket,
    status_timer: MicroTimer,
    running: bool,
}

impl ServerNet {
    pub fn new(
        settings: JamSettings,
        transport: Box<dyn PacketTransport>,
        mix_tx: mpsc::Sender<MixCommand>,
        status_tx: mpsc::Sender<serde_json::Value>,
    ) -> ServerNet {
        ServerNet {
            link_config: LinkConfig::server().with_timeout_ms(settings.link_timeout_ms as u64),
            settings: settings,
            transport: transport,
            players: PlayerList::new(),
            mix_tx: mix_tx,
            status_tx: status_tx,
            next_id: 1,
            xmit: JamPacket::new(PacketKind::ConnectAck),
            status_timer: MicroTimer::new(get_micro_time(), STATUS_INTERVAL),
            running: true,
        }
    }
    pub fn players(&self) -> &PlayerList {
        &self.players
    }
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Receive loop.  Only returns on a socket error or when the mix thread
    /// has gone away.
    pub fn run(&mut self, sock: UdpSocket) -> Result<(), BoxError> {
        sock.set_read_timeout(Some(Duration::from_micros(RECV_TIMEOUT_US)))?;
        let mut packet = JamPacket::new(PacketKind::Audio);
        while self.running {
            match sock.recv_from(packet.get_buffer()) {
                Ok((amt, src)) => {
                    if packet.is_valid(amt) {
                        packet.set_nbytes(amt)?;
                        self.handle_packet(get_micro_time(), &packet, src);
                    } else {
                        trace!("runt packet {} bytes from {}", amt, src);
                    }
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut => (),
                    // a client that went away without saying so
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused => {
                        trace!("server recv: {}", e)
                    }
                    _ => return Err(e.into()),
                },
            }
            self.tick(get_micro_time());
        }
        debug!("server network thread exiting");
        Ok(())
    }

    pub fn handle_packet(&mut self, now: u128, packet: &JamPacket, src: SocketAddr) {
        match packet.get_kind() {
            Some(PacketKind::Connect) => self.handle_connect(now, packet, src),
            Some(PacketKind::Audio) => {
                if let Some(player) = self.players.find(src) {
                    if player.push_audio(now, packet) == PushResult::Closed {
                        trace!("client {} buffer closed", player.client_id);
                    }
                }
            }
            Some(PacketKind::Ping) => {
                let (id, capacity) = match self.players.find(src) {
                    Some(player) => {
                        player.heard(now);
                        (player.client_id, player.capacity())
                    }
                    None => return,
                };
                self.xmit.make_header_only(PacketKind::Pong);
                self.xmit.set_client_id(id);
                self.xmit.set_timestamp(packet.get_timestamp());
                self.xmit.set_extra(capacity as u16);
                self.send(src);
            }
            Some(PacketKind::Control) => self.handle_control(now, packet, src),
            Some(PacketKind::Disconnect) => {
                if let Some(player) = self.players.remove(src) {
                    info!("client {} at {} disconnected", player.client_id, src);
                    self.tell_mixer(MixCommand::RemoveClient(player.client_id));
                }
            }
            _ => trace!("unexpected packet from {}: {}", src, packet),
        }
    }

    fn handle_connect(&mut self, now: u128, packet: &JamPacket, src: SocketAddr) {
        if let Some(player) = self.players.find(src) {
            // our ack got lost, say it again
            player.heard(now);
            let id = player.client_id;
            self.send_ack(src, id, 0);
            return;
        }
        if let Err(e) = self.check_format(packet) {
            warn!("refusing {}: {}", src, e);
            self.send_ack(src, 0, e as u16);
            return;
        }
        if self.players.len() >= self.settings.max_clients {
            warn!("refusing {}: {} clients already", src, self.players.len());
            self.send_ack(src, 0, ConnectError::ServerFull as u16);
            return;
        }
        let channels = packet.get_channels() as usize;
        let quality = packet.get_quality().unwrap_or_default();
        let mut estimator_config = self.settings.estimator_config();
        let capacity = match packet.get_extra() as usize {
            0 => self.settings.buffer_capacity,
            n => {
                estimator_config.auto = false;
                n.clamp(MIN_CAPACITY, MAX_CAPACITY)
            }
        };
        let id = self.next_id;
        let (player, consumer) = match Player::new(
            now,
            id,
            src,
            channels,
            quality,
            capacity,
            estimator_config,
            self.link_config.clone(),
        ) {
            Ok(p) => p,
            Err(e) => {
                warn!("refusing {}: {}", src, e);
                self.send_ack(src, 0, ConnectError::UnsupportedFormat as u16);
                return;
            }
        };
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let name = match packet.get_name() {
            n if n.is_empty() => format!("client {}", id),
            n => n,
        };
        info!(
            "client {} joined from {} as {}: {}ch {:?}, buffer {}",
            id, src, name, channels, quality, capacity
        );
        self.tell_mixer(MixCommand::AddClient {
            client_id: id,
            name: name,
            address: src,
            channels: channels,
            quality: quality,
            consumer: consumer,
        });
        self.players.add(player);
        self.send_ack(src, id, 0);
    }

    /// everybody has to run the session's frame size
    fn check_format(&self, packet: &JamPacket) -> Result<(), ConnectError> {
        if packet.get_frame_size() != Some(self.settings.frame_size) {
            return Err(ConnectError::UnsupportedFormat);
        }
        let channels = packet.get_channels();
        if channels < 1 || channels > 2 {
            return Err(ConnectError::UnsupportedFormat);
        }
        if packet.get_quality().is_none() {
            return Err(ConnectError::UnsupportedFormat);
        }
        Ok(())
    }

    fn handle_control(&mut self, now: u128, packet: &JamPacket, src: SocketAddr) {
        let player = match self.players.find(src) {
            Some(p) => p,
            None => return,
        };
        player.heard(now);
        let listener = player.client_id;
        let (param, target, value) = match packet.decode_control() {
            Ok(c) => c,
            Err(e) => {
                debug!("client {}: {}", listener, e);
                return;
            }
        };
        let cmd = match param {
            ControlParam::Gain => MixCommand::SetGain {
                listener: listener,
                contributor: target,
                value: value,
            },
            ControlParam::Pan => MixCommand::SetPan {
                listener: listener,
                contributor: target,
                value: value,
            },
            ControlParam::Mute => MixCommand::SetMute {
                listener: listener,
                contributor: target,
                value: value != 0.0,
            },
            ControlParam::Solo => MixCommand::SetSolo {
                listener: listener,
                contributor: target,
                value: value != 0.0,
            },
            ControlParam::BufferCapacity => {
                match player.set_capacity(value as usize) {
                    Ok(()) => info!("client {}: buffer set to {}", listener, value as usize),
                    Err(e) => warn!("client {}: {}", listener, e),
                }
                return;
            }
            ControlParam::AutoBuffer => {
                player.set_auto(value != 0.0);
                info!("client {}: auto buffer {}", listener, value != 0.0);
                return;
            }
        };
        self.tell_mixer(cmd);
    }

    /// Timeouts, buffer sizing and the periodic report
    pub fn tick(&mut self, now: u128) {
        for id in self.players.prune(now) {
            info!("client {} timed out", id);
            self.tell_mixer(MixCommand::RemoveClient(id));
        }
        self.players.evaluate(now);
        if self.status_timer.expired(now) {
            self.status_timer.reset(now);
            let _ = self.status_tx.send(self.status());
        }
    }

    pub fn status(&self) -> serde_json::Value {
        json!({
            "clients": self.players.len(),
            "maxClients": self.settings.max_clients,
            "latency": self.players.get_latency(),
        })
    }

    fn tell_mixer(&mut self, cmd: MixCommand) {
        if self.mix_tx.send(cmd).is_err() {
            warn!("mix thread is gone");
            self.running = false;
        }
    }

    fn send_ack(&mut self, addr: SocketAddr, client_id: u32, status: u16) {
        self.xmit.make_header_only(PacketKind::ConnectAck);
        self.xmit.set_frame_size(self.settings.frame_size);
        self.xmit.set_client_id(client_id);
        self.xmit.set_extra(status);
        self.xmit.set_timestamp(get_micro_time() as u64);
        self.send(addr);
    }

    fn send(&mut self, addr: SocketAddr) {
        if let Err(e) = self.transport.send_to(&self.xmit, addr) {
            trace!("send to {} failed: {}", addr, e);
        }
    }
}

#[cfg(test)]
mod test_server_net {
    use super::*;
    use crate::common::{
        audio_frame::{AudioFrame, FrameSize},
        config::Config,
        jam_packet::AudioQuality,
        settings,
        transport::{recording_transport, SentLog},
    };
    use crate::server::mix_engine::MixEngine;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn settings(max_clients: u32) -> JamSettings {
        let mut config = Config::build(String::from("not_there.json"), settings::defaults()).unwrap();
        config.set_value("max_clients", max_clients).unwrap();
        JamSettings::from_config(&config).unwrap()
    }

    struct Rig {
        net: ServerNet,
        sent: SentLog,
        mix_rx: mpsc::Receiver<MixCommand>,
        status_rx: mpsc::Receiver<serde_json::Value>,
    }

    fn rig(max_clients: u32) -> Rig {
        let (transport, sent) = recording_transport();
        let (mix_tx, mix_rx) = mpsc::channel();
        let (status_tx, status_rx) = mpsc::channel();
        Rig {
            net: ServerNet::new(settings(max_clients), Box::new(transport), mix_tx, status_tx),
            sent: sent,
            mix_rx: mix_rx,
            status_rx: status_rx,
        }
    }

    fn connect_packet(frame_size: FrameSize, channels: u8, buffer: u16) -> JamPacket {
        let mut packet = JamPacket::new(PacketKind::Connect);
        packet.make_header_only(PacketKind::Connect);
        packet.set_frame_size(frame_size);
        packet.set_channels(channels);
        packet.set_quality(AudioQuality::High);
        packet.set_extra(buffer);
        packet
    }

    fn last_sent(sent: &SentLog) -> (JamPacket, SocketAddr) {
        sent.lock().unwrap().last().unwrap().clone()
    }

    #[test]
    fn handshake_adds_a_client() {
        let mut r = rig(4);
        let packet = connect_packet(FrameSize::Samples128, 2, 0);
        r.net.handle_packet(0, &packet, addr(5000));
        let (ack, to) = last_sent(&r.sent);
        assert_eq!(to, addr(5000));
        assert_eq!(ack.get_kind(), Some(PacketKind::ConnectAck));
        assert_eq!(ack.get_extra(), 0);
        assert_eq!(ack.get_client_id(), 1);
        match r.mix_rx.try_recv() {
            Ok(MixCommand::AddClient {
                client_id,
                name,
                address,
                channels,
                ..
            }) => {
                assert_eq!(client_id, 1);
                assert_eq!(name, "client 1");
                assert_eq!(address, addr(5000));
                assert_eq!(channels, 2);
            }
            _ => panic!("expected AddClient"),
        }
        assert_eq!(r.net.players().len(), 1);
        assert!(r.net.players().get(1).unwrap().is_auto());

        // repeated connect just gets the ack again
        r.net.handle_packet(1_000, &packet, addr(5000));
        assert_eq!(last_sent(&r.sent).0.get_client_id(), 1);
        assert!(r.mix_rx.try_recv().is_err());

        // next one gets the next id, with the buffer it asked for
        r.net
            .handle_packet(2_000, &connect_packet(FrameSize::Samples128, 1, 6), addr(5001));
        assert_eq!(last_sent(&r.sent).0.get_client_id(), 2);
        let second = r.net.players().get(2).unwrap();
        assert_eq!(second.capacity(), 6);
        assert!(!second.is_auto());
    }

    #[test]
    fn connect_name_labels_the_channel() {
        let mut r = rig(4);
        let mut packet = connect_packet(FrameSize::Samples128, 1, 0);
        packet.set_name("  sax ");
        r.net.handle_packet(0, &packet, addr(5000));
        r.net
            .handle_packet(0, &connect_packet(FrameSize::Samples128, 1, 0), addr(5001));
        let mut engine = MixEngine::new(4, FrameSize::Samples128, true);
        while let Ok(cmd) = r.mix_rx.try_recv() {
            assert!(engine.apply(cmd));
        }
        let view = engine.mixer_view(2);
        let channels = view["channels"].as_array().unwrap();
        assert_eq!(channels[0]["name"], "sax");
        assert_eq!(channels[1]["name"], "client 2");
    }

    #[test]
    fn refuses_wrong_format_and_full_server() {
        let mut r = rig(1);
        r.net
            .handle_packet(0, &connect_packet(FrameSize::Samples64, 2, 0), addr(5000));
        let (ack, _) = last_sent(&r.sent);
        assert_eq!(ack.get_extra(), ConnectError::UnsupportedFormat as u16);

        r.net
            .handle_packet(0, &connect_packet(FrameSize::Samples128, 3, 0), addr(5000));
        assert_eq!(last_sent(&r.sent).0.get_extra(), ConnectError::UnsupportedFormat as u16);

        r.net
            .handle_packet(0, &connect_packet(FrameSize::Samples128, 2, 0), addr(5000));
        assert_eq!(last_sent(&r.sent).0.get_extra(), 0);
        r.net
            .handle_packet(0, &connect_packet(FrameSize::Samples128, 2, 0), addr(5001));
        let (ack, to) = last_sent(&r.sent);
        assert_eq!(to, addr(5001));
        assert_eq!(ack.get_extra(), ConnectError::ServerFull as u16);
        assert_eq!(r.net.players().len(), 1);
    }

    #[test]
    fn pong_echoes_the_timestamp() {
        let mut r = rig(4);
        r.net
            .handle_packet(0, &connect_packet(FrameSize::Samples128, 2, 0), addr(5000));
        let mut ping = JamPacket::new(PacketKind::Ping);
        ping.set_timestamp(123_456);
        r.net.handle_packet(10_000, &ping, addr(5000));
        let (pong, to) = last_sent(&r.sent);
        assert_eq!(to, addr(5000));
        assert_eq!(pong.get_kind(), Some(PacketKind::Pong));
        assert_eq!(pong.get_timestamp(), 123_456);
        assert_eq!(pong.get_extra() as usize, settings(4).buffer_capacity);

        // strangers don't get answers
        let count = r.sent.lock().unwrap().len();
        r.net.handle_packet(10_000, &ping, addr(6000));
        assert_eq!(r.sent.lock().unwrap().len(), count);
    }

    #[test]
    fn controls_become_mix_commands() {
        let mut r = rig(4);
        r.net
            .handle_packet(0, &connect_packet(FrameSize::Samples128, 2, 0), addr(5000));
        let _ = r.mix_rx.try_recv();

        let mut control = JamPacket::new(PacketKind::Control);
        control.encode_control(ControlParam::Gain, 7, 0.25);
        r.net.handle_packet(1_000, &control, addr(5000));
        match r.mix_rx.try_recv() {
            Ok(MixCommand::SetGain {
                listener,
                contributor,
                value,
            }) => {
                assert_eq!(listener, 1);
                assert_eq!(contributor, 7);
                assert_eq!(value, 0.25);
            }
            _ => panic!("expected SetGain"),
        }
        control.encode_control(ControlParam::Solo, 7, 1.0);
        r.net.handle_packet(1_000, &control, addr(5000));
        match r.mix_rx.try_recv() {
            Ok(MixCommand::SetSolo { value, .. }) => assert!(value),
            _ => panic!("expected SetSolo"),
        }

        // buffer settings stay on this side
        control.encode_control(ControlParam::BufferCapacity, 0, 9.0);
        r.net.handle_packet(1_000, &control, addr(5000));
        assert!(r.mix_rx.try_recv().is_err());
        assert_eq!(r.net.players().get(1).unwrap().capacity(), 9);
        assert!(!r.net.players().get(1).unwrap().is_auto());
        control.encode_control(ControlParam::AutoBuffer, 0, 1.0);
        r.net.handle_packet(1_000, &control, addr(5000));
        assert!(r.net.players().get(1).unwrap().is_auto());
    }

    #[test]
    fn disconnect_and_timeout_remove_clients() {
        let mut r = rig(4);
        r.net
            .handle_packet(0, &connect_packet(FrameSize::Samples128, 2, 0), addr(5000));
        r.net
            .handle_packet(0, &connect_packet(FrameSize::Samples128, 2, 0), addr(5001));
        while r.mix_rx.try_recv().is_ok() {}

        r.net
            .handle_packet(100_000, &JamPacket::new(PacketKind::Disconnect), addr(5000));
        match r.mix_rx.try_recv() {
            Ok(MixCommand::RemoveClient(id)) => assert_eq!(id, 1),
            _ => panic!("expected RemoveClient"),
        }

        // client 2 keeps sending audio for a while, then goes quiet
        let frame = AudioFrame::capture(&[0.1; 128], Some(&[0.1; 128])).unwrap();
        let mut audio = JamPacket::new(PacketKind::Audio);
        audio.encode_audio(&frame, AudioQuality::High);
        audio.set_sequence_num(0);
        r.net.handle_packet(500_000, &audio, addr(5001));
        r.net.tick(1_000_000);
        assert_eq!(r.net.players().len(), 1);
        r.net.tick(1_600_000);
        assert!(r.net.players().is_empty());
        match r.mix_rx.try_recv() {
            Ok(MixCommand::RemoveClient(id)) => assert_eq!(id, 2),
            _ => panic!("expected RemoveClient"),
        }
    }

    #[test]
    fn status_report() {
        let mut r = rig(4);
        let now = get_micro_time();
        r.net
            .handle_packet(now, &connect_packet(FrameSize::Samples128, 2, 0), addr(5000));
        // keep it alive until the report is due
        r.net
            .handle_packet(now + STATUS_INTERVAL, &JamPacket::new(PacketKind::Ping), addr(5000));
        r.net.tick(now + STATUS_INTERVAL + 1);
        let status = r.status_rx.try_recv().unwrap();
        assert_eq!(status["maxClients"], 4);
        assert_eq!(status["latency"]["players"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn mixer_gone_stops_the_thread() {
        let mut r = rig(4);
        drop(r.mix_rx);
        r.net
            .handle_packet(0, &connect_packet(FrameSize::Samples128, 2, 0), addr(5000));
        assert!(!r.net.is_running());
    }
}
