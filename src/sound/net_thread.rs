//! Client network thread.
//!
//! Owns the receiving side of the socket and everything that is allowed to
//! take its time: the link state machine, the producer half of the downstream
//! jitter buffer and the delay estimator that sizes it.  It talks to the
//! audio callback only through [`EngineCommand`]s and the jitter buffer.
use log::{debug, info, trace, warn};
use serde_json::json;
use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    sync::mpsc,
    time::Duration,
};

use super::{backend::AudioFormat, jam_engine::EngineCommand};
use crate::common::{
    box_error::BoxError,
    delay_estimator::{DelayEstimator, EstimatorConfig},
    get_micro_time,
    jam_packet::{AudioQuality, ControlParam, JamPacket, PacketKind},
    jitter_buffer::{JitterHandle, JitterProducer, PushResult},
    link::{Link, LinkAction, LinkConfig},
    stream_time_stat::MicroTimer,
    transport::PacketTransport,
};

/// socket read timeout.  Also the loop period when nothing arrives.
const RECV_TIMEOUT_US: u64 = 1_000;
/// how often the link/buffer status goes out
pub const STATUS_INTERVAL: u128 = 1_000_000;

/// How a buffer should be sized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSetting {
    Auto,
    Frames(usize),
}

pub enum NetCommand {
    Connect(SocketAddr),
    Disconnect,
    /// a mix setting for my personal mix on the server
    Control {
        param: ControlParam,
        target: u32,
        value: f32,
    },
    SetBuffer(BufferSetting),
    SetServerBuffer(BufferSetting),
    /// the audio side was rebuilt with a fresh engine and downstream buffer
    AudioRestarted {
        producer: JitterProducer,
        engine_tx: mpsc::Sender<EngineCommand>,
    },
    Status,
    Stop,
}

pub struct ClientNet {
    format: AudioFormat,
    quality: AudioQuality,
    transport: Box<dyn PacketTransport>,
    link: Link,
    server: Option<SocketAddr>,
    client_id: u32,
    producer: JitterProducer,
    handle: JitterHandle,
    estimator: DelayEstimator,
    server_buffer: BufferSetting,
    name: String,
    xmit: JamPacket,
    engine_tx: mpsc::Sender<EngineCommand>,
    status_tx: mpsc::Sender<serde_json::Value>,
    status_timer: MicroTimer,
    running: bool,
}

impl ClientNet {
    pub fn new(
        format: AudioFormat,
        quality: AudioQuality,
        link_config: LinkConfig,
        estimator_config: EstimatorConfig,
        transport: Box<dyn PacketTransport>,
        producer: JitterProducer,
        engine_tx: mpsc::Sender<EngineCommand>,
        status_tx: mpsc::Sender<serde_json::Value>,
    ) -> ClientNet {
        ClientNet {
            format: format,
            quality: quality,
            transport: transport,
            link: Link::new(link_config),
            server: None,
            client_id: 0,
            handle: producer.handle(),
            producer: producer,
            estimator: DelayEstimator::new(estimator_config),
            server_buffer: BufferSetting::Auto,
            name: String::new(),
            xmit: JamPacket::new(PacketKind::Connect),
            engine_tx: engine_tx,
            status_tx: status_tx,
            status_timer: MicroTimer::new(get_micro_time(), STATUS_INTERVAL),
            running: true,
        }
    }
    /// Name the server shows on this client's channel.  Sent with each Connect.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.trim().to_string();
    }
    pub fn link(&self) -> &Link {
        &self.link
    }
    pub fn buffer(&self) -> &JitterHandle {
        &self.handle
    }
    pub fn estimator(&self) -> &DelayEstimator {
        &self.estimator
    }
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Receive loop.  Returns when told to stop or when the command channel
    /// goes away.
    pub fn run(
        &mut self,
        sock: UdpSocket,
        command_rx: mpsc::Receiver<NetCommand>,
    ) -> Result<(), BoxError> {
        sock.set_read_timeout(Some(Duration::from_micros(RECV_TIMEOUT_US)))?;
        let mut packet = JamPacket::new(PacketKind::Audio);
        while self.running {
            loop {
                match command_rx.try_recv() {
                    Ok(cmd) => self.handle_command(get_micro_time(), cmd),
                    Err(mpsc::TryRecvError::Empty) => break,
                    Err(mpsc::TryRecvError::Disconnected) => {
                        self.handle_command(get_micro_time(), NetCommand::Stop);
                        break;
                    }
                }
            }
            match sock.recv_from(packet.get_buffer()) {
                Ok((amt, src)) => {
                    if packet.is_valid(amt) {
                        packet.set_nbytes(amt)?;
                        self.handle_packet(get_micro_time(), &packet, src);
                    }
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut => (),
                    // ICMP port unreachable shows up here when the server is down
                    _ => trace!("client recv: {}", e),
                },
            }
            self.tick(get_micro_time());
        }
        debug!("client network thread exiting");
        Ok(())
    }

    pub fn handle_command(&mut self, now: u128, cmd: NetCommand) {
        match cmd {
            NetCommand::Connect(addr) => {
                if self.server.is_some() {
                    self.disconnect();
                }
                info!("connecting to {}", addr);
                self.server = Some(addr);
                self.client_id = 0;
                self.estimator.reset();
                // the new server numbers its mix from scratch
                self.handle.reset();
                let action = self.link.connect(now);
                self.act(now, action);
            }
            NetCommand::Disconnect => self.disconnect(),
            NetCommand::Control {
                param,
                target,
                value,
            } => self.send_control(param, target, value),
            NetCommand::SetBuffer(BufferSetting::Auto) => {
                info!("local buffer: auto");
                self.estimator.set_auto(true);
            }
            NetCommand::SetBuffer(BufferSetting::Frames(n)) => {
                self.estimator.set_auto(false);
                match self.handle.request_capacity(n) {
                    Ok(()) => info!("local buffer: {} frames", n),
                    Err(e) => {
                        warn!("{}", e);
                        let _ = self.status_tx.send(json!({ "bufferError": e.to_string() }));
                    }
                }
            }
            NetCommand::SetServerBuffer(setting) => {
                self.server_buffer = setting;
                match setting {
                    BufferSetting::Auto => self.send_control(ControlParam::AutoBuffer, 0, 1.0),
                    BufferSetting::Frames(n) => {
                        self.send_control(ControlParam::BufferCapacity, 0, n as f32)
                    }
                }
            }
            NetCommand::AudioRestarted {
                producer,
                engine_tx,
            } => {
                self.handle = producer.handle();
                self.producer = producer;
                self.engine_tx = engine_tx;
                self.estimator.reset();
                if let (Some(server), true) = (self.server, self.link.is_connected()) {
                    let _ = self.engine_tx.send(EngineCommand::Connected {
                        client_id: self.client_id,
                        server: server,
                    });
                }
            }
            NetCommand::Status => self.send_status(),
            NetCommand::Stop => {
                self.disconnect();
                self.running = false;
            }
        }
    }

    /// Something came in on the socket.  Only the server we are talking to
    /// gets listened to.
    pub fn handle_packet(&mut self, now: u128, packet: &JamPacket, src: SocketAddr) {
        if self.server != Some(src) {
            trace!("ignoring packet from {}", src);
            return;
        }
        match packet.get_kind() {
            Some(PacketKind::ConnectAck) => {
                match self.link.handle_ack(now, packet.get_extra()) {
                    Ok(Some(action)) => {
                        self.client_id = packet.get_client_id();
                        self.act(now, action);
                    }
                    Ok(None) => (),
                    Err(e) => {
                        warn!("{}", e);
                        self.server = None;
                        let _ = self.status_tx.send(json!({ "connectError": e.to_string() }));
                    }
                }
            }
            Some(PacketKind::Pong) => {
                self.link
                    .handle_pong(now, packet.get_timestamp(), packet.get_extra());
            }
            Some(PacketKind::Audio) => {
                if !self.link.is_connected() {
                    return;
                }
                self.link.heard(now);
                match packet.decode_audio() {
                    Ok(frame) => {
                        let seq = packet.get_sequence_num();
                        match self.producer.push(seq, &frame) {
                            PushResult::Stored | PushResult::OutOfWindow => {
                                self.estimator.add_arrival(now, seq)
                            }
                            PushResult::Duplicate => (),
                            PushResult::Closed => trace!("downstream buffer closed"),
                        }
                    }
                    Err(e) => trace!("bad audio packet: {}", e),
                }
            }
            Some(PacketKind::Disconnect) => {
                if self.link.is_connected() {
                    info!("server dropped us");
                    self.drop_link("server closed the connection");
                }
            }
            _ => trace!("unexpected packet {}", packet),
        }
    }

    /// Timers: handshake retries, pings, timeouts, buffer sizing and status
    pub fn tick(&mut self, now: u128) {
        if let Some(action) = self.link.poll(now) {
            self.act(now, action);
        }
        if self.link.is_connected() {
            let stats = self.handle.stats();
            let current = self.handle.capacity();
            if let Some(capacity) = self.estimator.evaluate(now, current, stats.underruns) {
                match self.handle.request_capacity(capacity) {
                    Ok(()) => info!("local buffer {} -> {} frames", current, capacity),
                    Err(e) => warn!("{}", e),
                }
            }
        }
        if self.status_timer.expired(now) {
            self.status_timer.reset(now);
            self.send_status();
        }
    }

    fn act(&mut self, now: u128, action: LinkAction) {
        let server = match self.server {
            Some(s) => s,
            None => return,
        };
        match action {
            LinkAction::SendConnect => {
                self.xmit.make_header_only(PacketKind::Connect);
                self.xmit.set_frame_size(self.format.frame_size);
                self.xmit.set_channels(self.format.channels as u8);
                self.xmit.set_quality(self.quality);
                self.xmit.set_client_id(0);
                self.xmit.set_timestamp(now as u64);
                self.xmit.set_extra(match self.server_buffer {
                    BufferSetting::Auto => 0,
                    BufferSetting::Frames(n) => n as u16,
                });
                if !self.name.is_empty() {
                    self.xmit.set_name(&self.name);
                }
                self.send(server);
            }
            LinkAction::SendPing => {
                self.xmit.make_header_only(PacketKind::Ping);
                self.xmit.set_client_id(self.client_id);
                self.xmit.set_timestamp(now as u64);
                self.send(server);
            }
            LinkAction::Connected => {
                info!("connected to {} as client {}", server, self.client_id);
                let _ = self.engine_tx.send(EngineCommand::Connected {
                    client_id: self.client_id,
                    server: server,
                });
                let _ = self.status_tx.send(json!({
                    "connected": { "server": server.to_string(), "clientId": self.client_id }
                }));
            }
            LinkAction::ConnectFailed(e) => {
                warn!("{}", e);
                self.server = None;
                let _ = self.status_tx.send(json!({ "connectError": e.to_string() }));
            }
            LinkAction::TimedOut => {
                warn!("lost the server at {}", server);
                self.drop_link("timed out");
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(server) = self.server {
            self.xmit.make_header_only(PacketKind::Disconnect);
            self.xmit.set_client_id(self.client_id);
            self.send(server);
            self.drop_link("disconnected");
        }
    }

    fn drop_link(&mut self, reason: &str) {
        self.link.close();
        self.server = None;
        let _ = self.engine_tx.send(EngineCommand::Disconnected);
        let _ = self.status_tx.send(json!({ "disconnected": reason }));
    }

    fn send_control(&mut self, param: ControlParam, target: u32, value: f32) {
        let server = match self.server {
            Some(s) if self.link.is_connected() => s,
            _ => {
                warn!("not connected, dropping {:?} setting", param);
                return;
            }
        };
        self.xmit.encode_control(param, target, value);
        self.xmit.set_client_id(self.client_id);
        self.send(server);
    }

    fn send(&mut self, addr: SocketAddr) {
        if let Err(e) = self.transport.send_to(&self.xmit, addr) {
            trace!("send to {} failed: {}", addr, e);
        }
    }

    pub fn status(&self) -> serde_json::Value {
        let stats = self.handle.stats();
        json!({
            "link": self.link.health(&stats, self.format.frame_size),
            "buffer": stats,
            "estimator": self.estimator.report(),
            "clientId": self.client_id,
            "server": self.server.map(|s| s.to_string()),
        })
    }

    fn send_status(&mut self) {
        let _ = self.status_tx.send(self.status());
    }
}
