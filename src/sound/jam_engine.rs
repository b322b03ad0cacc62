//! the JamEngine is the client side audio callback.
//!
//! Every frame it plays back the next frame of the personal mix coming home
//! from the server, and (while connected) ships the captured input up to the
//! server.  The network thread owns the other half of the downstream jitter
//! buffer and all the receiving, so nothing in here blocks.
use log::{error, info, trace};
use serde_json::json;
use std::{net::SocketAddr, sync::mpsc};

use super::{backend::AudioFormat, SoundCallback};
use crate::common::{
    audio_frame::AudioFrame,
    box_error::BoxError,
    get_micro_time,
    jam_error::AudioIoError,
    jam_packet::{AudioQuality, JamPacket, PacketKind},
    jitter_buffer::JitterConsumer,
    stream_time_stat::{MicroTimer, StreamTimeStat},
    transport::PacketTransport,
};

/// how often the engine reports on itself
pub const ENGINE_STATUS_INTERVAL: u128 = 1_000_000;

/// Commands from the control side.  They are picked up at the top of the
/// next callback so nothing in the audio path needs a lock.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    Connected { client_id: u32, server: SocketAddr },
    Disconnected,
    SetQuality(AudioQuality),
    /// the backend went bad.  Output silence until reset.
    Halt(AudioIoError),
    ResetAudio,
}

pub struct JamEngine {
    format: AudioFormat,
    quality: AudioQuality,
    transport: Box<dyn PacketTransport>,
    downstream: JitterConsumer,
    command_rx: mpsc::Receiver<EngineCommand>,
    status_tx: mpsc::Sender<serde_json::Value>,
    server: Option<SocketAddr>,
    client_id: u32,
    seq: u16,
    xmit: JamPacket,
    halted: Option<AudioIoError>,
    now: u128,
    last_tick: u128,
    tick_stat: StreamTimeStat,
    status_timer: MicroTimer,
    frames_sent: u64,
    send_errors: u64,
}

impl JamEngine {
    /// `transport` sends the captured audio, `downstream` is the consumer
    /// half of the buffer the network thread fills with the mix.
    pub fn new(
        format: AudioFormat,
        quality: AudioQuality,
        transport: Box<dyn PacketTransport>,
        downstream: JitterConsumer,
        command_rx: mpsc::Receiver<EngineCommand>,
        status_tx: mpsc::Sender<serde_json::Value>,
    ) -> JamEngine {
        let now = get_micro_time();
        JamEngine {
            format: format,
            quality: quality,
            transport: transport,
            downstream: downstream,
            command_rx: command_rx,
            status_tx: status_tx,
            server: None,
            client_id: 0,
            seq: 0,
            xmit: JamPacket::new(PacketKind::Audio),
            halted: None,
            now: now,
            last_tick: 0,
            tick_stat: StreamTimeStat::new(100),
            status_timer: MicroTimer::new(now, ENGINE_STATUS_INTERVAL),
            frames_sent: 0,
            send_errors: 0,
        }
    }
    pub fn is_connected(&self) -> bool {
        self.server.is_some()
    }
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    fn check_commands(&mut self) {
        while let Ok(cmd) = self.command_rx.try_recv() {
            trace!("engine command: {:?}", cmd);
            match cmd {
                EngineCommand::Connected { client_id, server } => {
                    info!("engine: sending to {} as client {}", server, client_id);
                    self.server = Some(server);
                    self.client_id = client_id;
                    self.seq = 0;
                }
                EngineCommand::Disconnected => {
                    self.server = None;
                }
                EngineCommand::SetQuality(q) => {
                    self.quality = q;
                }
                EngineCommand::Halt(err) => {
                    self.halt(err);
                }
                EngineCommand::ResetAudio => {
                    if self.halted.take().is_some() {
                        info!("engine: audio reset, running again");
                    }
                }
            }
        }
    }

    fn halt(&mut self, err: AudioIoError) {
        error!("engine halted: {}", err);
        let _ = self.status_tx.send(json!({ "audioError": err.to_string() }));
        self.halted = Some(err);
    }

    fn send_capture(&mut self, in_a: &[f32], in_b: &[f32]) -> Result<(), BoxError> {
        let server = match self.server {
            Some(s) => s,
            None => return Ok(()),
        };
        let right = if self.format.channels > 1 { Some(in_b) } else { None };
        let frame = AudioFrame::capture(in_a, right)?;
        self.xmit.encode_audio(&frame, self.quality);
        self.xmit.set_client_id(self.client_id);
        self.xmit.set_sequence_num(self.seq);
        self.xmit.set_timestamp(self.now as u64);
        self.seq = self.seq.wrapping_add(1);
        match self.transport.send_to(&self.xmit, server) {
            Ok(_) => self.frames_sent += 1,
            Err(e) => {
                // the link state machine notices a dead server, not us
                self.send_errors += 1;
                trace!("audio send failed: {}", e);
            }
        }
        Ok(())
    }

    fn send_status(&mut self) {
        let _ = self.status_tx.send(json!({
            "engine": {
                "connected": self.is_connected(),
                "clientId": self.client_id,
                "framesSent": self.frames_sent,
                "sendErrors": self.send_errors,
                "tickMeanUs": self.tick_stat.get_mean().round(),
                "tickSigmaUs": self.tick_stat.get_sigma().round(),
                "halted": self.halted.as_ref().map(|e| e.to_string()),
            }
        }));
    }
}

fn silence(out_a: &mut [f32], out_b: &mut [f32]) {
    out_a.fill(0.0);
    out_b.fill(0.0);
}

impl SoundCallback for JamEngine {
    fn process(
        &mut self,
        in_a: &[f32],
        in_b: &[f32],
        out_a: &mut [f32],
        out_b: &mut [f32],
    ) -> Result<(), BoxError> {
        self.now = get_micro_time();
        if self.last_tick > 0 {
            self.tick_stat
                .add_sample(self.now.saturating_sub(self.last_tick) as f64);
        }
        self.last_tick = self.now;
        self.check_commands();
        if self.status_timer.expired(self.now) {
            self.status_timer.reset(self.now);
            self.send_status();
        }
        if self.halted.is_some() {
            silence(out_a, out_b);
            return Ok(());
        }
        let samples = self.format.frame_size.samples();
        if in_a.len() != samples || in_b.len() != samples || out_a.len() != samples {
            silence(out_a, out_b);
            self.halt(AudioIoError::FormatUnsupported(format!(
                "callback delivered {} samples, opened with {}",
                in_a.len(),
                samples
            )));
            return Ok(());
        }
        // playback first so the delay through the buffer stays at its capacity
        match self.downstream.pop() {
            Some(frame) => frame.write_out(out_a, out_b),
            None => silence(out_a, out_b),
        }
        self.send_capture(in_a, in_b)
    }
}

#[cfg(test)]
mod test_jam_engine {
    use super::*;
    use crate::common::{
        audio_frame::FrameSize,
        jitter_buffer::{JitterBuffer, JitterProducer},
        transport::MockPacketTransport,
    };
    use std::sync::{Arc, Mutex};

    struct Rig {
        engine: JamEngine,
        producer: JitterProducer,
        command_tx: mpsc::Sender<EngineCommand>,
        status_rx: mpsc::Receiver<serde_json::Value>,
    }

    fn rig(transport: MockPacketTransport, channels: usize) -> Rig {
        let (producer, consumer) = JitterBuffer::new(2).unwrap();
        let (command_tx, command_rx) = mpsc::channel();
        let (status_tx, status_rx) = mpsc::channel();
        let engine = JamEngine::new(
            AudioFormat::new(FrameSize::Samples128, channels),
            AudioQuality::High,
            Box::new(transport),
            consumer,
            command_rx,
            status_tx,
        );
        Rig {
            engine,
            producer,
            command_tx,
            status_rx,
        }
    }

    fn server() -> SocketAddr {
        "127.0.0.1:7891".parse().unwrap()
    }

    fn tick(engine: &mut JamEngine, level: f32) -> ([f32; 128], [f32; 128]) {
        let in_a = [level; 128];
        let in_b = [-level; 128];
        let mut out_a = [1.0; 128];
        let mut out_b = [1.0; 128];
        engine
            .process(&in_a, &in_b, &mut out_a, &mut out_b)
            .unwrap();
        (out_a, out_b)
    }

    #[test]
    fn sends_only_while_connected() {
        let mut transport = MockPacketTransport::new();
        let seqs = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&seqs);
        transport
            .expect_send_to()
            .withf(|packet, addr| {
                *addr == server() && packet.get_client_id() == 9 && packet.get_channels() == 2
            })
            .times(3)
            .returning(move |packet, _| {
                seen.lock().unwrap().push(packet.get_sequence_num());
                Ok(packet.get_nbytes())
            });
        let mut rig = rig(transport, 2);
        tick(&mut rig.engine, 0.5);
        assert!(!rig.engine.is_connected());

        rig.command_tx
            .send(EngineCommand::Connected {
                client_id: 9,
                server: server(),
            })
            .unwrap();
        for _ in 0..3 {
            tick(&mut rig.engine, 0.5);
        }
        assert_eq!(rig.engine.frames_sent(), 3);
        assert_eq!(*seqs.lock().unwrap(), vec![0, 1, 2]);
        rig.command_tx.send(EngineCommand::Disconnected).unwrap();
        tick(&mut rig.engine, 0.5);
        assert_eq!(rig.engine.frames_sent(), 3);
    }

    #[test]
    fn mono_capture_sends_one_channel() {
        let mut transport = MockPacketTransport::new();
        transport
            .expect_send_to()
            .withf(|packet, _| packet.get_channels() == 1)
            .times(1)
            .returning(|_, _| Ok(0));
        let mut rig = rig(transport, 1);
        rig.command_tx
            .send(EngineCommand::Connected {
                client_id: 1,
                server: server(),
            })
            .unwrap();
        tick(&mut rig.engine, 0.25);
    }

    #[test]
    fn plays_back_the_mix_or_silence() {
        let mut rig = rig(MockPacketTransport::new(), 2);
        // nothing buffered: silence, not whatever was in the output
        let (out_a, out_b) = tick(&mut rig.engine, 0.0);
        assert!(out_a.iter().all(|v| *v == 0.0));
        assert!(out_b.iter().all(|v| *v == 0.0));

        let left = [0.5f32; 128];
        let right = [-0.25f32; 128];
        let frame = AudioFrame::capture(&left, Some(&right)).unwrap();
        rig.producer.push(0, &frame);
        rig.producer.push(1, &frame);
        let (out_a, out_b) = tick(&mut rig.engine, 0.0);
        assert_eq!(out_a[10], 0.5);
        assert_eq!(out_b[10], -0.25);
    }

    #[test]
    fn send_errors_are_absorbed() {
        let mut transport = MockPacketTransport::new();
        transport
            .expect_send_to()
            .times(2)
            .returning(|_, _| Err("network is unreachable".into()));
        let mut rig = rig(transport, 2);
        rig.command_tx
            .send(EngineCommand::Connected {
                client_id: 1,
                server: server(),
            })
            .unwrap();
        tick(&mut rig.engine, 0.1);
        tick(&mut rig.engine, 0.1);
        assert_eq!(rig.engine.frames_sent(), 0);
    }

    #[test]
    fn halts_until_reset() {
        let mut transport = MockPacketTransport::new();
        transport.expect_send_to().times(1).returning(|_, _| Ok(0));
        let mut rig = rig(transport, 2);
        rig.command_tx
            .send(EngineCommand::Connected {
                client_id: 1,
                server: server(),
            })
            .unwrap();
        // wrong size buffers from the device
        let in_a = [0.1f32; 64];
        let mut out_a = [1.0f32; 64];
        let mut out_b = [1.0f32; 64];
        rig.engine
            .process(&in_a, &in_a, &mut out_a, &mut out_b)
            .unwrap();
        assert!(rig.engine.is_halted());
        assert!(out_a.iter().all(|v| *v == 0.0));
        let mut saw_error = false;
        while let Ok(msg) = rig.status_rx.try_recv() {
            if msg["audioError"].is_string() {
                saw_error = true;
            }
        }
        assert!(saw_error);

        // halted: correct buffers still don't go out
        tick(&mut rig.engine, 0.1);
        rig.command_tx.send(EngineCommand::ResetAudio).unwrap();
        tick(&mut rig.engine, 0.1);
        assert!(!rig.engine.is_halted());
        assert_eq!(rig.engine.frames_sent(), 1);

        rig.command_tx
            .send(EngineCommand::Halt(AudioIoError::DeviceLost(String::from("unplugged"))))
            .unwrap();
        tick(&mut rig.engine, 0.1);
        assert!(rig.engine.is_halted());
    }
}
