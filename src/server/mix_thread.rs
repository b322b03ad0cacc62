//! The mix thread callback.
//!
//! Runs on the server's software clock.  Each tick applies whatever session
//! changes the network thread queued up, pops every client's buffer once,
//! then builds and ships one personal mix per connected client.
use log::{info, trace};
use serde_json::json;
use std::sync::mpsc;

use super::mix_engine::{MixCommand, MixEngine};
use crate::common::{
    audio_frame::AudioFrame,
    box_error::BoxError,
    get_micro_time,
    jam_packet::{JamPacket, PacketKind},
    stream_time_stat::{MicroTimer, StreamTimeStat},
    transport::PacketTransport,
};
use crate::sound::SoundCallback;

pub const MIX_STATUS_INTERVAL: u128 = 2_000_000;

pub struct MixCallback {
    engine: MixEngine,
    transport: Box<dyn PacketTransport>,
    command_rx: mpsc::Receiver<MixCommand>,
    status_tx: mpsc::Sender<serde_json::Value>,
    mix: AudioFrame,
    xmit: JamPacket,
    now: u128,
    last_tick: u128,
    tick_stat: StreamTimeStat,
    mix_stat: StreamTimeStat,
    status_timer: MicroTimer,
    mixes_sent: u64,
    send_errors: u64,
}

impl MixCallback {
    pub fn new(
        engine: MixEngine,
        transport: Box<dyn PacketTransport>,
        command_rx: mpsc::Receiver<MixCommand>,
        status_tx: mpsc::Sender<serde_json::Value>,
    ) -> MixCallback {
        let now = get_micro_time();
        MixCallback {
            mix: AudioFrame::silent(engine.frame_size(), 2),
            engine: engine,
            transport: transport,
            command_rx: command_rx,
            status_tx: status_tx,
            xmit: JamPacket::new(PacketKind::Audio),
            now: now,
            last_tick: 0,
            tick_stat: StreamTimeStat::new(100),
            mix_stat: StreamTimeStat::new(100),
            status_timer: MicroTimer::new(now, MIX_STATUS_INTERVAL),
            mixes_sent: 0,
            send_errors: 0,
        }
    }
    pub fn engine(&self) -> &MixEngine {
        &self.engine
    }
    pub fn mixes_sent(&self) -> u64 {
        self.mixes_sent
    }

    /// session changes land here, between ticks
    fn check_commands(&mut self) {
        while let Ok(cmd) = self.command_rx.try_recv() {
            if !self.engine.apply(cmd) {
                trace!("mix command for somebody who isn't here");
            }
        }
    }

    /// One personal mix per connected client
    fn send_mixes(&mut self) {
        for slot in 0..self.engine.max_clients() {
            let (id, address, quality) = match self.engine.member_at(slot) {
                Some(m) => (m.client_id, m.address, m.quality),
                None => continue,
            };
            if !self.engine.compute_mix(id, &mut self.mix) {
                continue;
            }
            let seq = self.engine.next_sequence(id);
            self.xmit.encode_audio(&self.mix, quality);
            self.xmit.set_client_id(id);
            self.xmit.set_sequence_num(seq);
            self.xmit.set_timestamp(self.now as u64);
            match self.transport.send_to(&self.xmit, address) {
                Ok(_) => self.mixes_sent += 1,
                Err(e) => {
                    self.send_errors += 1;
                    trace!("mix send to {} failed: {}", address, e);
                }
            }
        }
    }

    fn send_status(&mut self) {
        let mut mixers = vec![];
        for slot in 0..self.engine.max_clients() {
            if let Some(m) = self.engine.member_at(slot) {
                mixers.push(self.engine.mixer_view(m.client_id));
            }
        }
        let _ = self.status_tx.send(json!({
            "mixer": {
                "clients": self.engine.len(),
                "mixesSent": self.mixes_sent,
                "sendErrors": self.send_errors,
                "tickMeanUs": self.tick_stat.get_mean().round(),
                "tickSigmaUs": self.tick_stat.get_sigma().round(),
                "mixMeanUs": self.mix_stat.get_mean().round(),
                "mixPeakUs": self.mix_stat.get_peak().round(),
                "views": mixers,
            }
        }));
    }
}

impl SoundCallback for MixCallback {
    fn process(
        &mut self,
        _in_a: &[f32],
        _in_b: &[f32],
        out_a: &mut [f32],
        out_b: &mut [f32],
    ) -> Result<(), BoxError> {
        self.now = get_micro_time();
        if self.last_tick > 0 {
            self.tick_stat
                .add_sample(self.now.saturating_sub(self.last_tick) as f64);
        }
        self.last_tick = self.now;

        let had = self.engine.len();
        self.check_commands();
        if self.engine.len() != had {
            info!("mix: {} clients", self.engine.len());
        }
        self.engine.pull_inputs();
        self.send_mixes();
        self.mix_stat
            .add_sample(get_micro_time().saturating_sub(self.now) as f64);

        if self.status_timer.expired(self.now) {
            self.status_timer.reset(self.now);
            self.send_status();
        }
        // nothing is listening to the server's own output
        out_a.fill(0.0);
        out_b.fill(0.0);
        Ok(())
    }
}

#[cfg(test)]
mod test_mix_thread {
    use super::*;
    use crate::common::{
        audio_frame::FrameSize,
        jam_packet::AudioQuality,
        jitter_buffer::{JitterBuffer, JitterProducer},
        transport::recording_transport,
    };
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn add(tx: &mpsc::Sender<MixCommand>, id: u32, channels: usize) -> JitterProducer {
        let (producer, consumer) = JitterBuffer::new(1).unwrap();
        tx.send(MixCommand::AddClient {
            client_id: id,
            name: format!("player {}", id),
            address: addr(7000 + id as u16),
            channels: channels,
            quality: AudioQuality::High,
            consumer: consumer,
        })
        .unwrap();
        producer
    }

    fn tick(cb: &mut MixCallback) {
        let input = [0.0f32; 128];
        let mut out_a = [1.0f32; 128];
        let mut out_b = [1.0f32; 128];
        cb.process(&input, &input, &mut out_a, &mut out_b).unwrap();
        assert!(out_a.iter().chain(out_b.iter()).all(|v| *v == 0.0));
    }

    #[test]
    fn every_client_gets_its_mix() {
        let (transport, sent) = recording_transport();
        let (tx, rx) = mpsc::channel();
        let (status_tx, _status_rx) = mpsc::channel();
        let mut cb = MixCallback::new(
            MixEngine::new(4, FrameSize::Samples128, true),
            Box::new(transport),
            rx,
            status_tx,
        );
        let mut a = add(&tx, 1, 2);
        let _b = add(&tx, 2, 1);

        let frame = AudioFrame::capture(&[0.25; 128], Some(&[0.25; 128])).unwrap();
        for seq in 0..3u16 {
            a.push(seq, &frame);
            tick(&mut cb);
        }
        assert_eq!(cb.engine().len(), 2);
        assert_eq!(cb.mixes_sent(), 6);

        let sent = sent.lock().unwrap();
        let to_a: Vec<&JamPacket> = sent
            .iter()
            .filter(|(_, to)| *to == addr(7001))
            .map(|(p, _)| p)
            .collect();
        assert_eq!(to_a.len(), 3);
        for (i, p) in to_a.iter().enumerate() {
            assert_eq!(p.get_sequence_num() as usize, i);
            assert_eq!(p.get_client_id(), 1);
            assert_eq!(p.get_channels(), 2);
        }
        // client 1 hears itself at unity
        let mix = to_a[2].decode_audio().unwrap();
        assert!((mix.channel(0)[0] - 0.25).abs() < 1e-3);

        // the mono listener gets one channel with client 1 folded down
        let (to_b, _) = sent.iter().rev().find(|(_, to)| *to == addr(7002)).unwrap();
        assert_eq!(to_b.get_channels(), 1);
        let mix = to_b.decode_audio().unwrap();
        assert!((mix.channel(0)[0] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn removed_clients_get_nothing() {
        let (transport, sent) = recording_transport();
        let (tx, rx) = mpsc::channel();
        let (status_tx, _status_rx) = mpsc::channel();
        let mut cb = MixCallback::new(
            MixEngine::new(4, FrameSize::Samples128, true),
            Box::new(transport),
            rx,
            status_tx,
        );
        let _a = add(&tx, 1, 2);
        let _b = add(&tx, 2, 2);
        tick(&mut cb);
        tx.send(MixCommand::RemoveClient(1)).unwrap();
        tick(&mut cb);
        tick(&mut cb);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.iter().filter(|(_, to)| *to == addr(7001)).count(), 1);
        assert_eq!(sent.iter().filter(|(_, to)| *to == addr(7002)).count(), 3);
    }

    #[test]
    fn status_has_the_mixer_views() {
        let (transport, _sent) = recording_transport();
        let (tx, rx) = mpsc::channel();
        let (status_tx, status_rx) = mpsc::channel();
        let mut cb = MixCallback::new(
            MixEngine::new(4, FrameSize::Samples128, true),
            Box::new(transport),
            rx,
            status_tx,
        );
        let _a = add(&tx, 1, 2);
        cb.status_timer = MicroTimer::new(0, MIX_STATUS_INTERVAL);
        tick(&mut cb);
        let status = status_rx.try_recv().unwrap();
        assert_eq!(status["mixer"]["clients"], 1);
        assert_eq!(status["mixer"]["views"][0]["listener"], 1);
    }
}
