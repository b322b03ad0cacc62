//! This is the entry point for the rtmix client.
//!
//! Wires the pieces together: the audio backend driving a [`JamEngine`], the
//! [`ClientNet`] network thread, and a control loop that takes json
//! [`ParamMessage`]s on stdin and prints json status lines on stdout.
use log::{debug, error, info, warn};
use std::{
    io::BufRead,
    net::{SocketAddr, ToSocketAddrs},
    sync::mpsc,
    thread,
    time::Duration,
};

use super::{
    backend::{AudioBackend, AudioFormat},
    jam_engine::{EngineCommand, JamEngine},
    net_thread::{BufferSetting, ClientNet, NetCommand},
    param_message::{JamParam, ParamMessage},
    timer_backend::TimerBackend,
};
use crate::common::{
    box_error::BoxError,
    jam_error::AudioIoError,
    jam_packet::ControlParam,
    jitter_buffer::{JitterBuffer, JitterProducer},
    link::LinkConfig,
    settings::{JamSettings, DEFAULT_PORT},
    sock_with_tos,
    transport::PacketTransport,
};
use simple_error::bail;

/// Run the client until a StopAudio command comes in.
///
/// `use_jack` picks the jack backend (needs the `jack` feature), otherwise
/// the timer backend runs the engine with silent input.
pub fn run(settings: JamSettings, use_jack: bool) -> Result<(), BoxError> {
    info!("client - starting run function");
    let mut backend = make_backend(use_jack)?;
    let sock = sock_with_tos::new(0)?;
    info!("client - socket on {}", sock.local_addr()?);

    let (status_tx, status_rx) = mpsc::channel();
    let (net_tx, net_rx) = mpsc::channel();

    let requested = AudioFormat::new(settings.frame_size, settings.channels);
    let (format, producer, engine_tx) = start_audio(
        backend.as_mut(),
        requested,
        &settings,
        Box::new(sock.try_clone()?),
        status_tx.clone(),
    )?;
    info!("client - audio running: {}", format);

    let mut net = ClientNet::new(
        format,
        settings.quality,
        LinkConfig::client().with_timeout_ms(settings.link_timeout_ms as u64),
        settings.estimator_config(),
        Box::new(sock.try_clone()?),
        producer,
        engine_tx.clone(),
        status_tx.clone(),
    );
    net.set_name(&settings.name);
    let net_sock = sock.try_clone()?;
    let net_handle = thread::Builder::new()
        .name(String::from("client network"))
        .spawn(move || {
            if let Err(e) = net.run(net_sock, net_rx) {
                error!("client network thread exited with error {}", e);
            }
        })?;

    if !settings.server.is_empty() {
        net_tx.send(NetCommand::Connect(resolve(&settings.server)?))?;
    }

    let (line_tx, line_rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        debug!("stdin closed");
    });

    let mut audio = AudioControl {
        backend: backend,
        settings: settings,
        format: format,
        engine_tx: engine_tx,
        sock: sock,
        status_tx: status_tx,
        running: true,
    };
    run_main_loop(&mut audio, line_rx, status_rx, &net_tx)?;

    audio.backend.stop();
    let _ = net_handle.join();
    info!("client - stopped");
    Ok(())
}

#[cfg(feature = "jack")]
fn make_backend(use_jack: bool) -> Result<Box<dyn AudioBackend>, BoxError> {
    if use_jack {
        info!("client - using jack");
        return Ok(Box::new(super::jack_backend::JackBackend::new("rtmix")));
    }
    Ok(Box::new(TimerBackend::new("client clock")))
}

#[cfg(not(feature = "jack"))]
fn make_backend(use_jack: bool) -> Result<Box<dyn AudioBackend>, BoxError> {
    if use_jack {
        bail!("this build has no jack support (build with --features jack)");
    }
    Ok(Box::new(TimerBackend::new("client clock")))
}

/// Open the backend, build a fresh downstream buffer and engine and start it.
///
/// Returns the format actually running, the producer half of the buffer for
/// the network thread and the engine's command channel.
pub fn start_audio(
    backend: &mut dyn AudioBackend,
    format: AudioFormat,
    settings: &JamSettings,
    transport: Box<dyn PacketTransport>,
    status_tx: mpsc::Sender<serde_json::Value>,
) -> Result<(AudioFormat, JitterProducer, mpsc::Sender<EngineCommand>), AudioIoError> {
    let format = backend.open(format)?;
    let (producer, consumer) = JitterBuffer::new(settings.buffer_capacity)
        .map_err(|e| AudioIoError::FormatUnsupported(e.to_string()))?;
    let (engine_tx, engine_rx) = mpsc::channel();
    let engine = JamEngine::new(
        format,
        settings.quality,
        transport,
        consumer,
        engine_rx,
        status_tx,
    );
    backend.start(Box::new(engine))?;
    Ok((format, producer, engine_tx))
}

/// host:port, or just host for the default port
pub fn resolve(server: &str) -> Result<SocketAddr, BoxError> {
    let target = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:{}", server, DEFAULT_PORT)
    };
    match target.to_socket_addrs()?.next() {
        Some(addr) => Ok(addr),
        None => bail!("{} did not resolve", server),
    }
}

/// Turn a control message into what the network thread should do.  Audio
/// reset and stop are handled by the control loop and map to None.
pub fn to_net_command(msg: &ParamMessage) -> Result<Option<NetCommand>, BoxError> {
    let target = u32::try_from(msg.ivalue_1).unwrap_or(0);
    let flag = if msg.ivalue_2 != 0 { 1.0 } else { 0.0 };
    let buffer = if msg.is_auto() {
        BufferSetting::Auto
    } else {
        BufferSetting::Frames(usize::try_from(msg.ivalue_1).unwrap_or(0))
    };
    let cmd = match msg.param {
        JamParam::SetGain => NetCommand::Control {
            param: ControlParam::Gain,
            target: target,
            value: msg.fvalue as f32,
        },
        JamParam::SetPan => NetCommand::Control {
            param: ControlParam::Pan,
            target: target,
            value: msg.fvalue as f32,
        },
        JamParam::SetMute => NetCommand::Control {
            param: ControlParam::Mute,
            target: target,
            value: flag,
        },
        JamParam::SetSolo => NetCommand::Control {
            param: ControlParam::Solo,
            target: target,
            value: flag,
        },
        JamParam::SetBufferCapacity => NetCommand::SetBuffer(buffer),
        JamParam::SetServerBufferCapacity => NetCommand::SetServerBuffer(buffer),
        JamParam::Connect => NetCommand::Connect(resolve(&msg.svalue)?),
        JamParam::Disconnect => NetCommand::Disconnect,
        JamParam::GetStatus => NetCommand::Status,
        JamParam::ResetAudio | JamParam::StopAudio => return Ok(None),
    };
    Ok(Some(cmd))
}

/// The parts of the client the control loop restarts on an audio reset
struct AudioControl {
    backend: Box<dyn AudioBackend>,
    settings: JamSettings,
    format: AudioFormat,
    engine_tx: mpsc::Sender<EngineCommand>,
    sock: std::net::UdpSocket,
    status_tx: mpsc::Sender<serde_json::Value>,
    running: bool,
}

impl AudioControl {
    fn reset(&mut self, net_tx: &mpsc::Sender<NetCommand>) -> Result<(), BoxError> {
        info!("client - resetting audio");
        self.backend.stop();
        let requested = AudioFormat::new(self.settings.frame_size, self.settings.channels);
        match start_audio(
            self.backend.as_mut(),
            requested,
            &self.settings,
            Box::new(self.sock.try_clone()?),
            self.status_tx.clone(),
        ) {
            Ok((format, producer, engine_tx)) => {
                self.format = format;
                self.engine_tx = engine_tx.clone();
                self.running = true;
                net_tx.send(NetCommand::AudioRestarted {
                    producer,
                    engine_tx,
                })?;
            }
            Err(e) => {
                error!("audio reset failed: {}", e);
                self.running = false;
                let _ = self.status_tx.send(serde_json::json!({ "audioError": e.to_string() }));
            }
        }
        Ok(())
    }

    /// a backend that lost its device stops reporting a format
    fn check_backend(&mut self) {
        if self.running && self.backend.format().is_none() {
            self.running = false;
            let err = AudioIoError::DeviceLost(format!("{} stopped", self.format));
            let _ = self.engine_tx.send(EngineCommand::Halt(err.clone()));
            let _ = self.status_tx.send(serde_json::json!({ "audioError": err.to_string() }));
        }
    }
}

fn run_main_loop(
    audio: &mut AudioControl,
    line_rx: mpsc::Receiver<String>,
    status_rx: mpsc::Receiver<serde_json::Value>,
    net_tx: &mpsc::Sender<NetCommand>,
) -> Result<(), BoxError> {
    loop {
        loop {
            let line = match line_rx.try_recv() {
                Ok(l) => l,
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    info!("client - stdin closed, stopping");
                    net_tx.send(NetCommand::Stop)?;
                    return Ok(());
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let msg = match ParamMessage::from_string(&line) {
                Ok(m) => m,
                Err(e) => {
                    warn!("bad command {}: {}", line, e);
                    continue;
                }
            };
            debug!("command: {}", msg);
            match msg.param {
                JamParam::StopAudio => {
                    net_tx.send(NetCommand::Stop)?;
                    return Ok(());
                }
                JamParam::ResetAudio => audio.reset(net_tx)?,
                _ => match to_net_command(&msg) {
                    Ok(Some(cmd)) => net_tx.send(cmd)?,
                    Ok(None) => (),
                    Err(e) => warn!("{}: {}", msg, e),
                },
            }
        }
        audio.check_backend();
        match status_rx.recv_timeout(Duration::from_millis(20)) {
            Ok(status) => println!("{}", status),
            Err(mpsc::RecvTimeoutError::Timeout) => (),
            Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}
