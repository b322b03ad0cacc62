//! jack adapter for [`AudioBackend`].  Only built with the `jack` feature.
//!
//! Registers two inputs and two outputs, wires them to the system ports and
//! calls the [`SoundCallback`] from the jack process thread.  A jack server
//! shutdown flips a flag so [`AudioBackend::format`] goes to None and the
//! owner knows to reconfigure.
use log::{info, trace, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use super::{
    backend::{AudioBackend, AudioFormat},
    SoundCallback,
};
use crate::common::{audio_frame::FrameSize, jam_error::AudioIoError};

struct Ports {
    in_a: jack::Port<jack::AudioIn>,
    in_b: jack::Port<jack::AudioIn>,
    out_a: jack::Port<jack::AudioOut>,
    out_b: jack::Port<jack::AudioOut>,
}

struct JackProcess {
    callback: Box<dyn SoundCallback>,
    ports: Ports,
}

impl jack::ProcessHandler for JackProcess {
    fn process(&mut self, _: &jack::Client, ps: &jack::ProcessScope) -> jack::Control {
        let in_a = self.ports.in_a.as_slice(ps);
        let in_b = self.ports.in_b.as_slice(ps);
        let out_a = self.ports.out_a.as_mut_slice(ps);
        let out_b = self.ports.out_b.as_mut_slice(ps);
        if let Err(e) = self.callback.process(in_a, in_b, out_a, out_b) {
            trace!("jack callback error: {}", e);
        }
        jack::Control::Continue
    }
}

struct Notifications {
    lost: Arc<AtomicBool>,
}

impl jack::NotificationHandler for Notifications {
    fn shutdown(&mut self, status: jack::ClientStatus, reason: &str) {
        warn!(
            "JACK: shutdown with status {:?} because \"{}\"",
            status, reason
        );
        self.lost.store(true, Ordering::Release);
    }

    fn sample_rate(&mut self, _: &jack::Client, srate: jack::Frames) -> jack::Control {
        info!("JACK: sample rate changed to {}", srate);
        jack::Control::Continue
    }

    fn xrun(&mut self, _: &jack::Client) -> jack::Control {
        trace!("JACK: xrun occurred");
        jack::Control::Continue
    }
}

pub struct JackBackend {
    name: String,
    format: Option<AudioFormat>,
    opened: Option<(jack::Client, Ports)>,
    active: Option<jack::AsyncClient<Notifications, JackProcess>>,
    lost: Arc<AtomicBool>,
}

impl JackBackend {
    pub fn new(name: &str) -> JackBackend {
        JackBackend {
            name: name.to_string(),
            format: None,
            opened: None,
            active: None,
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    fn connect_system_ports(&self, client: &jack::Client) {
        let pairs = [
            ("system:capture_1".to_string(), format!("{}:in_1", self.name)),
            ("system:capture_2".to_string(), format!("{}:in_2", self.name)),
            (format!("{}:out_l", self.name), "system:playback_1".to_string()),
            (format!("{}:out_r", self.name), "system:playback_2".to_string()),
        ];
        for (src, dst) in pairs.iter() {
            if let Err(e) = client.connect_ports_by_name(src, dst) {
                warn!("JACK: could not connect {} to {}: {}", src, dst, e);
            }
        }
    }
}

fn device_error(e: jack::Error) -> AudioIoError {
    AudioIoError::DeviceUnavailable(e.to_string())
}

impl AudioBackend for JackBackend {
    fn open(&mut self, format: AudioFormat) -> Result<AudioFormat, AudioIoError> {
        if self.active.is_some() {
            return Err(AudioIoError::AlreadyRunning);
        }
        format.check()?;
        let (client, _status) =
            jack::Client::new(&self.name, jack::ClientOptions::NO_START_SERVER)
                .map_err(device_error)?;
        // jack decides the period, all we can do is refuse what doesn't fit
        let rate = client.sample_rate() as u32;
        let frames = client.buffer_size() as usize;
        if rate != format.sample_rate {
            return Err(AudioIoError::FormatUnsupported(format!(
                "jack is running at {}Hz",
                rate
            )));
        }
        let frame_size = FrameSize::from_samples(frames).ok_or_else(|| {
            AudioIoError::FormatUnsupported(format!("jack period of {} frames", frames))
        })?;
        let ports = Ports {
            in_a: client
                .register_port("in_1", jack::AudioIn::default())
                .map_err(device_error)?,
            in_b: client
                .register_port("in_2", jack::AudioIn::default())
                .map_err(device_error)?,
            out_a: client
                .register_port("out_l", jack::AudioOut::default())
                .map_err(device_error)?,
            out_b: client
                .register_port("out_r", jack::AudioOut::default())
                .map_err(device_error)?,
        };
        let running = AudioFormat {
            sample_rate: rate,
            frame_size: frame_size,
            channels: format.channels,
        };
        info!("JACK: opened {}", running);
        self.opened = Some((client, ports));
        self.format = Some(running);
        self.lost.store(false, Ordering::Release);
        Ok(running)
    }

    fn start(&mut self, callback: Box<dyn SoundCallback>) -> Result<(), AudioIoError> {
        if self.active.is_some() {
            return Err(AudioIoError::AlreadyRunning);
        }
        let (client, ports) = self.opened.take().ok_or(AudioIoError::NotOpen)?;
        let notifications = Notifications {
            lost: Arc::clone(&self.lost),
        };
        let process = JackProcess {
            callback: callback,
            ports: ports,
        };
        let active = client
            .activate_async(notifications, process)
            .map_err(device_error)?;
        self.connect_system_ports(active.as_client());
        self.active = Some(active);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(e) = active.deactivate() {
                warn!("JACK: deactivate failed: {}", e);
            }
        }
        self.opened = None;
        self.format = None;
    }

    fn format(&self) -> Option<AudioFormat> {
        if self.lost.load(Ordering::Acquire) {
            return None;
        }
        self.format
    }
}
