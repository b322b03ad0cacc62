//! entry point called by main to run the mix server
//!
//! This will create some threads to
//! - keep the mix clock: a [`TimerBackend`] driving the [`MixCallback`] that
//!   builds every client's personal mix once per frame
//! - log the status reports the other threads produce
//!
//! and then turns the calling thread into the [`ServerNet`] receive loop.
use log::{error, info};
use std::{sync::mpsc, thread};

use super::{mix_engine::MixEngine, mix_thread::MixCallback, net_thread::ServerNet};
use crate::{
    common::{box_error::BoxError, settings::JamSettings, sock_with_tos},
    sound::{
        backend::{AudioBackend, AudioFormat},
        timer_backend::TimerBackend,
    },
};

/// To start a mix server, call this function with the settings to run.
///
/// Returns when the network loop fails or the mix clock dies.
pub fn run(settings: JamSettings) -> Result<(), BoxError> {
    info!(
        "server - port {}, {} samples, max {} clients",
        settings.port,
        settings.frame_size.samples(),
        settings.max_clients
    );
    let sock = sock_with_tos::new(settings.port)?;

    let (mix_tx, mix_rx) = mpsc::channel();
    let (status_tx, status_rx) = mpsc::channel::<serde_json::Value>();

    let engine = MixEngine::new(
        settings.max_clients,
        settings.frame_size,
        settings.mix_own_audio,
    );
    let callback = MixCallback::new(
        engine,
        Box::new(sock.try_clone()?),
        mix_rx,
        status_tx.clone(),
    );
    let mut clock = TimerBackend::new("mix clock");
    let format = clock.open(AudioFormat::new(settings.frame_size, 2))?;
    clock.start(Box::new(callback))?;
    info!("server - mix clock running at {}", format);

    let _status_handle = thread::Builder::new()
        .name(String::from("server status"))
        .spawn(move || {
            for status in status_rx.iter() {
                info!("status: {}", status);
            }
        })?;

    let mut net = ServerNet::new(settings, Box::new(sock.try_clone()?), mix_tx, status_tx);
    let res = net.run(sock);
    if let Err(e) = &res {
        error!("server network loop exited with error {}", e);
    }
    clock.stop();
    info!("server - stopped");
    res
}
