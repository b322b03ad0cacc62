//! Backend with no sound device behind it.
//!
//! A max priority thread calls the callback once per frame period off the
//! wall clock.  Inputs are silence and outputs go nowhere.  The mix server
//! runs on this (it has no sound card), and the client uses it for headless
//! testing.
use log::{debug, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, sleep},
    time::Duration,
};
use thread_priority::{ThreadBuilder, ThreadPriority};

use super::{
    backend::{AudioBackend, AudioFormat},
    SoundCallback,
};
use crate::common::{
    audio_frame::MAX_FRAME_SIZE, get_micro_time, jam_error::AudioIoError,
    stream_time_stat::MicroTimer,
};

/// this far behind and we stop trying to catch up
const MAX_CATCH_UP_FRAMES: u128 = 20;
/// closer than this to the deadline we spin instead of sleeping
const SPIN_US: u128 = 500;

pub struct TimerBackend {
    name: String,
    format: Option<AudioFormat>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TimerBackend {
    pub fn new(name: &str) -> TimerBackend {
        TimerBackend {
            name: name.to_string(),
            format: None,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.running.load(Ordering::Relaxed)
    }
}

impl AudioBackend for TimerBackend {
    fn open(&mut self, format: AudioFormat) -> Result<AudioFormat, AudioIoError> {
        if self.handle.is_some() {
            return Err(AudioIoError::AlreadyRunning);
        }
        format.check()?;
        self.format = Some(format);
        info!("{}: opened {}", self.name, format);
        Ok(format)
    }

    fn start(&mut self, callback: Box<dyn SoundCallback>) -> Result<(), AudioIoError> {
        let format = self.format.ok_or(AudioIoError::NotOpen)?;
        if self.handle.is_some() {
            return Err(AudioIoError::AlreadyRunning);
        }
        self.running.store(true, Ordering::Relaxed);
        let running = Arc::clone(&self.running);
        let name = self.name.clone();
        let builder = ThreadBuilder::default()
            .name(self.name.clone())
            .priority(ThreadPriority::Max);
        let handle = builder
            .spawn(move |result| {
                if let Err(e) = result {
                    // still runs, just without the priority bump
                    warn!("{}: could not raise thread priority: {:?}", name, e);
                }
                run_clock(&name, callback, format, running);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::Relaxed);
                AudioIoError::DeviceUnavailable(e.to_string())
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{}: clock thread panicked", self.name);
            }
        }
        self.format = None;
    }

    fn format(&self) -> Option<AudioFormat> {
        self.format
    }
}

impl Drop for TimerBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_clock(
    name: &str,
    mut callback: Box<dyn SoundCallback>,
    format: AudioFormat,
    running: Arc<AtomicBool>,
) {
    let samples = format.frame_size.samples();
    let period = format.frame_size.period_us() as u128;
    let in_a = [0.0f32; MAX_FRAME_SIZE];
    let in_b = [0.0f32; MAX_FRAME_SIZE];
    let mut out_a = [0.0f32; MAX_FRAME_SIZE];
    let mut out_b = [0.0f32; MAX_FRAME_SIZE];
    let mut timer = MicroTimer::new(get_micro_time(), period);
    debug!("{}: clock running every {}us", name, period);

    while running.load(Ordering::Relaxed) {
        let now = get_micro_time();
        if timer.expired(now) {
            if timer.since(now) > period * MAX_CATCH_UP_FRAMES {
                warn!("{}: clock fell {}us behind, resetting", name, timer.since(now));
                timer.reset(now);
            } else {
                timer.advance(period);
            }
            if let Err(e) = callback.process(
                &in_a[..samples],
                &in_b[..samples],
                &mut out_a[..samples],
                &mut out_b[..samples],
            ) {
                warn!("{}: callback error: {}", name, e);
            }
        } else {
            let wait = timer.remaining(now);
            if wait > SPIN_US {
                sleep(Duration::from_micros((wait - SPIN_US / 2) as u64));
            } else {
                thread::yield_now();
            }
        }
    }
    debug!("{}: clock stopped", name);
}

#[cfg(test)]
mod test_timer_backend {
    use super::*;
    use crate::common::{audio_frame::FrameSize, box_error::BoxError};
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        calls: Arc<AtomicUsize>,
        len: Arc<AtomicUsize>,
    }

    impl SoundCallback for Counter {
        fn process(
            &mut self,
            in_a: &[f32],
            _in_b: &[f32],
            _out_a: &mut [f32],
            _out_b: &mut [f32],
        ) -> Result<(), BoxError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.len.store(in_a.len(), Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn start_needs_open() {
        let mut backend = TimerBackend::new("test clock");
        let calls = Arc::new(AtomicUsize::new(0));
        let len = Arc::new(AtomicUsize::new(0));
        let res = backend.start(Box::new(Counter { calls, len }));
        assert_eq!(res.err(), Some(AudioIoError::NotOpen));
        assert!(backend.format().is_none());
    }

    #[test]
    fn calls_back_every_period() {
        let mut backend = TimerBackend::new("test clock");
        let format = backend
            .open(AudioFormat::new(FrameSize::Samples64, 2))
            .unwrap();
        assert_eq!(backend.format(), Some(format));
        let calls = Arc::new(AtomicUsize::new(0));
        let len = Arc::new(AtomicUsize::new(0));
        backend
            .start(Box::new(Counter {
                calls: Arc::clone(&calls),
                len: Arc::clone(&len),
            }))
            .unwrap();
        assert!(backend.is_running());
        // can't reopen or restart while running
        assert_eq!(
            backend.open(AudioFormat::default()).err(),
            Some(AudioIoError::AlreadyRunning)
        );
        sleep(Duration::from_millis(200));
        backend.stop();
        assert!(!backend.is_running());
        assert!(backend.format().is_none());
        // 1.33ms period, 150 frames in 200ms.  The bounds are loose for slow CI boxes.
        let n = calls.load(Ordering::Relaxed);
        assert!(n > 20 && n < 400, "{} callbacks", n);
        assert_eq!(len.load(Ordering::Relaxed), 64);
    }
}
