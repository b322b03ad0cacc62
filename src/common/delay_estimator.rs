//! Network delay / jitter estimation and automatic buffer sizing.
//!
//! The network thread feeds every audio arrival into a [`DelayEstimator`].  It
//! keeps the inter-arrival statistics and, per evaluation window, a histogram
//! of how late packets are compared to the earliest possible arrival schedule.
//! Every couple of seconds the histogram turns into a capacity proposal:
//! enough frames to cover the configured percentile of lateness plus one.
//!
//! Growing and shrinking are deliberately lopsided.  The buffer grows at once
//! when the proposal is larger and the window had real underruns.  It shrinks
//! only after several quiet windows in a row, and only as far as the largest
//! proposal seen while it was quiet.
//!
//! [`DropoutWindow`] is the sliding count of empty ticks used for the buffer
//! health light.  It lives in the jitter buffer consumer.
use serde::{Deserialize, Serialize};
use std::fmt;

use super::audio_frame::FrameSize;
use super::jitter_buffer::{DEFAULT_CAPACITY, MAX_CAPACITY, MIN_CAPACITY};
use super::stream_time_stat::{MicroTimer, StreamTimeStat};

/// Sliding window over the last N ticks counting the ones that came up empty.
/// Fixed storage, O(1) per tick.
#[derive(Debug, Clone)]
pub struct DropoutWindow {
    ticks: Vec<bool>,
    pos: usize,
    len: usize,
    count: usize,
}

impl DropoutWindow {
    pub fn new(size: usize) -> DropoutWindow {
        DropoutWindow {
            ticks: vec![false; size.max(1)],
            pos: 0,
            len: 0,
            count: 0,
        }
    }
    pub fn record(&mut self, dropout: bool) {
        if self.len == self.ticks.len() {
            if self.ticks[self.pos] {
                self.count -= 1;
            }
        } else {
            self.len += 1;
        }
        self.ticks[self.pos] = dropout;
        if dropout {
            self.count += 1;
        }
        self.pos = (self.pos + 1) % self.ticks.len();
    }
    /// dropouts currently in the window
    pub fn count(&self) -> usize {
        self.count
    }
    /// ticks currently in the window (less than size until it fills)
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn size(&self) -> usize {
        self.ticks.len()
    }
    pub fn rate(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        self.count as f64 / self.len as f64
    }
    pub fn clear(&mut self) {
        self.ticks.fill(false);
        self.pos = 0;
        self.len = 0;
        self.count = 0;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// false: capacity is whatever the user set, we only report
    pub auto: bool,
    /// fraction of the lateness distribution the buffer has to cover
    pub percentile: f64,
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub eval_interval_us: u128,
    /// underruns in one window needed before growing
    pub grow_underruns: u64,
    /// quiet windows in a row needed before shrinking
    pub shrink_quiet_evals: u32,
    /// arrivals in a window needed to trust its histogram
    pub min_samples: u64,
    pub frame_size: FrameSize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            auto: true,
            percentile: 0.99,
            min_capacity: MIN_CAPACITY,
            max_capacity: 16,
            eval_interval_us: 2_000_000,
            grow_underruns: 2,
            shrink_quiet_evals: 3,
            min_samples: 50,
            frame_size: FrameSize::default(),
        }
    }
}

/// What the estimator thinks, for the status JSON
#[derive(Debug, Clone, Serialize)]
pub struct EstimatorReport {
    pub auto: bool,
    pub arrival_mean_us: f64,
    pub arrival_sigma_us: f64,
    pub lateness_us: f64,
    pub proposal: Option<usize>,
}

pub struct DelayEstimator {
    config: EstimatorConfig,
    period_us: f64,
    arrivals: StreamTimeStat,
    last: Option<(u128, u16)>,
    lateness: f64,
    histogram: [u64; MAX_CAPACITY + 1],
    samples: u64,
    eval_timer: MicroTimer,
    started: bool,
    last_underruns: u64,
    quiet_evals: u32,
    quiet_max: usize,
    proposal: Option<usize>,
}

impl DelayEstimator {
    pub fn new(config: EstimatorConfig) -> DelayEstimator {
        let mut config = config;
        config.min_capacity = config.min_capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        config.max_capacity = config.max_capacity.clamp(config.min_capacity, MAX_CAPACITY);
        config.percentile = config.percentile.clamp(0.5, 1.0);
        DelayEstimator {
            period_us: config.frame_size.period_us(),
            eval_timer: MicroTimer::new(0, config.eval_interval_us),
            config: config,
            arrivals: StreamTimeStat::new(100),
            last: None,
            lateness: 0.0,
            histogram: [0; MAX_CAPACITY + 1],
            samples: 0,
            started: false,
            last_underruns: 0,
            quiet_evals: 0,
            quiet_max: 0,
            proposal: None,
        }
    }
    pub fn is_auto(&self) -> bool {
        self.config.auto
    }
    pub fn set_auto(&mut self, auto: bool) {
        self.config.auto = auto;
        self.quiet_evals = 0;
        self.quiet_max = 0;
    }
    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }
    /// a good starting capacity before anything has been measured
    pub fn initial_capacity(&self) -> usize {
        DEFAULT_CAPACITY.clamp(self.config.min_capacity, self.config.max_capacity)
    }

    /// A packet with sequence `seq` arrived at `now` (microseconds)
    pub fn add_arrival(&mut self, now: u128, seq: u16) {
        if !self.started {
            self.started = true;
            self.eval_timer.reset(now);
        }
        if let Some((then, last_seq)) = self.last {
            let dseq = seq.wrapping_sub(last_seq) as i16;
            if dseq <= 0 {
                // reordered or duplicated: counts towards the histogram
                // but does not move the reference point
                self.sample_lateness();
                return;
            }
            let delta = now.saturating_sub(then) as f64;
            self.arrivals.add_sample(delta / dseq as f64);
            // accumulated lateness versus the best case schedule, with a
            // small leak so clock drift between the ends doesn't pile up
            let expected = dseq as f64 * self.period_us;
            let leak = 0.001 * self.period_us;
            self.lateness = (self.lateness + delta - expected - leak).max(0.0);
        }
        self.last = Some((now, seq));
        self.sample_lateness();
    }

    fn sample_lateness(&mut self) {
        let frames = (self.lateness / self.period_us).ceil() as usize;
        self.histogram[frames.min(MAX_CAPACITY)] += 1;
        self.samples += 1;
    }

    /// capacity that covers the configured percentile of this window
    fn propose(&self) -> usize {
        let target = (self.config.percentile * self.samples as f64).ceil() as u64;
        let mut seen = 0;
        let mut bucket = MAX_CAPACITY;
        for (frames, n) in self.histogram.iter().enumerate() {
            seen += n;
            if seen >= target {
                bucket = frames;
                break;
            }
        }
        (bucket + 1).clamp(self.config.min_capacity, self.config.max_capacity)
    }

    /// Run an evaluation if one is due.  `total_underruns` is the buffer's
    /// running underrun counter.  Returns the capacity to switch to, if any.
    pub fn evaluate(&mut self, now: u128, current: usize, total_underruns: u64) -> Option<usize> {
        if !self.started || !self.eval_timer.expired(now) {
            return None;
        }
        self.eval_timer.reset(now);
        let underruns = total_underruns.saturating_sub(self.last_underruns);
        self.last_underruns = total_underruns;
        if self.samples < self.config.min_samples {
            self.clear_window();
            return None;
        }
        let proposal = self.propose();
        self.proposal = Some(proposal);
        self.clear_window();
        if !self.config.auto {
            return None;
        }

        if proposal > current {
            self.quiet_evals = 0;
            self.quiet_max = 0;
            if underruns >= self.config.grow_underruns {
                return Some(proposal);
            }
            return None;
        }
        if underruns == 0 && proposal < current {
            self.quiet_evals += 1;
            self.quiet_max = self.quiet_max.max(proposal);
            if self.quiet_evals >= self.config.shrink_quiet_evals {
                let target = self.quiet_max;
                self.quiet_evals = 0;
                self.quiet_max = 0;
                return Some(target);
            }
        } else {
            self.quiet_evals = 0;
            self.quiet_max = 0;
        }
        None
    }

    fn clear_window(&mut self) {
        self.histogram = [0; MAX_CAPACITY + 1];
        self.samples = 0;
    }

    /// forget the measurements (new connection).  The underrun baseline is
    /// kept since the buffer's counter keeps running.
    pub fn reset(&mut self) {
        self.arrivals.clear();
        self.last = None;
        self.lateness = 0.0;
        self.clear_window();
        self.started = false;
        self.quiet_evals = 0;
        self.quiet_max = 0;
        self.proposal = None;
    }

    pub fn report(&self) -> EstimatorReport {
        EstimatorReport {
            auto: self.config.auto,
            arrival_mean_us: self.arrivals.get_mean(),
            arrival_sigma_us: self.arrivals.get_sigma(),
            lateness_us: self.lateness,
            proposal: self.proposal,
        }
    }
}

impl fmt::Display for DelayEstimator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ auto: {}, arrivals: {}, lateness: {:.0}us, proposal: {:?} }}",
            self.config.auto, self.arrivals, self.lateness, self.proposal
        )
    }
}
