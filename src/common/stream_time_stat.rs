//! running statistics and microsecond timers
//!
//! [`StreamTimeStat`] keeps an exponential mean / mean-absolute-deviation of a
//! stream of samples (packet inter-arrival times, callback periods).  The
//! [`MicroTimer`] is the interval timer every loop in the crate is paced with.
use std::f64;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamTimeStat {
    peak: f64,
    mean: f64,
    sigma: f64,
    window: u64,
    count: u64,
}

impl StreamTimeStat {
    pub fn new(window_size: u64) -> StreamTimeStat {
        StreamTimeStat {
            peak: 0.0,
            mean: 0.0,
            sigma: 0.0,
            window: window_size.max(1),
            count: 0,
        }
    }
    pub fn clear(&mut self) -> () {
        self.peak = 0.0;
        self.mean = 0.0;
        self.sigma = 0.0;
        self.count = 0;
    }
    pub fn get_peak(&self) -> f64 {
        self.peak
    }
    pub fn get_mean(&self) -> f64 {
        self.mean
    }
    pub fn get_sigma(&self) -> f64 {
        self.sigma
    }
    /// true once a full window of samples has been seen
    pub fn is_settled(&self) -> bool {
        self.count >= self.window
    }

    pub fn add_sample(&mut self, sample: f64) -> () {
        self.count += 1;
        // Until the window fills up use the plain running average so the
        // first samples don't get pulled towards zero
        let n = self.count.min(self.window) as f64;
        self.mean += (sample - self.mean) / n;
        self.sigma += ((sample - self.mean).abs() - self.sigma) / n;
        if sample > self.peak {
            self.peak = sample;
        } else {
            // peak decays back towards the mean over one window
            self.peak -= (self.peak - self.mean) / self.window as f64;
        }
    }
}

impl fmt::Display for StreamTimeStat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ peak: {:.2}, mean: {:.2}, sigma: {:.2} window: {} }}",
            self.peak, self.mean, self.sigma, self.window
        )
    }
}


/// Interval timer working off microsecond timestamps.  The caller passes in
/// "now" so the timer can be driven by simulated time in tests.
#[derive(Debug, Clone)]
pub struct MicroTimer {
    last_time: u128,
    interval: u128,
}

impl MicroTimer {
    pub fn new(now: u128, interval: u128) -> MicroTimer {
        MicroTimer {
            last_time: now,
            interval: interval,
        }
    }
    pub fn expired(&self, now: u128) -> bool {
        (self.last_time + self.interval) < now
    }
    pub fn reset(&mut self, now: u128) {
        self.last_time = now;
    }
    /// move the timer forward by a fixed amount (keeps a steady cadence
    /// when the loop wakes up late)
    pub fn advance(&mut self, amount: u128) {
        self.last_time += amount;
    }
    pub fn since(&self, now: u128) -> u128 {
        now.saturating_sub(self.last_time)
    }
    /// how long until the timer expires (0 if it already has)
    pub fn remaining(&self, now: u128) -> u128 {
        (self.last_time + self.interval).saturating_sub(now)
    }
}
