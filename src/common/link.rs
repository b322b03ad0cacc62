//! Connection state machine and link health lights.
//!
//! A [`Link`] follows one peer through Disconnected, Connecting and Connected.
//! It does no I/O.  The owner feeds it time and received packets, and acts on
//! the [`LinkAction`]s it hands back (send a Connect, send a Ping, report a
//! failure, drop the peer).  The client runs one for its server connection,
//! the server runs one per accepted client.
use serde::Serialize;
use std::fmt;

use super::audio_frame::FrameSize;
use super::jam_error::ConnectError;
use super::jitter_buffer::JitterStats;
use super::stream_time_stat::MicroTimer;
use crate::dsp::smoothing_filter::SmoothingFilter;
use num::FromPrimitive;

/// total delay under this is green
pub const DELAY_GREEN_MS: f64 = 43.0;
/// and under this is yellow
pub const DELAY_YELLOW_MS: f64 = 68.0;
pub const DROPOUT_GREEN: f64 = 0.01;
pub const DROPOUT_YELLOW: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// status light color.  Black means there is nothing to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Color {
    Black,
    Green,
    Yellow,
    Red,
}

/// What the owner of the link should do now
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinkAction {
    SendConnect,
    SendPing,
    Connected,
    ConnectFailed(ConnectError),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub handshake_interval_us: u128,
    pub handshake_retries: u32,
    /// None: this end never pings (the server only answers)
    pub ping_interval_us: Option<u128>,
    pub timeout_us: u128,
}

impl LinkConfig {
    pub fn client() -> LinkConfig {
        LinkConfig {
            handshake_interval_us: 500_000,
            handshake_retries: 5,
            ping_interval_us: Some(500_000),
            timeout_us: 2_000_000,
        }
    }
    pub fn server() -> LinkConfig {
        LinkConfig {
            handshake_interval_us: 500_000,
            handshake_retries: 5,
            ping_interval_us: None,
            timeout_us: 1_000_000,
        }
    }
    pub fn with_timeout_ms(mut self, ms: u64) -> LinkConfig {
        if ms > 0 {
            self.timeout_us = ms as u128 * 1000;
        }
        self
    }
}

/// delay light from ping time plus the buffering at both ends
pub fn delay_light(total_delay_ms: f64) -> Color {
    if total_delay_ms < DELAY_GREEN_MS {
        Color::Green
    } else if total_delay_ms < DELAY_YELLOW_MS {
        Color::Yellow
    } else {
        Color::Red
    }
}

/// buffer light from the fraction of ticks that dropped out
pub fn buffer_light(dropout_rate: f64) -> Color {
    if dropout_rate < DROPOUT_GREEN {
        Color::Green
    } else if dropout_rate < DROPOUT_YELLOW {
        Color::Yellow
    } else {
        Color::Red
    }
}

/// Everything the status display needs about one link
#[derive(Debug, Clone, Serialize)]
pub struct LinkHealth {
    pub state: LinkState,
    pub rtt_ms: f64,
    pub total_delay_ms: f64,
    pub fill_ratio: f64,
    pub dropouts: usize,
    pub dropout_rate: f64,
    pub local_capacity: usize,
    pub server_capacity: usize,
    pub delay_light: Color,
    pub buffer_light: Color,
}

pub struct Link {
    state: LinkState,
    config: LinkConfig,
    attempts: u32,
    handshake_timer: MicroTimer,
    ping_timer: MicroTimer,
    last_heard: u128,
    rtt: SmoothingFilter<f64>,
    rtt_ms: f64,
    server_capacity: usize,
}

impl Link {
    pub fn new(config: LinkConfig) -> Link {
        let ping_rate = match config.ping_interval_us {
            Some(us) if us > 0 => 1_000_000.0 / us as f64,
            _ => 2.0,
        };
        Link {
            state: LinkState::Disconnected,
            handshake_timer: MicroTimer::new(0, config.handshake_interval_us),
            ping_timer: MicroTimer::new(0, config.ping_interval_us.unwrap_or(0)),
            config: config,
            attempts: 0,
            last_heard: 0,
            rtt: SmoothingFilter::new(2.0, ping_rate),
            rtt_ms: 0.0,
            server_capacity: 0,
        }
    }
    /// Server side: the handshake already happened, start out Connected
    pub fn accepted(config: LinkConfig, now: u128) -> Link {
        let mut link = Link::new(config);
        link.state = LinkState::Connected;
        link.last_heard = now;
        link
    }
    pub fn state(&self) -> LinkState {
        self.state
    }
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }
    pub fn rtt_ms(&self) -> f64 {
        self.rtt_ms
    }
    pub fn server_capacity(&self) -> usize {
        self.server_capacity
    }

    /// Start a handshake.  The first Connect goes out right away.
    pub fn connect(&mut self, now: u128) -> LinkAction {
        self.state = LinkState::Connecting;
        self.attempts = 1;
        self.handshake_timer.reset(now);
        self.rtt.reset();
        self.rtt_ms = 0.0;
        LinkAction::SendConnect
    }

    pub fn close(&mut self) {
        self.state = LinkState::Disconnected;
        self.attempts = 0;
    }

    /// anything at all from the peer counts as a heartbeat
    pub fn heard(&mut self, now: u128) {
        self.last_heard = now;
    }

    /// Answer to our Connect.  `status` 0 is accepted, anything else is a
    /// [`ConnectError`] code.
    pub fn handle_ack(&mut self, now: u128, status: u16) -> Result<Option<LinkAction>, ConnectError> {
        if self.state != LinkState::Connecting {
            // late duplicate ack
            return Ok(None);
        }
        if status != 0 {
            self.close();
            let err: ConnectError =
                FromPrimitive::from_u16(status).unwrap_or(ConnectError::UnsupportedFormat);
            return Err(err);
        }
        self.state = LinkState::Connected;
        self.last_heard = now;
        self.ping_timer.reset(now);
        Ok(Some(LinkAction::Connected))
    }

    /// Pong carrying our ping timestamp and the server side buffer capacity
    pub fn handle_pong(&mut self, now: u128, sent: u64, server_capacity: u16) {
        self.heard(now);
        let rtt_us = now.saturating_sub(sent as u128) as f64;
        self.rtt_ms = self.rtt.get(rtt_us / 1000.0);
        self.server_capacity = server_capacity as usize;
    }

    /// Drive the timers.  Call it every loop of the owning thread.
    pub fn poll(&mut self, now: u128) -> Option<LinkAction> {
        match self.state {
            LinkState::Disconnected => None,
            LinkState::Connecting => {
                if !self.handshake_timer.expired(now) {
                    return None;
                }
                if self.attempts >= self.config.handshake_retries {
                    self.close();
                    return Some(LinkAction::ConnectFailed(ConnectError::NoResponse));
                }
                self.attempts += 1;
                self.handshake_timer.reset(now);
                Some(LinkAction::SendConnect)
            }
            LinkState::Connected => {
                if now.saturating_sub(self.last_heard) > self.config.timeout_us {
                    self.close();
                    return Some(LinkAction::TimedOut);
                }
                match self.config.ping_interval_us {
                    Some(_) if self.ping_timer.expired(now) => {
                        self.ping_timer.reset(now);
                        Some(LinkAction::SendPing)
                    }
                    _ => None,
                }
            }
        }
    }

    /// Fold the local buffer stats into the user facing health view
    pub fn health(&self, stats: &JitterStats, frame_size: FrameSize) -> LinkHealth {
        let total_delay_ms = self.rtt_ms
            + (stats.capacity + self.server_capacity) as f64 * frame_size.period_ms();
        let connected = self.is_connected();
        LinkHealth {
            state: self.state,
            rtt_ms: self.rtt_ms,
            total_delay_ms: total_delay_ms,
            fill_ratio: stats.fill_ratio(),
            dropouts: stats.window_dropouts,
            dropout_rate: stats.dropout_rate(),
            local_capacity: stats.capacity,
            server_capacity: self.server_capacity,
            delay_light: if connected {
                delay_light(total_delay_ms)
            } else {
                Color::Black
            },
            buffer_light: if connected {
                buffer_light(stats.dropout_rate())
            } else {
                Color::Black
            },
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ state: {:?}, rtt: {:.1}ms, server_cap: {} }}",
            self.state, self.rtt_ms, self.server_capacity
        )
    }
}
