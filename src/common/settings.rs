//! Typed view of the settings both executables run with.
use json::JsonValue;
use serde::Serialize;
use simple_error::bail;

use super::audio_frame::FrameSize;
use super::box_error::BoxError;
use super::config::Config;
use super::delay_estimator::EstimatorConfig;
use super::jam_packet::AudioQuality;
use super::jitter_buffer::{DEFAULT_CAPACITY, MAX_CAPACITY, MIN_CAPACITY};

pub const DEFAULT_PORT: u32 = 7891;
pub const DEFAULT_SETTINGS_FILE: &str = "settings.json";

/// Built in values for every key
pub fn defaults() -> JsonValue {
    json::object! {
        "port": DEFAULT_PORT,
        "max_clients": 8,
        "frame_size": 128,
        "channels": 2,
        "quality": "high",
        "buffer_capacity": DEFAULT_CAPACITY,
        "auto_buffer": true,
        "min_capacity": MIN_CAPACITY,
        "max_capacity": 16,
        "jitter_percentile": 0.99,
        "eval_interval_ms": 2000,
        "mix_own_audio": true,
        "server": "",
        "name": "",
        "link_timeout_ms": 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JamSettings {
    pub port: u32,
    pub max_clients: usize,
    pub frame_size: FrameSize,
    pub channels: usize,
    pub quality: AudioQuality,
    pub buffer_capacity: usize,
    pub auto_buffer: bool,
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub jitter_percentile: f64,
    pub eval_interval_ms: u32,
    pub mix_own_audio: bool,
    /// server to connect to on startup ("" for none)
    pub server: String,
    /// what the other players see on this client's fader ("" for the default)
    pub name: String,
    /// 0 uses the side's default
    pub link_timeout_ms: u32,
}

impl JamSettings {
    pub fn from_config(config: &Config) -> Result<JamSettings, BoxError> {
        let frame = config.get_u32_value("frame_size", None)?;
        let frame_size = match FrameSize::from_samples(frame as usize) {
            Some(f) => f,
            None => bail!("frame_size {} is not one of 64, 128, 256", frame),
        };
        let channels = config.get_u32_value("channels", None)? as usize;
        if channels < 1 || channels > 2 {
            bail!("channels must be 1 or 2, not {}", channels);
        }
        let quality = match config.get_str_value("quality", None)?.as_str() {
            "high" => AudioQuality::High,
            "normal" => AudioQuality::Normal,
            other => bail!("quality must be high or normal, not {}", other),
        };
        let min_capacity = config.get_u32_value("min_capacity", None)? as usize;
        let max_capacity = config.get_u32_value("max_capacity", None)? as usize;
        if min_capacity < MIN_CAPACITY || max_capacity > MAX_CAPACITY || min_capacity > max_capacity
        {
            bail!(
                "capacity limits {}..={} outside of {}..={}",
                min_capacity,
                max_capacity,
                MIN_CAPACITY,
                MAX_CAPACITY
            );
        }
        let buffer_capacity = config.get_u32_value("buffer_capacity", None)? as usize;
        if buffer_capacity < min_capacity || buffer_capacity > max_capacity {
            bail!(
                "buffer_capacity {} outside of {}..={}",
                buffer_capacity,
                min_capacity,
                max_capacity
            );
        }
        Ok(JamSettings {
            port: config.get_u32_value("port", None)?,
            max_clients: config.get_u32_value("max_clients", None)? as usize,
            frame_size: frame_size,
            channels: channels,
            quality: quality,
            buffer_capacity: buffer_capacity,
            auto_buffer: config.get_bool_value("auto_buffer", None)?,
            min_capacity: min_capacity,
            max_capacity: max_capacity,
            jitter_percentile: config.get_f64_value("jitter_percentile", None)?,
            eval_interval_ms: config.get_u32_value("eval_interval_ms", None)?,
            mix_own_audio: config.get_bool_value("mix_own_audio", None)?,
            server: config.get_str_value("server", None)?,
            name: config.get_str_value("name", None)?,
            link_timeout_ms: config.get_u32_value("link_timeout_ms", None)?,
        })
    }

    pub fn estimator_config(&self) -> EstimatorConfig {
        EstimatorConfig {
            auto: self.auto_buffer,
            percentile: self.jitter_percentile,
            min_capacity: self.min_capacity,
            max_capacity: self.max_capacity,
            eval_interval_us: self.eval_interval_ms as u128 * 1000,
            frame_size: self.frame_size,
            ..Default::default()
        }
    }
}
