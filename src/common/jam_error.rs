//! Typed failures reported to the control layer.
//!
//! Packet level trouble (loss, duplicates, late packets) never shows up here,
//! that is all absorbed by the jitter buffer.  These are the conditions
//! somebody outside the core has to act on.
use serde::Serialize;
use std::{error::Error, fmt};

/// The audio backend gave up.  Fatal for the stream until it is reconfigured.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AudioIoError {
    /// could not open the device at all
    DeviceUnavailable(String),
    /// device opened but won't run the requested format
    FormatUnsupported(String),
    /// device went away while running (unplugged, server died)
    DeviceLost(String),
    /// start/stop called in the wrong order
    NotOpen,
    AlreadyRunning,
}

impl fmt::Display for AudioIoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AudioIoError::DeviceUnavailable(d) => write!(f, "audio device unavailable: {}", d),
            AudioIoError::FormatUnsupported(d) => write!(f, "audio format not supported: {}", d),
            AudioIoError::DeviceLost(d) => write!(f, "audio device lost: {}", d),
            AudioIoError::NotOpen => write!(f, "audio backend is not open"),
            AudioIoError::AlreadyRunning => write!(f, "audio backend already running"),
        }
    }
}

impl Error for AudioIoError {}

/// Requested jitter buffer capacity is outside what the ring can hold
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityError {
    pub requested: usize,
    pub min: usize,
    pub max: usize,
}

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "buffer capacity {} outside of {}..={} frames",
            self.requested, self.min, self.max
        )
    }
}

impl Error for CapacityError {}

/// Why a connection attempt did not make it to Connected.
///
/// The discriminants are the status codes carried in a ConnectAck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize)]
pub enum ConnectError {
    ServerFull = 1,
    UnsupportedFormat = 2,
    NoResponse = 3,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectError::ServerFull => write!(f, "could not connect: server is full"),
            ConnectError::UnsupportedFormat => {
                write!(f, "could not connect: server does not support this audio format")
            }
            ConnectError::NoResponse => write!(f, "could not connect: no response from server"),
        }
    }
}

impl Error for ConnectError {}

#[cfg(test)]
mod test_jam_error {
    use super::*;
    use crate::common::box_error::BoxError;
    use num::FromPrimitive;

    #[test]
    fn messages() {
        let e = CapacityError {
            requested: 99,
            min: 1,
            max: 64,
        };
        assert_eq!(e.to_string(), "buffer capacity 99 outside of 1..=64 frames");
        let e = AudioIoError::DeviceLost(String::from("hw:1"));
        assert_eq!(e.to_string(), "audio device lost: hw:1");
    }
    #[test]
    fn connect_codes() {
        let e: Option<ConnectError> = FromPrimitive::from_u16(1);
        assert_eq!(e, Some(ConnectError::ServerFull));
        let e: Option<ConnectError> = FromPrimitive::from_u16(0);
        assert_eq!(e, None);
    }
    #[test]
    fn boxes_up() {
        // typed errors have to travel as BoxError through ?
        fn fails() -> Result<(), BoxError> {
            let res: Result<(), AudioIoError> = Err(AudioIoError::NotOpen);
            res?;
            Ok(())
        }
        assert!(fails().is_err());
    }
}
