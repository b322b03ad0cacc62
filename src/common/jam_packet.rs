//! chunk of bytes that goes on the wire
//!
//! Every datagram on the jam socket is a `JamPacket`: a fixed 20 byte header
//! followed by a payload that depends on the packet kind.  Audio is one frame
//! per packet, channel blocked, either 16 bit PCM (High quality) or 8 bit
//! mu-law (Normal quality).  Nothing is retransmitted, a lost packet is just
//! a hole the jitter buffer fills with silence.
//!
//! ```text
//!  0 kind      u8
//!  1 channels  u8
//!  2 quality   u8
//!  3 frame     u8   frame length / 64
//!  4 client_id u32
//!  8 sequence  u16  wraps at 65536
//! 10 extra     u16  kind specific (ack status, server buffer capacity)
//! 12 timestamp u64  sender clock in microseconds
//! 20 payload
//! ```
use byteorder::{ByteOrder, NetworkEndian};
use num::FromPrimitive;
use serde::Serialize;
use simple_error::bail;
use std::fmt;

use super::audio_frame::{AudioFrame, FrameSize, MAX_CHANNELS, MAX_FRAME_SIZE};
use super::box_error::BoxError;
use crate::utils::clip_float;

pub const JAM_HEADER_SIZE: usize = 20;
/// big enough for a stereo 256 sample frame at 16 bits
pub const JAM_BUF_SIZE: usize = JAM_HEADER_SIZE + MAX_FRAME_SIZE * MAX_CHANNELS * 2;
/// param u8, target u32, value f32
pub const CONTROL_PAYLOAD_SIZE: usize = 9;
/// longest channel name a Connect can carry, in bytes
pub const MAX_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize)]
pub enum PacketKind {
    Audio = 1,
    Connect,
    ConnectAck,
    Ping,
    Pong,
    Control,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize)]
pub enum AudioQuality {
    /// 8 bit mu-law
    Normal = 0,
    /// 16 bit linear
    High = 1,
}

impl AudioQuality {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            AudioQuality::Normal => 1,
            AudioQuality::High => 2,
        }
    }
}

impl Default for AudioQuality {
    fn default() -> Self {
        AudioQuality::High
    }
}

/// What a Control packet changes on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize)]
pub enum ControlParam {
    Gain = 1,
    Pan,
    Mute,
    Solo,
    /// capacity of the sender's own buffer on the server
    BufferCapacity,
    /// turn server side auto sizing on (value != 0) or off
    AutoBuffer,
}

/// the message that gets read/write on the udp socket
///
/// just has getters/setters to make sure everything is network endian and
/// packed tight.
#[derive(Clone)]
pub struct JamPacket {
    buffer: [u8; JAM_BUF_SIZE],
    nbytes: usize,
}

impl JamPacket {
    pub fn new(kind: PacketKind) -> JamPacket {
        let mut packet = JamPacket {
            buffer: [0; JAM_BUF_SIZE],
            nbytes: JAM_HEADER_SIZE,
        };
        packet.set_kind(kind);
        packet
    }
    /// None if the byte is not a kind we know
    pub fn get_kind(&self) -> Option<PacketKind> {
        FromPrimitive::from_u8(self.buffer[0])
    }
    pub fn set_kind(&mut self, kind: PacketKind) -> () {
        self.buffer[0] = kind as u8;
    }
    pub fn get_channels(&self) -> u8 {
        self.buffer[1]
    }
    pub fn set_channels(&mut self, n: u8) -> () {
        self.buffer[1] = n;
    }
    pub fn get_quality(&self) -> Option<AudioQuality> {
        FromPrimitive::from_u8(self.buffer[2])
    }
    pub fn set_quality(&mut self, q: AudioQuality) -> () {
        self.buffer[2] = q as u8;
    }
    pub fn get_frame_size(&self) -> Option<FrameSize> {
        FrameSize::from_code(self.buffer[3])
    }
    pub fn set_frame_size(&mut self, size: FrameSize) -> () {
        self.buffer[3] = size.code();
    }
    /// id of the client this packet belongs to (assigned by the server)
    pub fn get_client_id(&self) -> u32 {
        NetworkEndian::read_u32(&self.buffer[4..8])
    }
    pub fn set_client_id(&mut self, id: u32) -> () {
        NetworkEndian::write_u32(&mut self.buffer[4..8], id)
    }
    pub fn get_sequence_num(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer[8..10])
    }
    pub fn set_sequence_num(&mut self, seq: u16) -> () {
        NetworkEndian::write_u16(&mut self.buffer[8..10], seq)
    }
    pub fn get_extra(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer[10..12])
    }
    pub fn set_extra(&mut self, v: u16) -> () {
        NetworkEndian::write_u16(&mut self.buffer[10..12], v)
    }
    pub fn get_timestamp(&self) -> u64 {
        NetworkEndian::read_u64(&self.buffer[12..20])
    }
    pub fn set_timestamp(&mut self, t: u64) -> () {
        NetworkEndian::write_u64(&mut self.buffer[12..20], t)
    }
    /// Get the whole buffer (used for reading from the network)
    pub fn get_buffer(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
    /// Get the slice of buffer that has some data
    pub fn get_send_buffer(&self) -> &[u8] {
        &self.buffer[0..self.nbytes]
    }
    pub fn get_nbytes(&self) -> usize {
        self.nbytes
    }
    /// set the number of bytes on the packet (so when we read one, this says how much we read)
    pub fn set_nbytes(&mut self, amt: usize) -> Result<(), BoxError> {
        if !self.is_valid(amt) {
            bail!("invalid packet length {}", amt);
        }
        self.nbytes = amt;
        Ok(())
    }
    /// some simple sanity checks on the length and kind
    pub fn is_valid(&self, amt: usize) -> bool {
        amt >= JAM_HEADER_SIZE && amt <= JAM_BUF_SIZE && self.get_kind().is_some()
    }
    fn payload(&self) -> &[u8] {
        &self.buffer[JAM_HEADER_SIZE..self.nbytes]
    }

    /// Encode a frame as the audio payload.  Returns the packet length.
    pub fn encode_audio(&mut self, frame: &AudioFrame, quality: AudioQuality) -> usize {
        self.set_kind(PacketKind::Audio);
        self.set_channels(frame.channels() as u8);
        self.set_quality(quality);
        if let Some(size) = frame.frame_size() {
            self.set_frame_size(size);
        }
        let mut idx = JAM_HEADER_SIZE;
        for ch in 0..frame.channels() {
            for v in frame.channel(ch) {
                match quality {
                    AudioQuality::High => {
                        NetworkEndian::write_i16(&mut self.buffer[idx..idx + 2], to_i16(*v));
                        idx += 2;
                    }
                    AudioQuality::Normal => {
                        self.buffer[idx] = linear_to_mulaw(to_i16(*v));
                        idx += 1;
                    }
                }
            }
        }
        self.nbytes = idx;
        idx
    }
    /// rebuild the frame carried in an audio packet.  Anything that does not
    /// add up (bad frame code, channel count, truncated payload) is an error,
    /// never a partly filled frame.
    pub fn decode_audio(&self) -> Result<AudioFrame, BoxError> {
        if self.get_kind() != Some(PacketKind::Audio) {
            bail!("not an audio packet");
        }
        let size = match self.get_frame_size() {
            Some(s) => s,
            None => bail!("bad frame code {}", self.buffer[3]),
        };
        let quality = match self.get_quality() {
            Some(q) => q,
            None => bail!("bad quality {}", self.buffer[2]),
        };
        let channels = self.get_channels() as usize;
        if channels < 1 || channels > MAX_CHANNELS {
            bail!("bad channel count {}", channels);
        }
        let expected = size.samples() * channels * quality.bytes_per_sample();
        let payload = self.payload();
        if payload.len() != expected {
            bail!("audio payload {} bytes, expected {}", payload.len(), expected);
        }
        let mut frame = AudioFrame::silent(size, channels);
        let width = quality.bytes_per_sample();
        for ch in 0..channels {
            let block = &payload[ch * size.samples() * width..(ch + 1) * size.samples() * width];
            for (i, out) in frame.channel_mut(ch).iter_mut().enumerate() {
                let raw = match quality {
                    AudioQuality::High => NetworkEndian::read_i16(&block[i * 2..i * 2 + 2]),
                    AudioQuality::Normal => mulaw_to_linear(block[i]),
                };
                *out = raw as f32 / 32767.0;
            }
        }
        Ok(frame)
    }

    /// Control payload: which parameter, which contributor, the value
    pub fn encode_control(&mut self, param: ControlParam, target: u32, value: f32) -> usize {
        self.set_kind(PacketKind::Control);
        let idx = JAM_HEADER_SIZE;
        self.buffer[idx] = param as u8;
        NetworkEndian::write_u32(&mut self.buffer[idx + 1..idx + 5], target);
        NetworkEndian::write_f32(&mut self.buffer[idx + 5..idx + 9], value);
        self.nbytes = idx + CONTROL_PAYLOAD_SIZE;
        self.nbytes
    }
    pub fn decode_control(&self) -> Result<(ControlParam, u32, f32), BoxError> {
        if self.get_kind() != Some(PacketKind::Control) {
            bail!("not a control packet");
        }
        let payload = self.payload();
        if payload.len() < CONTROL_PAYLOAD_SIZE {
            bail!("short control payload: {} bytes", payload.len());
        }
        let param: ControlParam = match FromPrimitive::from_u8(payload[0]) {
            Some(p) => p,
            None => bail!("unknown control param {}", payload[0]),
        };
        let target = NetworkEndian::read_u32(&payload[1..5]);
        let value = NetworkEndian::read_f32(&payload[5..9]);
        if !value.is_finite() {
            bail!("control value is not a number");
        }
        Ok((param, target, value))
    }
    /// Connect payload: the name to show on this client's fader, utf-8.
    /// Cut at a character boundary to fit [`MAX_NAME_LEN`].
    pub fn set_name(&mut self, name: &str) -> usize {
        let mut len = name.len().min(MAX_NAME_LEN);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        let idx = JAM_HEADER_SIZE;
        self.buffer[idx..idx + len].copy_from_slice(&name.as_bytes()[..len]);
        self.nbytes = idx + len;
        self.nbytes
    }
    pub fn get_name(&self) -> String {
        let payload = self.payload();
        let len = payload.len().min(MAX_NAME_LEN);
        String::from_utf8_lossy(&payload[..len]).trim().to_string()
    }
    /// short header only packets (Ping, Pong, Connect, ConnectAck, Disconnect)
    pub fn make_header_only(&mut self, kind: PacketKind) -> usize {
        self.set_kind(kind);
        self.nbytes = JAM_HEADER_SIZE;
        self.nbytes
    }
}

fn to_i16(v: f32) -> i16 {
    (clip_float(v) * 32767.0) as i16
}

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

fn linear_to_mulaw(sample: i16) -> u8 {
    let mut s = sample as i32;
    let sign = if s < 0 {
        s = -s;
        0x80
    } else {
        0
    };
    s = s.min(MULAW_CLIP) + MULAW_BIAS;
    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (s & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (s >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

fn mulaw_to_linear(byte: u8) -> i16 {
    let u = !byte as i32;
    let exponent = (u >> 4) & 0x07;
    let mantissa = u & 0x0F;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

impl fmt::Display for JamPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ kind: {:?}, client: {}, seq: {}, extra: {}, ts: {}, nbytes: {} }}",
            self.get_kind(),
            self.get_client_id(),
            self.get_sequence_num(),
            self.get_extra(),
            self.get_timestamp(),
            self.nbytes
        )
    }
}

#[cfg(test)]
mod test_jam_packet {
    use super::*;

    fn ramp(n: usize, scale: f32) -> Vec<f32> {
        (0..n).map(|i| scale * (i as f32 / n as f32 - 0.5)).collect()
    }

    #[test]
    fn header_fields() {
        let mut msg = JamPacket::new(PacketKind::Ping);
        msg.set_client_id(32);
        msg.set_sequence_num(65535);
        msg.set_extra(7);
        msg.set_timestamp(4432);
        assert_eq!(msg.get_kind(), Some(PacketKind::Ping));
        assert_eq!(msg.get_client_id(), 32);
        assert_eq!(msg.get_sequence_num(), 65535);
        assert_eq!(msg.get_extra(), 7);
        assert_eq!(msg.get_timestamp(), 4432);
        assert_eq!(msg.get_send_buffer().len(), JAM_HEADER_SIZE);
    }
    #[test]
    fn is_valid() {
        let msg = JamPacket::new(PacketKind::Audio);
        assert_eq!(msg.is_valid(0), false);
        assert_eq!(msg.is_valid(JAM_HEADER_SIZE), true);
        assert_eq!(msg.is_valid(JAM_BUF_SIZE + 1), false);
        let mut msg = JamPacket::new(PacketKind::Audio);
        msg.get_buffer()[0] = 99;
        assert!(msg.set_nbytes(JAM_HEADER_SIZE).is_err());
    }
    #[test]
    fn high_quality_audio() {
        let a = ramp(128, 1.0);
        let b = ramp(128, -0.5);
        let frame = AudioFrame::capture(&a, Some(&b)).unwrap();
        let mut msg = JamPacket::new(PacketKind::Audio);
        assert_eq!(
            msg.encode_audio(&frame, AudioQuality::High),
            JAM_HEADER_SIZE + 128 * 2 * 2
        );
        let decoded = msg.decode_audio().unwrap();
        assert_eq!(decoded.len(), 128);
        assert_eq!(decoded.channels(), 2);
        for i in 0..128 {
            assert!((decoded.channel(0)[i] - a[i]).abs() < 1e-4);
            assert!((decoded.channel(1)[i] - b[i]).abs() < 1e-4);
        }
    }
    #[test]
    fn mulaw_audio_is_close() {
        let a = ramp(64, 1.6);
        let frame = AudioFrame::capture(&a, None).unwrap();
        let mut msg = JamPacket::new(PacketKind::Audio);
        assert_eq!(
            msg.encode_audio(&frame, AudioQuality::Normal),
            JAM_HEADER_SIZE + 64
        );
        let decoded = msg.decode_audio().unwrap();
        assert_eq!(decoded.channels(), 1);
        for i in 0..64 {
            // mu-law error is relative to the magnitude
            let err = (decoded.channel(0)[i] - a[i]).abs();
            assert!(err <= 0.002 + a[i].abs() * 0.07, "{} vs {}", decoded.channel(0)[i], a[i]);
        }
    }
    #[test]
    fn mulaw_endpoints() {
        assert_eq!(mulaw_to_linear(linear_to_mulaw(0)), 0);
        assert!(mulaw_to_linear(linear_to_mulaw(32767)) > 32000);
        assert!(mulaw_to_linear(linear_to_mulaw(-32767)) < -32000);
    }
    #[test]
    fn truncated_audio_is_rejected() {
        let a = vec![0.1; 128];
        let frame = AudioFrame::capture(&a, None).unwrap();
        let mut msg = JamPacket::new(PacketKind::Audio);
        let len = msg.encode_audio(&frame, AudioQuality::High);
        msg.set_nbytes(len - 2).unwrap();
        assert!(msg.decode_audio().is_err());
        // wrong frame code
        msg.set_nbytes(len).unwrap();
        msg.get_buffer()[3] = 3;
        assert!(msg.decode_audio().is_err());
    }
    #[test]
    fn control_round_trip() {
        let mut msg = JamPacket::new(PacketKind::Control);
        msg.encode_control(ControlParam::Pan, 12, -0.25);
        let (param, target, value) = msg.decode_control().unwrap();
        assert_eq!(param, ControlParam::Pan);
        assert_eq!(target, 12);
        assert_eq!(value, -0.25);
        msg.get_buffer()[JAM_HEADER_SIZE] = 42;
        assert!(msg.decode_control().is_err());
    }
    #[test]
    fn connect_carries_a_name() {
        let mut msg = JamPacket::new(PacketKind::Connect);
        msg.make_header_only(PacketKind::Connect);
        assert_eq!(msg.get_name(), "");
        assert_eq!(msg.set_name("bass"), JAM_HEADER_SIZE + 4);
        assert_eq!(msg.get_name(), "bass");
        // long names are cut without splitting a character
        let long = "é".repeat(20);
        msg.set_name(&long);
        assert_eq!(msg.get_nbytes(), JAM_HEADER_SIZE + MAX_NAME_LEN);
        assert_eq!(msg.get_name(), "é".repeat(16));
    }
}
