//! rtmix - real time jam mixing library
//!
//! provides the pieces to build a jam client (captures audio, ships it to a
//! server, plays back what comes home) and a mix server that builds a
//! personal mix for every connected player.
//!
//! The interesting part is the path a frame takes between the network and the
//! audio callback: [`common::jitter_buffer`] absorbs arrival jitter with a
//! fixed, adjustable delay, [`common::delay_estimator`] picks that delay, and
//! [`server::mix_engine`] applies a per listener gain/pan/mute/solo matrix.
extern crate json;
#[macro_use]
extern crate num_derive;

pub mod common;
pub mod dsp;
pub mod server;
pub mod sound;
pub mod utils;
