//! Signal helpers that sit next to the audio path.

pub mod smoothing_filter;
