//! boxed error type used everywhere a typed error would be overkill.
//!
//! The Send + Sync bounds let errors cross the audio, network and mix threads.
pub type BoxError = std::boxed::Box<
    dyn std::error::Error // must implement Error to satisfy ?
        + std::marker::Send // needed for threads
        + std::marker::Sync, // needed for threads
>;
