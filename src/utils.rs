//! small numeric helpers shared by the mixer, the fader and the filters

/// convert a dB value into a linear gain (0 dB => 1.0)
pub fn to_lin(db: f32) -> f32 {
    f32::powf(10.0, db / 20.0)
}

/// convert a linear gain into dB.  Silence is reported as -100 dB
pub fn to_db(lin: f32) -> f32 {
    if lin <= 0.00001 {
        return -100.0;
    }
    20.0 * f32::log10(lin)
}

/// clamp a value into the valid sample range
pub fn clip_float(v: f32) -> f32 {
    if v.is_nan() {
        return 0.0;
    }
    v.clamp(-1.0, 1.0)
}

/// one pole filter coefficient for a time constant (seconds) at an update rate (Hz)
pub fn get_coef<T: num::Float + num::FromPrimitive>(time_const: T, rate: T) -> T {
    let one = T::one();
    if time_const <= T::zero() || rate <= T::zero() {
        return one;
    }
    one - (-one / (time_const * rate)).exp()
}
