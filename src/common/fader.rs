//! Constant power left/right fader
//!
//! This is the one pan law in the system.  The client uses it to show what a
//! pan setting does and the server uses it to sum the personal mixes, so the
//! two can never disagree.
//!
//! left = sqrt(1 - pan), right = sqrt(1 + pan).  Center is unity on both
//! sides, hard pan puts sqrt(2) (+3dB) on one side and nothing on the other.
//! left^2 + right^2 is always 2.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fader {
    left: f32,
    right: f32,
    val: f32,
}

impl Fader {
    pub fn new() -> Fader {
        let mut f = Fader {
            left: 1.0,
            right: 1.0,
            val: 0.0,
        };
        f.set(0.0);
        f
    }
    /// call this with a value from -1.0 (hard pan left) to +1.0 (hard pan right)
    /// 0.0 means pan center.  NaN is ignored.
    pub fn set(&mut self, v: f32) -> () {
        if v.is_nan() {
            return;
        }
        self.val = f32::clamp(v, -1.0, 1.0);
        self.left = f32::sqrt(1.0 - self.val);
        self.right = f32::sqrt(1.0 + self.val);
    }

    pub fn get(&self) -> f32 {
        self.val
    }

    pub fn left(&self) -> f32 {
        self.left
    }

    pub fn right(&self) -> f32 {
        self.right
    }
}

impl Default for Fader {
    fn default() -> Self {
        Fader::new()
    }
}

impl fmt::Display for Fader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[ left: {}, right: {} ]", self.left, self.right)
    }
}
