use num::{Float, FromPrimitive};
use std::fmt::{self, Display};

use crate::utils::get_coef;

/// One pole low pass used to smooth measurements (ping time, loop time).
///
/// `time_const` is in seconds and `update_rate` is how many times a second
/// `get` is called.  The first input seeds the output so it doesn't have to
/// ramp up from zero.
#[derive(Debug, Clone)]
pub struct SmoothingFilter<T> {
    coef: T,
    last_output: T,
    seeded: bool,
}

impl<T: Float + FromPrimitive> SmoothingFilter<T> {
    pub fn new(time_const: T, update_rate: T) -> SmoothingFilter<T> {
        SmoothingFilter {
            coef: get_coef(time_const, update_rate),
            last_output: T::zero(),
            seeded: false,
        }
    }

    pub fn get(&mut self, input: T) -> T {
        if !self.seeded {
            self.seeded = true;
            self.last_output = input;
            return input;
        }
        self.last_output = input * self.coef + (T::one() - self.coef) * self.last_output;
        self.last_output
    }
    pub fn get_last_output(&self) -> T {
        self.last_output
    }
    pub fn reset(&mut self) {
        self.seeded = false;
        self.last_output = T::zero();
    }
}

impl<T: Float + FromPrimitive + Display> Display for SmoothingFilter<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ coef: {}, last_output: {} }}",
            self.coef, self.last_output
        )
    }
}
