//! Floating-point PID used by the reel servo loop. One instance drives the
//! shuttle velocity loop; a second, separately-tuned instance drives the
//! play acceleration boost. The output (CV) is a torque contribution, so it
//! is clamped to the non-negative DAC range rather than being symmetric.
//!
//! [Some background on the PID terms](https://gist.github.com/exocode/90339d7f946ad5f83dd1cf29bf5df0dc)

use num_traits::Float;

/// Dead band applied to the setpoint error; errors smaller than this are
/// treated as zero so the loop doesn't hunt around the target.
pub const PID_TOLERANCE: f32 = 3.0;

#[derive(Clone, Default)]
pub struct Pid {
    pub k_p: f32,
    pub k_i: f32,
    pub k_d: f32,

    /// Maximum CV range allowed (eg, DAC max). Also bounds the integrator.
    pub cv_max: f32,
    pub tolerance: f32,

    /// Most recent setpoint error, kept for the monitor display.
    pub error: f32,
    /// Integrator state: running sum of errors, clamped to [0, cv_max].
    esum: f32,
    /// Previous process value, for derivative-on-measurement.
    pv_prev: f32,
}

impl Pid {
    pub fn new(k_p: f32, k_i: f32, k_d: f32, cv_max: f32, tolerance: f32) -> Self {
        Self {
            k_p,
            k_i,
            k_d,
            cv_max,
            tolerance,
            error: 0.,
            esum: 0.,
            pv_prev: 0.,
        }
    }

    /// Run one sample of the loop. Called at the servo rate, so the sample
    /// interval is folded into the gains.
    pub fn calc(&mut self, set_pt: f32, pv: f32) -> f32 {
        self.error = set_pt - pv;

        if self.error.abs() < self.tolerance {
            self.error = 0.;
        }

        let p_term = self.k_p * self.error;

        // The integrator floors at zero: a string of negative errors bleeds
        // it off but can never drive the CV contribution negative.
        self.esum += self.error;

        if self.esum > self.cv_max {
            self.esum = self.cv_max;
        } else if self.esum < 0. {
            self.esum = 0.;
        }

        let mut k_i = self.k_i;
        if k_i > self.cv_max {
            k_i = self.cv_max;
        }

        let i_term = k_i * self.esum;

        // Derivative on measurement, not error, to avoid derivative kick
        // when the setpoint steps (eg a shuttle velocity change).
        let d_term = self.k_d * (self.pv_prev - pv);
        self.pv_prev = pv;

        let mut cv = p_term + i_term + d_term;

        if cv < 0. {
            cv = 0.;
        } else if cv > self.cv_max {
            cv = self.cv_max;
        }

        cv
    }
}
