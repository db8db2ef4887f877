//! The reel motor servo loop. `ServoState::tick` runs at 500 Hz from the
//! servo timer ISR: it samples the encoders, tach and ADC, maintains the
//! reeling-radius and null-offset estimates, then dispatches to the handler
//! for the current mode. Every handler reduces to two torque set-points,
//! clamped to the DAC range.
//!
//! Each transport mode of operation requires a different servo loop:
//! HALT writes fixed (normally zero) levels, STOP dynamically brakes by
//! opposing whatever motion remains, PLAY holds tension with an initial
//! acceleration boost, and FWD/REW run a constant-velocity PID with
//! hold-back on the free-wheeling reel.

pub mod sequencer;

use num_traits::Float;

use crate::{
    params::{SystemParams, TapeWidth},
    pid::{Pid, PID_TOLERANCE},
    state::{ModeCtl, ServoMode, ServoState, StopBrake, TapeDir},
    util::clamp,
};

/// 10-bit full scale DAC.
pub const DAC_MAX: u16 = 0x3FF;
pub const DAC_MAX_F: f32 = 1_023.;

/// Null offset averaging window: 500 samples is one second at the 500 Hz
/// servo rate.
const OFFSET_CALC_PERIOD: u32 = 500;
const OFFSET_SCALE: f32 = 500.;
const OFFSET_DELTA_MAX: f32 = 1_000.;

/// Soft stop-brake torque falls off with velocity at this slope.
const CPR_DIV_2: f32 = 1.0 / 2.048;

/// Reel velocity floor for radius/offset math; both reels must clear it.
const VEL_FLOOR_HI_SPEED: f32 = 40.;
const VEL_FLOOR_LO_SPEED: f32 = 20.;

/// Play acceleration boost window, in servo ticks (one second).
pub const PLAY_BOOST_TICKS: u32 = 500;

/// Auto-slow arms only once the shuttle is within this band of its target.
const AUTOSLOW_TARGET_BAND: f32 = 10.;

/// One servo tick's worth of raw sensor inputs, gathered by the servo task
/// before the loop math runs.
#[derive(Clone, Copy, Default)]
pub struct ServoInputs {
    /// Averaged tape roller tach, Hz. Zero when the roller is still.
    pub tape_tach: f32,
    /// Per-reel pulse counts over the velocity window.
    pub velocity_supply: f32,
    pub velocity_takeup: f32,
    /// Per-reel direction: +1 forward, -1 reverse.
    pub dir_supply: i8,
    pub dir_takeup: i8,
    /// ADC sequence: tension arm, supply current, takeup current,
    /// expansion, CPU temperature.
    pub adc: [u16; 5],
}

impl ServoState {
    /// One pass of the servo loop. Returns the clamped (supply, takeup)
    /// DAC codes; the caller owns the SPI write.
    pub fn tick(
        &mut self,
        ctl: &mut ModeCtl,
        inputs: &ServoInputs,
        params: &SystemParams,
        width: TapeWidth,
        hi_speed: bool,
    ) -> (u16, u16) {
        self.sync_mode(ctl, params, hi_speed);
        self.sample(ctl, inputs, params, width);
        self.update_reeling(params, hi_speed);

        let (dac_s, dac_t) = match self.mode {
            ServoMode::Halt => self.svc_halt(),
            ServoMode::Stop => self.svc_stop(params),
            ServoMode::Play => self.svc_play(),
            ServoMode::Fwd => self.svc_fwd(params),
            ServoMode::Rew => self.svc_rew(params),
        };

        let dac_s = clamp(dac_s, 0., DAC_MAX_F) as u16;
        let dac_t = clamp(dac_t, 0., DAC_MAX_F) as u16;

        self.dac_supply = dac_s;
        self.dac_takeup = dac_t;

        (dac_s, dac_t)
    }

    /// Pick up a committed mode change. The change lands at the top of a
    /// tick, never mid-tick, so handlers only ever see a consistent mode.
    fn sync_mode(&mut self, ctl: &ModeCtl, params: &SystemParams, hi_speed: bool) {
        let mode = ctl.mode();

        if mode == self.mode {
            return;
        }

        self.mode_prev = self.mode;
        self.mode = mode;

        match mode {
            ServoMode::Stop => {
                self.stop_brake = ctl.brake_entry;
            }
            ServoMode::Play => self.reset_play(params, hi_speed),
            ServoMode::Fwd | ServoMode::Rew => self.reset_shuttle(ctl, params),
            ServoMode::Halt => {}
        }
    }

    /// Arm the play boost window and load the tension set for the current
    /// tape speed. Runs once on each PLAY entry.
    fn reset_play(&mut self, params: &SystemParams, hi_speed: bool) {
        self.play_boost_count = PLAY_BOOST_TICKS;

        if hi_speed {
            self.play_supply_tension = params.play_hi_supply_tension as f32;
            self.play_takeup_tension = params.play_hi_takeup_tension as f32;
            self.play_boost_end = params.play_hi_boost_end as f32;
            self.pid_play = Pid::new(
                params.play_hi_boost_pgain,
                params.play_hi_boost_igain,
                0.,
                DAC_MAX_F,
                PID_TOLERANCE,
            );
        } else {
            self.play_supply_tension = params.play_lo_supply_tension as f32;
            self.play_takeup_tension = params.play_lo_takeup_tension as f32;
            self.play_boost_end = params.play_lo_boost_end as f32;
            self.pid_play = Pid::new(
                params.play_lo_boost_pgain,
                params.play_lo_boost_igain,
                0.,
                DAC_MAX_F,
                PID_TOLERANCE,
            );
        }
    }

    /// Fresh shuttle PID and velocity target. Runs once on each FWD/REW
    /// entry, including direction reversals.
    fn reset_shuttle(&mut self, ctl: &ModeCtl, params: &SystemParams) {
        self.pid_shuttle = Pid::new(
            params.shuttle_servo_pgain,
            params.shuttle_servo_igain,
            params.shuttle_servo_dgain,
            DAC_MAX_F,
            PID_TOLERANCE,
        );

        self.shuttle_target = ctl.shuttle_target;
        self.autoslow_inhibit = ctl.autoslow_inhibit;
    }

    fn sample(
        &mut self,
        ctl: &mut ModeCtl,
        inputs: &ServoInputs,
        params: &SystemParams,
        width: TapeWidth,
    ) {
        self.tape_tach = inputs.tape_tach;
        self.velocity_supply = inputs.velocity_supply;
        self.velocity_takeup = inputs.velocity_takeup;
        self.velocity = inputs.velocity_supply + inputs.velocity_takeup;

        self.motion = self.velocity > params.vel_detect_threshold as f32;

        // Require both reels moving in the same direction before trusting
        // a direction reading; avoids jitter near stopped conditions.
        self.direction = if inputs.dir_supply == inputs.dir_takeup && self.motion {
            if inputs.dir_supply >= 0 {
                TapeDir::Fwd
            } else {
                TapeDir::Rew
            }
        } else {
            TapeDir::None
        };

        self.adc = inputs.adc;
        self.cpu_temp = inputs.adc[4] as f32;

        let midscale = match width {
            TapeWidth::One => params.tension_sensor_midscale1,
            TapeWidth::Two => params.tension_sensor_midscale2,
        };
        self.tsense = (midscale - inputs.adc[0] as f32) * params.tension_sensor_gain;

        // Publish motion status for the controller's pending-stop polling.
        ctl.motion = self.motion;
        ctl.velocity = self.velocity;
        ctl.direction = self.direction;
    }

    /// Reeling radius and servo null offset. The reel with more tape pack
    /// turns more slowly; averaging the velocity ratio of the two reels
    /// over one second gives a torque bias that compensates for the
    /// constantly changing hub radius.
    fn update_reeling(&mut self, params: &SystemParams, hi_speed: bool) {
        let floor = if hi_speed {
            VEL_FLOOR_HI_SPEED
        } else {
            VEL_FLOOR_LO_SPEED
        };

        if self.velocity_takeup <= floor || self.velocity_supply <= floor {
            return;
        }

        self.radius_takeup = self.tape_tach / self.velocity_takeup * params.reel_radius_gain;
        self.radius_supply = self.tape_tach / self.velocity_supply * params.reel_radius_gain;

        let vt = self.velocity_takeup;
        let vs = self.velocity_supply;

        let mut delta = if vt > vs {
            (vt * OFFSET_SCALE) / vs - OFFSET_SCALE
        } else if vs > vt {
            (vs * OFFSET_SCALE) / vt - OFFSET_SCALE
        } else {
            0.
        };

        if delta > OFFSET_DELTA_MAX {
            delta = OFFSET_DELTA_MAX;
        }

        self.offset_null_sum += delta;
        self.offset_sample_cnt += 1;

        if self.offset_sample_cnt >= OFFSET_CALC_PERIOD {
            let offset = self.offset_null_sum / OFFSET_CALC_PERIOD as f32;

            self.offset_null = offset * params.reel_offset_gain;

            self.offset_null_sum = 0.;
            self.offset_sample_cnt = 0;
        }

        if params.reel_offset_gain <= 0. {
            // For debugging and aligning the system.
            self.offset_supply = 0.;
            self.offset_takeup = 0.;
        } else if vt > vs {
            // Takeup reel is turning faster: it gets the added torque,
            // the supply side gives it up.
            self.offset_takeup = self.offset_null;
            self.offset_supply = -self.offset_null;
        } else if vs > vt {
            self.offset_takeup = -self.offset_null;
            self.offset_supply = self.offset_null;
        } else {
            self.offset_takeup = 0.;
            self.offset_supply = 0.;
        }
    }

    /// HALT: fixed output levels, normally zero. The halt DAC fields are
    /// only nonzero under diagnostic control (DAC alignment ramps).
    fn svc_halt(&mut self) -> (f32, f32) {
        (self.dac_halt_supply as f32, self.dac_halt_takeup as f32)
    }

    /// STOP: dynamic braking. Opposing torque is applied against whatever
    /// direction of motion remains, scaled by velocity, until the combined
    /// velocity falls below the detect threshold.
    fn svc_stop(&mut self, params: &SystemParams) -> (f32, f32) {
        let mut braketorque = 0.;

        if self.stop_brake != StopBrake::Off {
            if self.velocity <= params.vel_detect_threshold as f32 {
                self.stop_brake = StopBrake::Off;
            } else {
                let torque_max = params.stop_brake_torque as f32;

                braketorque = match self.stop_brake {
                    StopBrake::Hard => self.velocity * 5.,
                    _ => torque_max - self.velocity * CPR_DIV_2,
                };

                // Underflow means velocity is far above the soft-brake
                // knee; apply the full configured torque.
                if braketorque < 0. {
                    braketorque = torque_max;
                }
                if braketorque > torque_max {
                    braketorque = torque_max;
                }
            }
        }

        self.stop_torque_supply = braketorque;
        self.stop_torque_takeup = braketorque;

        let base_s = params.stop_supply_tension as f32 + self.tsense + self.offset_supply;
        let base_t = params.stop_takeup_tension as f32 + self.tsense + self.offset_takeup;

        match self.direction {
            // Forward motion: the supply reel opposes, the takeup leads.
            TapeDir::Fwd => (base_s + braketorque, base_t - braketorque),
            TapeDir::Rew => (base_s - braketorque, base_t + braketorque),
            TapeDir::None => (base_s, base_t),
        }
    }

    /// PLAY: steady tension with an optional acceleration boost. During
    /// boost the takeup side carries the PID CV on top of its tension so
    /// the reels come up to capstan speed quickly.
    fn svc_play(&mut self) -> (f32, f32) {
        if self.play_boost_count == 0 {
            self.boost_active = false;

            let dac_s = self.play_supply_tension + self.tsense + self.offset_supply;
            let dac_t = self.play_takeup_tension + self.tsense + self.offset_takeup;

            return (dac_s, dac_t);
        }

        self.play_boost_count -= 1;
        self.boost_active = true;

        let target = self.play_boost_end;
        let cv = self.pid_play.calc(target, self.tape_tach);

        let dac_s = self.play_supply_tension + self.tsense + self.offset_supply;
        let dac_t = self.play_takeup_tension + cv + self.offset_takeup;

        // Tape roller already at speed? End the boost early.
        if cv <= 0. || self.play_boost_count == 0 {
            self.play_boost_count = 0;
            self.boost_active = false;
        }

        self.db_cv = cv;
        self.db_error = self.pid_play.error;
        self.db_target = target;

        (dac_s, dac_t)
    }

    /// FWD shuttle: constant-velocity PID. The takeup reel leads (+CV),
    /// the supply reel trails (-CV plus hold-back).
    fn svc_fwd(&mut self, params: &SystemParams) -> (f32, f32) {
        self.autoslow(params, true);

        let target = self.shuttle_target;
        let mut cv = self.pid_shuttle.calc(target, self.velocity);

        // If the shuttle direction just reversed while over speed, a
        // negative CV would increase speed; force it positive so dynamic
        // braking takes over instead.
        if self.mode_prev == ServoMode::Rew && cv < 0. {
            cv = cv.abs();
        }

        // Back tension compensating for falling motor torque as the
        // trailing reel gains velocity and free-wheels.
        let holdback = self.velocity * self.radius_supply * params.shuttle_fwd_holdback_gain;

        self.db_cv = cv;
        self.db_error = self.pid_shuttle.error;
        self.db_target = target;
        self.holdback = holdback;

        let dac_s = (params.shuttle_supply_tension as f32 + holdback + self.tsense - cv)
            + self.offset_supply;
        let dac_t =
            (params.shuttle_takeup_tension as f32 + self.tsense + cv) + self.offset_takeup;

        (dac_s, dac_t)
    }

    /// REW shuttle: mirror of FWD with the supply reel leading.
    fn svc_rew(&mut self, params: &SystemParams) -> (f32, f32) {
        self.autoslow(params, false);

        let target = self.shuttle_target;
        let mut cv = self.pid_shuttle.calc(target, self.velocity);

        if self.mode_prev == ServoMode::Fwd && cv < 0. {
            cv = cv.abs();
        }

        let holdback = self.velocity * self.radius_takeup * params.shuttle_rew_holdback_gain;

        self.db_cv = cv;
        self.db_error = self.pid_shuttle.error;
        self.db_target = target;
        self.holdback = holdback;

        let dac_s =
            (params.shuttle_supply_tension as f32 + self.tsense + cv) + self.offset_supply;
        let dac_t = (params.shuttle_takeup_tension as f32 + holdback + self.tsense - cv)
            + self.offset_takeup;

        (dac_s, dac_t)
    }

    /// End-of-reel auto-slow: when the null offset of the far-from-hub
    /// reel grows past the trigger while shuttling at speed, lower the
    /// target to the auto-slow velocity for the rest of this run.
    fn autoslow(&mut self, params: &SystemParams, fwd: bool) {
        if params.shuttle_autoslow_velocity == 0 || self.autoslow_inhibit {
            return;
        }

        let (far_offset, toward_tail) = if fwd {
            (
                self.offset_takeup,
                self.velocity_supply > self.velocity_takeup,
            )
        } else {
            (
                self.offset_supply,
                self.velocity_supply < self.velocity_takeup,
            )
        };

        if far_offset.abs() < params.autoslow_at_offset as f32 {
            return;
        }

        if !toward_tail || self.velocity < self.shuttle_target - AUTOSLOW_TARGET_BAND {
            return;
        }

        let slow = params.shuttle_autoslow_velocity as f32;

        let fast_enough = if fwd {
            self.velocity >= slow && self.velocity > params.autoslow_at_velocity as f32
        } else {
            self.velocity >= slow
        };

        if fast_enough {
            self.shuttle_target = slow;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ServoState;

    fn params() -> SystemParams {
        SystemParams::defaults(TapeWidth::Two)
    }

    fn inputs(vel_s: f32, vel_t: f32, dir: i8, tach: f32) -> ServoInputs {
        ServoInputs {
            tape_tach: tach,
            velocity_supply: vel_s,
            velocity_takeup: vel_t,
            dir_supply: dir,
            dir_takeup: dir,
            // Tension arm at midscale so tsense reads zero.
            adc: [2_047, 0, 0, 0, 0],
        }
    }

    #[test]
    fn boot_state_writes_zero_torque() {
        let mut state = ServoState::default();
        let mut ctl = ModeCtl::default();
        let p = params();

        let (s, t) = state.tick(&mut ctl, &inputs(0., 0., 1, 0.), &p, TapeWidth::Two, false);
        assert_eq!((s, t), (0, 0));
    }

    #[test]
    fn outputs_always_clamped_to_dac_range() {
        let mut state = ServoState::default();
        let mut ctl = ModeCtl::default();
        let mut p = params();
        p.stop_supply_tension = 5_000;
        p.stop_takeup_tension = 5_000;

        ctl.set_mode(ServoMode::Stop);
        let (s, t) = state.tick(&mut ctl, &inputs(0., 0., 1, 0.), &p, TapeWidth::Two, false);
        assert_eq!((s, t), (DAC_MAX, DAC_MAX));

        // And the other extreme: huge negative tension reading.
        let mut p = params();
        p.stop_supply_tension = 0;
        p.stop_takeup_tension = 0;
        p.tension_sensor_gain = 10.;
        let mut inp = inputs(0., 0., 1, 0.);
        inp.adc[0] = 4_095;

        let (s, t) = state.tick(&mut ctl, &inp, &p, TapeWidth::Two, false);
        assert_eq!((s, t), (0, 0));
    }

    #[test]
    fn stop_hard_brake_opposes_forward_motion() {
        let mut state = ServoState::default();
        let mut ctl = ModeCtl::default();
        let p = params();

        ctl.set_mode(ServoMode::Fwd);
        state.tick(&mut ctl, &inputs(200., 200., 1, 240.), &p, TapeWidth::Two, false);

        ctl.set_mode(ServoMode::Stop);
        assert!(ctl.brake_entry == StopBrake::Hard);

        let (s, t) = state.tick(&mut ctl, &inputs(200., 200., 1, 240.), &p, TapeWidth::Two, false);

        // Hard torque = min(velocity * 5, stop_brake_torque) = 650.
        assert_eq!(state.stop_torque_supply, 650.);
        // Supply opposes forward motion, takeup gives up torque.
        assert_eq!(s, 360 + 650);
        assert_eq!(t, 0); // 385 - 650, clamped
    }

    #[test]
    fn stop_brake_releases_below_velocity_threshold() {
        let mut state = ServoState::default();
        let mut ctl = ModeCtl::default();
        let p = params();

        ctl.set_mode(ServoMode::Play);
        state.tick(&mut ctl, &inputs(100., 100., 1, 240.), &p, TapeWidth::Two, false);

        ctl.set_mode(ServoMode::Stop);
        state.tick(&mut ctl, &inputs(100., 100., 1, 240.), &p, TapeWidth::Two, false);
        assert!(state.stop_brake == StopBrake::Hard);

        // Velocity sum 8 <= threshold 10: brake state drops out and the
        // baseline tensions apply alone.
        let (s, t) = state.tick(&mut ctl, &inputs(4., 4., 1, 0.), &p, TapeWidth::Two, false);
        assert!(state.stop_brake == StopBrake::Off);
        assert_eq!(s, 360);
        assert_eq!(t, 385);
    }

    #[test]
    fn play_boost_counts_down_and_ends_at_target() {
        let mut state = ServoState::default();
        let mut ctl = ModeCtl::default();
        let p = params();

        ctl.set_mode(ServoMode::Play);
        // Roller stationary: boost engages, CV > 0.
        state.tick(&mut ctl, &inputs(0., 0., 1, 0.), &p, TapeWidth::Two, false);
        assert_eq!(state.play_boost_count, PLAY_BOOST_TICKS - 1);
        assert!(state.boost_active);
        assert!(state.db_cv > 0.);

        // Roller well past the lo-speed boost target (25 Hz): CV clamps to
        // zero and the boost terminates early.
        state.tick(&mut ctl, &inputs(0., 0., 1, 500.), &p, TapeWidth::Two, false);
        assert_eq!(state.play_boost_count, 0);
        assert!(!state.boost_active);

        // Out of boost: both reels get tension plus tension-arm reading.
        let (s, t) = state.tick(&mut ctl, &inputs(0., 0., 1, 500.), &p, TapeWidth::Two, false);
        assert_eq!(s, 350);
        assert_eq!(t, 375);
    }

    #[test]
    fn fwd_applies_cv_asymmetrically() {
        let mut state = ServoState::default();
        let mut ctl = ModeCtl::default();
        let p = params();

        ctl.shuttle_target = 1_000.;
        ctl.set_mode(ServoMode::Fwd);

        let (s, t) = state.tick(&mut ctl, &inputs(400., 400., 1, 240.), &p, TapeWidth::Two, false);

        // Takeup leads: gains CV on top of tension. Supply trails: loses
        // CV, gains only the small hold-back term.
        assert!(t > 385, "takeup {} should exceed its tension", t);
        assert!(s < 360, "supply {} should drop below its tension", s);
        assert!(state.holdback > 0.);
        assert_eq!(state.db_target, 1_000.);
    }

    #[test]
    fn rew_mirrors_fwd() {
        let mut state = ServoState::default();
        let mut ctl = ModeCtl::default();
        let p = params();

        ctl.shuttle_target = 1_000.;
        ctl.set_mode(ServoMode::Rew);

        let (s, t) = state.tick(&mut ctl, &inputs(400., 400., -1, 240.), &p, TapeWidth::Two, false);

        assert!(s > 360, "supply {} should lead in rewind", s);
        assert!(t < 385, "takeup {} should trail in rewind", t);
    }

    #[test]
    fn null_offset_builds_over_averaging_window() {
        let mut state = ServoState::default();
        let mut ctl = ModeCtl::default();
        let p = params();

        ctl.set_mode(ServoMode::Stop);

        // Takeup 10% faster than supply: delta = 550 - 500 = 50 per
        // sample; after the 500-sample window, null = 50 * gain.
        for _ in 0..500 {
            state.tick(&mut ctl, &inputs(100., 110., 1, 240.), &p, TapeWidth::Two, false);
        }

        assert!((state.offset_null - 50. * p.reel_offset_gain).abs() < 0.01);
        // The faster (takeup) reel gets the added torque.
        assert!(state.offset_takeup > 0.);
        assert!(state.offset_supply < 0.);
        assert_eq!(state.offset_takeup, -state.offset_supply);
    }

    #[test]
    fn offset_gain_zero_forces_zero_offsets() {
        let mut state = ServoState::default();
        let mut ctl = ModeCtl::default();
        let mut p = params();
        p.reel_offset_gain = 0.;

        ctl.set_mode(ServoMode::Stop);
        for _ in 0..600 {
            state.tick(&mut ctl, &inputs(100., 150., 1, 240.), &p, TapeWidth::Two, false);
        }

        assert_eq!(state.offset_takeup, 0.);
        assert_eq!(state.offset_supply, 0.);
    }

    #[test]
    fn reeling_math_skipped_below_velocity_floor() {
        let mut state = ServoState::default();
        let mut ctl = ModeCtl::default();
        let p = params();

        ctl.set_mode(ServoMode::Stop);
        for _ in 0..600 {
            state.tick(&mut ctl, &inputs(10., 15., 1, 240.), &p, TapeWidth::Two, false);
        }

        assert_eq!(state.radius_supply, 0.);
        assert_eq!(state.offset_sample_cnt, 0);
        assert_eq!(state.offset_null, 0.);
    }

    #[test]
    fn autoslow_lowers_shuttle_target_near_reel_end() {
        let mut state = ServoState::default();
        let mut ctl = ModeCtl::default();
        let p = params();

        ctl.shuttle_target = 900.;
        ctl.set_mode(ServoMode::Fwd);

        // Supply much faster than takeup: shuttling toward the tail with a
        // large velocity ratio, so the null offset builds past the
        // auto-slow trigger (65) within one averaging window.
        for _ in 0..501 {
            state.tick(&mut ctl, &inputs(600., 300., 1, 240.), &p, TapeWidth::Two, false);
        }

        assert_eq!(state.shuttle_target, p.shuttle_autoslow_velocity as f32);
    }

    #[test]
    fn autoslow_inhibit_flag_respected() {
        let mut state = ServoState::default();
        let mut ctl = ModeCtl::default();
        let p = params();

        ctl.shuttle_target = 900.;
        ctl.autoslow_inhibit = true;
        ctl.set_mode(ServoMode::Fwd);

        for _ in 0..501 {
            state.tick(&mut ctl, &inputs(600., 300., 1, 240.), &p, TapeWidth::Two, false);
        }

        assert_eq!(state.shuttle_target, 900.);
    }

    #[test]
    fn direction_requires_reel_agreement() {
        let mut state = ServoState::default();
        let mut ctl = ModeCtl::default();
        let p = params();

        let mut inp = inputs(100., 100., 1, 240.);
        inp.dir_takeup = -1;

        state.tick(&mut ctl, &inp, &p, TapeWidth::Two, false);
        assert!(state.direction == TapeDir::None);
        assert!(state.motion);

        let inp = inputs(100., 100., -1, 240.);
        state.tick(&mut ctl, &inp, &p, TapeWidth::Two, false);
        assert!(state.direction == TapeDir::Rew);
    }
}
