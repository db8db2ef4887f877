//! Shared state for the reel servo loop and transport sequencer. The servo
//! task is the sole mutator of `ServoState`'s numeric fields; everything the
//! controller task and the servo loop exchange goes through the small
//! `ModeCtl` cell, which both sides hold only briefly under its lock.

use num_enum::TryFromPrimitive;

use crate::pid::Pid;

/// The five reel servo loop modes. Each has its own loop math; dispatch
/// happens once per servo tick.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, TryFromPrimitive, defmt::Format)]
#[repr(u8)]
pub enum ServoMode {
    #[default]
    Halt = 0,
    Stop = 1,
    Play = 2,
    Fwd = 3,
    Rew = 4,
}

impl ServoMode {
    /// Shuttle and play modes move tape; HALT and STOP do not.
    pub fn is_moving_mode(self) -> bool {
        matches!(self, Self::Play | Self::Fwd | Self::Rew)
    }
}

/// Direction of tape motion, valid only when both reels agree and the
/// combined velocity is above the detect threshold.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, defmt::Format)]
pub enum TapeDir {
    #[default]
    None,
    Fwd,
    Rew,
}

/// Dynamic braking state for STOP mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, defmt::Format)]
pub enum StopBrake {
    #[default]
    Off,
    Soft,
    Hard,
}

/// The controller-to-servo message cell. The controller commits mode
/// changes and shuttle targets here; the servo picks them up at the top of
/// its next tick and publishes motion status back for the pending-stop
/// supervision.
#[derive(Default)]
pub struct ModeCtl {
    mode: ServoMode,
    mode_prev: ServoMode,
    /// Brake state the servo should adopt when it observes a STOP entry.
    pub brake_entry: StopBrake,
    /// Shuttle velocity target for the next FWD/REW entry.
    pub shuttle_target: f32,
    /// Suppress end-of-reel auto-slow for this shuttle run.
    pub autoslow_inhibit: bool,

    // Published by the servo loop each tick.
    pub motion: bool,
    pub velocity: f32,
    pub direction: TapeDir,
}

impl ModeCtl {
    /// Commit a servo mode change. Takes effect on the next servo tick; the
    /// servo never observes a partial update since callers hold the lock.
    pub fn set_mode(&mut self, mode: ServoMode) {
        let prev = self.mode;
        self.mode_prev = prev;
        self.mode = mode;

        if mode == ServoMode::Stop {
            self.brake_entry = if prev.is_moving_mode() {
                StopBrake::Hard
            } else {
                StopBrake::Soft
            };
        }
    }

    pub fn mode(&self) -> ServoMode {
        self.mode
    }

    pub fn mode_prev(&self) -> ServoMode {
        self.mode_prev
    }

    pub fn is_mode(&self, mode: ServoMode) -> bool {
        self.mode == mode
    }

    pub fn is_motion(&self) -> bool {
        self.motion
    }
}

/// Reel torque motor servo data. Owned by the servo task; observers pull
/// copies via `snapshot`.
pub struct ServoState {
    pub mode: ServoMode,
    pub mode_prev: ServoMode,

    pub motion: bool,
    pub direction: TapeDir,

    /// Sum of both reel velocities, pulses per velocity window.
    pub velocity: f32,
    pub velocity_supply: f32,
    pub velocity_takeup: f32,

    /// Tape roller tachometer, Hz.
    pub tape_tach: f32,

    /// Scaled tension sensor arm reading.
    pub tsense: f32,
    pub cpu_temp: f32,
    pub adc: [u16; 5],

    /// Reeling radius estimates (tape speed over reel speed).
    pub radius_supply: f32,
    pub radius_takeup: f32,

    /// Averaged takeup/supply velocity-ratio null and its accumulator.
    pub offset_null: f32,
    pub offset_null_sum: f32,
    pub offset_sample_cnt: u32,
    pub offset_supply: f32,
    pub offset_takeup: f32,

    pub stop_brake: StopBrake,
    pub stop_torque_supply: f32,
    pub stop_torque_takeup: f32,

    /// Remaining play acceleration boost ticks; zero outside boost.
    pub play_boost_count: u32,
    /// Tape tach target that terminates the boost.
    pub play_boost_end: f32,
    pub play_supply_tension: f32,
    pub play_takeup_tension: f32,
    /// Mirrors the boost window for the STAT3 diagnostic LED.
    pub boost_active: bool,

    /// Shuttle velocity target; auto-slow lowers it mid-run.
    pub shuttle_target: f32,
    pub autoslow_inhibit: bool,

    pub pid_shuttle: Pid,
    pub pid_play: Pid,

    /// Current DAC levels, post-clamp.
    pub dac_supply: u16,
    pub dac_takeup: u16,
    /// HALT mode output levels; zero except under diagnostic control.
    pub dac_halt_supply: u16,
    pub dac_halt_takeup: u16,

    pub qei_supply_error_cnt: u32,
    pub qei_takeup_error_cnt: u32,

    /// Shuttle free-wheel compensation torque, for the monitor.
    pub holdback: f32,

    // Monitor mirror values from the most recent PID pass.
    pub db_cv: f32,
    pub db_error: f32,
    pub db_target: f32,
}

impl Default for ServoState {
    fn default() -> Self {
        Self {
            mode: ServoMode::Halt,
            mode_prev: ServoMode::Halt,
            motion: false,
            direction: TapeDir::None,
            velocity: 0.,
            velocity_supply: 0.,
            velocity_takeup: 0.,
            tape_tach: 0.,
            tsense: 0.,
            cpu_temp: 0.,
            adc: [0; 5],
            radius_supply: 0.,
            radius_takeup: 0.,
            offset_null: 0.,
            offset_null_sum: 0.,
            offset_sample_cnt: 0,
            offset_supply: 0.,
            offset_takeup: 0.,
            stop_brake: StopBrake::Off,
            stop_torque_supply: 0.,
            stop_torque_takeup: 0.,
            play_boost_count: 0,
            play_boost_end: 0.,
            play_supply_tension: 0.,
            play_takeup_tension: 0.,
            boost_active: false,
            shuttle_target: 0.,
            autoslow_inhibit: false,
            pid_shuttle: Pid::default(),
            pid_play: Pid::default(),
            dac_supply: 0,
            dac_takeup: 0,
            dac_halt_supply: 0,
            dac_halt_takeup: 0,
            qei_supply_error_cnt: 0,
            qei_takeup_error_cnt: 0,
            holdback: 0.,
            db_cv: 0.,
            db_error: 0.,
            db_target: 0.,
        }
    }
}

/// Immutable copy of the monitor-relevant servo fields. Display code works
/// from one of these, never from a live reference into the servo's state.
#[derive(Clone, Copy, Default, defmt::Format)]
pub struct ServoSnapshot {
    pub mode: ServoMode,
    pub motion: bool,
    pub direction: TapeDir,
    pub velocity: f32,
    pub velocity_supply: f32,
    pub velocity_takeup: f32,
    pub tape_tach: f32,
    pub tsense: f32,
    pub cpu_temp: f32,
    pub radius_supply: f32,
    pub radius_takeup: f32,
    pub offset_null: f32,
    pub dac_supply: u16,
    pub dac_takeup: u16,
    pub play_boost_count: u32,
    pub holdback: f32,
    pub qei_supply_error_cnt: u32,
    pub qei_takeup_error_cnt: u32,
    pub db_cv: f32,
    pub db_error: f32,
    pub db_target: f32,
}

impl ServoState {
    pub fn snapshot(&self) -> ServoSnapshot {
        ServoSnapshot {
            mode: self.mode,
            motion: self.motion,
            direction: self.direction,
            velocity: self.velocity,
            velocity_supply: self.velocity_supply,
            velocity_takeup: self.velocity_takeup,
            tape_tach: self.tape_tach,
            tsense: self.tsense,
            cpu_temp: self.cpu_temp,
            radius_supply: self.radius_supply,
            radius_takeup: self.radius_takeup,
            offset_null: self.offset_null,
            dac_supply: self.dac_supply,
            dac_takeup: self.dac_takeup,
            play_boost_count: self.play_boost_count,
            holdback: self.holdback,
            qei_supply_error_cnt: self.qei_supply_error_cnt,
            qei_takeup_error_cnt: self.qei_takeup_error_cnt,
            db_cv: self.db_cv,
            db_error: self.db_error,
            db_target: self.db_target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_entry_from_moving_mode_requests_hard_brake() {
        let mut ctl = ModeCtl::default();

        ctl.set_mode(ServoMode::Stop);
        assert!(ctl.brake_entry == StopBrake::Soft);

        ctl.set_mode(ServoMode::Fwd);
        ctl.set_mode(ServoMode::Stop);
        assert!(ctl.brake_entry == StopBrake::Hard);
        assert!(ctl.mode_prev() == ServoMode::Fwd);

        ctl.set_mode(ServoMode::Play);
        ctl.set_mode(ServoMode::Stop);
        assert!(ctl.brake_entry == StopBrake::Hard);
    }

    #[test]
    fn mode_reads_are_stable_between_writes() {
        let mut ctl = ModeCtl::default();
        ctl.set_mode(ServoMode::Rew);

        assert!(ctl.mode() == ServoMode::Rew);
        assert!(ctl.mode() == ServoMode::Rew);
        assert!(ctl.is_mode(ServoMode::Rew));
    }
}
