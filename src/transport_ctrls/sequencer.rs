//! The transport controller: owns every servo mode transition, the solenoid
//! and lamp sequencing around it, record latching and the pending-stop
//! supervision. Runs as a 5 ms tick task one priority step below the servo
//! loop; all settle delays are counted in ticks so no step ever blocks.
//!
//! Commands arrive through a small mailbox from the button poll task and
//! the IPC server. A command that needs the transport to coast down first
//! (STOP, PLAY) parks in a pending state that is re-polled on a 25 ms
//! cadence until motion ceases or the 60 second deadline forces the stop.

use crate::{
    iomap::*,
    params::SystemParams,
    state::{ModeCtl, ServoMode},
    util::ms_to_ticks,
};

/// Controller task tick period.
pub const CTRL_TICK_MS: u32 = 5;

/// Pending-state supervision cadence: every 5th tick, ie 25 ms.
const STOP_POLL_TICKS: u32 = 5;

/// 60 second motion stop detect timeout, counted in 25 ms polls.
pub const STOP_TIMEOUT_POLLS: u32 = 2_400;

/// Blink the pending-stop lamp every 12 polls (300 ms).
const BLINK_POLLS: u32 = 12;

/// Let the servo stop loop bleed off capstan speed before the hard brakes
/// land on a PLAY -> STOP transition.
const PLAY_STOP_PRE_BRAKE_MS: u32 = 225;

/// Record strobe opcode.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum RecordOp {
    /// Punch out.
    Out,
    /// Punch in.
    In,
    Toggle,
}

/// Option flags riding on a mode-change command.
#[derive(Clone, Copy, Default, defmt::Format)]
pub struct ModeFlags {
    /// Start record once PLAY engages.
    pub record: bool,
    /// Reduced-speed library wind shuttle.
    pub libwind: bool,
    /// Suppress end-of-reel auto-slow for this run.
    pub noslow: bool,
}

/// A command envelope posted to the controller mailbox. Never retained
/// beyond the one slot it occupies.
#[derive(Clone, Copy, defmt::Format)]
pub enum TransportCmd {
    SetMode {
        mode: ServoMode,
        flags: ModeFlags,
        /// Shuttle velocity override (IPC); `None` uses the configured one.
        velocity: Option<u16>,
    },
    StrobeRecord(RecordOp),
    ToggleLifter,
}

/// Fixed-depth command mailbox between the command/IPC tasks and the
/// controller. Posts from a full box are dropped and counted.
pub struct CmdMailbox {
    slots: [Option<TransportCmd>; 8],
    head: usize,
    len: usize,
    pub dropped: u32,
}

impl Default for CmdMailbox {
    fn default() -> Self {
        Self {
            slots: [None; 8],
            head: 0,
            len: 0,
            dropped: 0,
        }
    }
}

impl CmdMailbox {
    pub fn post(&mut self, cmd: TransportCmd) -> bool {
        if self.len == self.slots.len() {
            self.dropped += 1;
            return false;
        }

        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = Some(cmd);
        self.len += 1;
        true
    }

    pub fn pend(&mut self) -> Option<TransportCmd> {
        if self.len == 0 {
            return None;
        }

        let cmd = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        cmd
    }
}

/// The controller's view of the lamp and solenoid ports. The firmware
/// implementation forwards to the I/O expanders under the SPI bus lock.
pub trait TransportIo {
    /// Clear `clear` then set `set` on the solenoid/record port, as one
    /// read-modify-write so concurrent partial updates never lose bits.
    fn set_transport_mask(&mut self, set: u8, clear: u8);
    fn transport_mask(&self) -> u8;

    fn set_lamp_mask(&mut self, set: u8, clear: u8);
    fn toggle_lamps(&mut self, mask: u8);
    fn lamp_mask(&self) -> u8;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    Stop,
    Play,
}

/// Tick-counted delay steps. Each variant names the action taken when its
/// count expires.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Lifter settling before a from-rest shuttle engages.
    ShuttleLifterSettle { ticks: u32, mode: ServoMode },
    /// PLAY -> STOP: servo braking interval before the brake solenoid.
    StopPreBrake { ticks: u32 },
    StopBrakeSettle { ticks: u32 },
    StopLifterRelease { ticks: u32 },
    /// Settling interval before PLAY engages after a shuttle mode.
    PlayShuttleSettle { ticks: u32 },
    PlayLifterRelease { ticks: u32 },
    PlayPinchSettle { ticks: u32 },
}

/// Record strobe sub-machine: hold line settles, then the latch pulse.
#[derive(Clone, Copy, PartialEq, Eq)]
enum RecPhase {
    Idle,
    HoldSettle { ticks: u32 },
    Pulse { ticks: u32 },
}

pub struct Sequencer {
    last_completed: Option<ServoMode>,
    last_requested: Option<ServoMode>,
    prev_requested: Option<ServoMode>,
    pending: Pending,
    phase: Phase,
    rec: RecPhase,
    /// Record armed for the pending PLAY entry.
    record_flag: bool,
    stop_polls: u32,
    tick_count: u32,
    /// Pending-stop deadline expiries since boot.
    pub stop_timeouts: u32,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self {
            last_completed: None,
            last_requested: None,
            prev_requested: None,
            pending: Pending::None,
            phase: Phase::Idle,
            rec: RecPhase::Idle,
            record_flag: false,
            stop_polls: 0,
            tick_count: 0,
            stop_timeouts: 0,
        }
    }
}

impl Sequencer {
    /// One 5 ms controller tick: advance any in-flight settle step, then
    /// take at most one mailbox command, then service pending states on
    /// the 25 ms cadence.
    pub fn tick(
        &mut self,
        ctl: &mut ModeCtl,
        io: &mut impl TransportIo,
        mbox: &mut CmdMailbox,
        params: &SystemParams,
        blink_enabled: bool,
    ) {
        self.tick_count = self.tick_count.wrapping_add(1);

        self.advance_record(io, params);
        self.advance_phase(ctl, io, params);

        if self.phase == Phase::Idle && self.rec == RecPhase::Idle {
            if let Some(cmd) = mbox.pend() {
                self.on_command(cmd, ctl, io, params);
            }
        }

        if self.phase == Phase::Idle
            && self.pending != Pending::None
            && self.tick_count % STOP_POLL_TICKS == 0
        {
            self.poll_pending(ctl, io, params, blink_enabled);
        }
    }

    fn on_command(
        &mut self,
        cmd: TransportCmd,
        ctl: &mut ModeCtl,
        io: &mut impl TransportIo,
        params: &SystemParams,
    ) {
        match cmd {
            TransportCmd::ToggleLifter => {
                // Lift defeat is honored at rest or in play only.
                let mode = ctl.mode();
                if matches!(mode, ServoMode::Halt | ServoMode::Stop | ServoMode::Play) {
                    if io.transport_mask() & T_TLIFT != 0 {
                        io.set_transport_mask(0, T_TLIFT);
                    } else {
                        io.set_transport_mask(T_TLIFT, 0);
                    }
                }
            }

            TransportCmd::StrobeRecord(op) => {
                if !ctl.is_mode(ServoMode::Play) {
                    return;
                }

                match op {
                    RecordOp::Out => self.record_disable(io),
                    RecordOp::In => self.record_enable(io, params),
                    RecordOp::Toggle => {
                        if io.transport_mask() & T_RECH != 0 {
                            self.record_disable(io);
                        } else {
                            self.record_enable(io, params);
                        }
                    }
                }
            }

            TransportCmd::SetMode {
                mode,
                flags,
                velocity,
            } => self.on_mode_command(mode, flags, velocity, ctl, io, params),
        }
    }

    fn on_mode_command(
        &mut self,
        mode: ServoMode,
        flags: ModeFlags,
        velocity: Option<u16>,
        ctl: &mut ModeCtl,
        io: &mut impl TransportIo,
        params: &SystemParams,
    ) {
        // Skip if the same mode was already completed and nothing pends.
        if self.last_completed == Some(mode) && self.pending == Pending::None {
            return;
        }

        self.prev_requested = self.last_requested;
        self.last_requested = Some(mode);

        self.record_flag = false;
        self.stop_polls = 0;

        // STAT2 indicates tape out; STAT3 a pending-stop timeout.
        if mode == ServoMode::Halt {
            io.set_lamp_mask(L_STAT2, 0);
        } else {
            io.set_lamp_mask(0, L_STAT2 | L_STAT3);
        }

        match mode {
            ServoMode::Halt => {
                self.record_disable(io);

                // All lamps off, diag leds preserved.
                io.set_lamp_mask(0, L_LAMP_MASK);

                // Tape out: engage brakes; capstan, lifter, pinch roller
                // and record all drop.
                io.set_transport_mask(T_BRAKE, 0xFF);

                ctl.set_mode(ServoMode::Halt);

                self.last_completed = Some(ServoMode::Halt);
                self.pending = Pending::None;
                self.phase = Phase::Idle;
            }

            ServoMode::Stop => {
                self.record_disable(io);

                // Lamps show the mode being stopped from, plus the stop
                // lamp which blinks while the stop pends.
                let mut lamp = match self.last_completed {
                    Some(ServoMode::Fwd) => L_FWD,
                    Some(ServoMode::Rew) => L_REW,
                    _ => 0,
                };
                lamp |= L_STOP;
                io.set_lamp_mask(lamp, L_LAMP_MASK);

                io.set_transport_mask(0, T_PROL | T_SERVO | T_RECH);

                ctl.set_mode(ServoMode::Stop);

                self.pending = Pending::Stop;
            }

            ServoMode::Play => {
                if ctl.is_mode(ServoMode::Play) {
                    return;
                }

                // Don't engage play while another mode is pending.
                if self.pending != Pending::None {
                    return;
                }

                self.record_flag = flags.record;

                // Null any residual motion first; the pending state
                // finishes the engage once the reels are still.
                ctl.set_mode(ServoMode::Stop);

                self.pending = Pending::Play;
            }

            ServoMode::Fwd | ServoMode::Rew => {
                self.record_disable(io);

                if ctl.is_mode(mode) {
                    return;
                }

                let lamp = if mode == ServoMode::Fwd { L_FWD } else { L_REW };
                io.set_lamp_mask(lamp, L_LAMP_MASK);

                // Shuttle: lifter up; capstan, pinch roller, record and
                // brakes all released.
                io.set_transport_mask(T_TLIFT, T_SERVO | T_PROL | T_RECH | T_BRAKE);

                let target = match velocity {
                    Some(v) if v > 0 => v as u32,
                    _ if flags.libwind => params.shuttle_lib_velocity,
                    _ => params.shuttle_velocity,
                };
                ctl.shuttle_target = target as f32;
                ctl.autoslow_inhibit = flags.noslow;

                self.pending = Pending::None;

                if ctl.is_motion() {
                    // Already rolling: the servo's reversal braking covers
                    // the momentum, no lifter wait needed.
                    self.commit_shuttle(mode, ctl);
                } else {
                    self.phase = Phase::ShuttleLifterSettle {
                        ticks: ms_to_ticks(params.lifter_settle_time, CTRL_TICK_MS),
                        mode,
                    };
                }
            }
        }
    }

    fn commit_shuttle(&mut self, mode: ServoMode, ctl: &mut ModeCtl) {
        ctl.set_mode(mode);
        self.last_completed = Some(mode);
        self.pending = Pending::None;
        self.phase = Phase::Idle;
    }

    fn advance_phase(
        &mut self,
        ctl: &mut ModeCtl,
        io: &mut impl TransportIo,
        params: &SystemParams,
    ) {
        match self.phase {
            Phase::Idle => {}

            Phase::ShuttleLifterSettle { ticks, mode } => {
                if ticks > 1 {
                    self.phase = Phase::ShuttleLifterSettle {
                        ticks: ticks - 1,
                        mode,
                    };
                } else {
                    self.commit_shuttle(mode, ctl);
                }
            }

            Phase::StopPreBrake { ticks } => {
                if ticks > 1 {
                    self.phase = Phase::StopPreBrake { ticks: ticks - 1 };
                } else {
                    // Now apply the hard brakes.
                    io.set_transport_mask(T_BRAKE, T_SERVO | T_PROL | T_RECH);
                    self.phase = Phase::StopBrakeSettle {
                        ticks: ms_to_ticks(params.brake_settle_time, CTRL_TICK_MS).max(1),
                    };
                }
            }

            Phase::StopBrakeSettle { ticks } => {
                if ticks > 1 {
                    self.phase = Phase::StopBrakeSettle { ticks: ticks - 1 };
                } else {
                    self.stop_finish_lifter(ctl, io, params);
                }
            }

            Phase::StopLifterRelease { ticks } => {
                if ticks > 1 {
                    self.phase = Phase::StopLifterRelease { ticks: ticks - 1 };
                } else {
                    self.stop_finish_brakes(ctl, io, params);
                }
            }

            Phase::PlayShuttleSettle { ticks } => {
                if ticks > 1 {
                    self.phase = Phase::PlayShuttleSettle { ticks: ticks - 1 };
                } else {
                    self.play_release(ctl, io, params);
                }
            }

            Phase::PlayLifterRelease { ticks } => {
                if ticks > 1 {
                    self.phase = Phase::PlayLifterRelease { ticks: ticks - 1 };
                } else {
                    self.play_pinch(ctl, io, params);
                }
            }

            Phase::PlayPinchSettle { ticks } => {
                if ticks > 1 {
                    self.phase = Phase::PlayPinchSettle { ticks: ticks - 1 };
                } else {
                    self.play_go(ctl, io, params);
                }
            }
        }
    }

    /// Pending STOP/PLAY supervision, on the 25 ms poll cadence.
    fn poll_pending(
        &mut self,
        ctl: &mut ModeCtl,
        io: &mut impl TransportIo,
        params: &SystemParams,
        blink_enabled: bool,
    ) {
        self.stop_polls += 1;

        if self.stop_polls >= STOP_TIMEOUT_POLLS {
            // The motion never stopped within the timeout period (reels
            // still spinning, out of tape maybe?). Treat it as an error
            // and revert to stop.
            io.set_lamp_mask(L_STOP | L_STAT3, L_LAMP_MASK);

            ctl.set_mode(ServoMode::Stop);

            self.pending = Pending::None;
            self.record_flag = false;
            self.stop_polls = 0;
            self.last_completed = Some(ServoMode::Stop);
            self.stop_timeouts += 1;
            return;
        }

        // Blink to show the stop is still pending, unless DIP 2 disables it.
        if blink_enabled && self.stop_polls % BLINK_POLLS == 0 {
            let lamp = match self.last_completed {
                Some(ServoMode::Rew) => L_REW,
                Some(ServoMode::Fwd) => L_FWD,
                _ => L_STOP,
            };
            io.toggle_lamps(lamp);
        }

        if ctl.is_motion() {
            return;
        }

        // All motion has stopped; finish the state portion of the command
        // that required the pending wait.
        match self.pending {
            Pending::None => {}

            Pending::Stop => {
                io.set_transport_mask(0, T_SERVO | T_PROL | T_RECH);

                match self.prev_requested {
                    Some(ServoMode::Play) if params.sysflags.brakes_stop_play => {
                        self.phase = Phase::StopPreBrake {
                            ticks: ms_to_ticks(PLAY_STOP_PRE_BRAKE_MS, CTRL_TICK_MS),
                        };
                    }
                    Some(ServoMode::Fwd) | Some(ServoMode::Rew) | Some(ServoMode::Play) => {
                        io.set_transport_mask(0, T_BRAKE | T_SERVO | T_PROL | T_RECH);
                        self.phase = Phase::StopBrakeSettle {
                            ticks: ms_to_ticks(params.brake_settle_time, CTRL_TICK_MS).max(1),
                        };
                    }
                    _ => self.stop_finish_lifter(ctl, io, params),
                }
            }

            Pending::Play => {
                io.set_lamp_mask(L_PLAY, L_LAMP_MASK);

                if matches!(
                    self.prev_requested,
                    Some(ServoMode::Fwd) | Some(ServoMode::Rew)
                ) {
                    self.phase = Phase::PlayShuttleSettle {
                        ticks: ms_to_ticks(params.play_settle_time, CTRL_TICK_MS).max(1),
                    };
                } else {
                    self.play_release(ctl, io, params);
                }
            }
        }
    }

    /// STOP completion, lifter step: retain or release per configuration.
    fn stop_finish_lifter(
        &mut self,
        ctl: &mut ModeCtl,
        io: &mut impl TransportIo,
        params: &SystemParams,
    ) {
        io.set_lamp_mask(L_STOP, L_LAMP_MASK);

        let mask = io.transport_mask();

        if params.sysflags.lifter_at_stop {
            io.set_transport_mask(T_TLIFT, T_SERVO | T_PROL | T_RECH);
            self.stop_finish_brakes(ctl, io, params);
        } else {
            io.set_transport_mask(0, T_SERVO | T_TLIFT | T_PROL | T_RECH);

            if mask & T_TLIFT != 0 {
                self.phase = Phase::StopLifterRelease {
                    ticks: ms_to_ticks(params.lifter_settle_time, CTRL_TICK_MS).max(1),
                };
            } else {
                self.stop_finish_brakes(ctl, io, params);
            }
        }
    }

    /// STOP completion, final step: brake retention and the mode commit.
    fn stop_finish_brakes(
        &mut self,
        _ctl: &mut ModeCtl,
        io: &mut impl TransportIo,
        params: &SystemParams,
    ) {
        if params.sysflags.brakes_at_stop {
            io.set_transport_mask(T_BRAKE, 0);
        } else {
            io.set_transport_mask(0, T_BRAKE);
        }

        self.last_completed = Some(ServoMode::Stop);
        self.pending = Pending::None;
        self.phase = Phase::Idle;
    }

    /// PLAY engage, step 1: drop the lifter and brakes.
    fn play_release(
        &mut self,
        ctl: &mut ModeCtl,
        io: &mut impl TransportIo,
        params: &SystemParams,
    ) {
        let mask = io.transport_mask();

        io.set_transport_mask(0, T_TLIFT | T_BRAKE);

        if mask & T_TLIFT != 0 && params.sysflags.lifter_at_stop {
            self.phase = Phase::PlayLifterRelease {
                ticks: ms_to_ticks(params.lifter_settle_time, CTRL_TICK_MS).max(1),
            };
        } else {
            self.play_pinch(ctl, io, params);
        }
    }

    /// PLAY engage, step 2: pinch roller, when configured.
    fn play_pinch(&mut self, ctl: &mut ModeCtl, io: &mut impl TransportIo, params: &SystemParams) {
        if params.sysflags.engage_pinch_roller {
            io.set_transport_mask(T_PROL, 0);
            self.phase = Phase::PlayPinchSettle {
                ticks: ms_to_ticks(params.pinch_settle_time, CTRL_TICK_MS).max(1),
            };
        } else {
            self.play_go(ctl, io, params);
        }
    }

    /// PLAY engage, final step: capstan on, servo mode committed, record
    /// strobed if it was armed.
    fn play_go(&mut self, ctl: &mut ModeCtl, io: &mut impl TransportIo, params: &SystemParams) {
        io.set_transport_mask(T_SERVO, 0);

        // The servo loop re-arms its play boost when it observes this
        // transition on its next tick.
        ctl.set_mode(ServoMode::Play);

        if self.record_flag {
            self.record_flag = false;
            self.record_enable(io, params);
        }

        self.last_completed = Some(ServoMode::Play);
        self.pending = Pending::None;
        self.phase = Phase::Idle;
    }

    /// Raise the record hold line and kick off the latch pulse sequence.
    /// Channels armed for record latch when the pulse fires and stay in
    /// record until the hold line drops.
    fn record_enable(&mut self, io: &mut impl TransportIo, params: &SystemParams) {
        if io.transport_mask() & T_RECH != 0 {
            return;
        }

        io.set_transport_mask(T_RECH, 0);

        self.rec = RecPhase::HoldSettle {
            ticks: ms_to_ticks(params.rechold_settle_time, CTRL_TICK_MS).max(1),
        };
    }

    /// Drop the record hold latch on any channels with record active.
    fn record_disable(&mut self, io: &mut impl TransportIo) {
        if io.transport_mask() & T_RECH != 0 {
            io.set_transport_mask(0, T_RECH);
            io.set_lamp_mask(0, L_REC);
        }

        self.rec = RecPhase::Idle;
    }

    fn advance_record(&mut self, io: &mut impl TransportIo, params: &SystemParams) {
        match self.rec {
            RecPhase::Idle => {}

            RecPhase::HoldSettle { ticks } => {
                if ticks > 1 {
                    self.rec = RecPhase::HoldSettle { ticks: ticks - 1 };
                } else {
                    io.set_transport_mask(T_RECP, 0);
                    self.rec = RecPhase::Pulse {
                        ticks: ms_to_ticks(params.record_pulse_time, CTRL_TICK_MS).max(1),
                    };
                }
            }

            RecPhase::Pulse { ticks } => {
                if ticks > 1 {
                    self.rec = RecPhase::Pulse { ticks: ticks - 1 };
                } else {
                    io.set_transport_mask(0, T_RECP);
                    io.set_lamp_mask(L_REC, 0);
                    self.rec = RecPhase::Idle;
                }
            }
        }
    }

    /// Committed mode as seen by an observer; `None` until the first
    /// command completes after boot.
    pub fn committed_mode(&self) -> Option<ServoMode> {
        self.last_completed
    }
}
