//! This module maps operator inputs to program functions: debouncing for
//! the transport buttons, tape-out switch and config DIP switches, and the
//! button-chord to transport-command translation. It is an interface layer
//! between the raw I/O expander port bytes and the controller mailbox.

use crate::{
    iomap::*,
    state::ServoMode,
    transport_ctrls::sequencer::{ModeFlags, RecordOp, TransportCmd},
};

/// Two-sample debounce filter for one input byte, polled at 10 ms. A value
/// must be observed on two consecutive polls before it is accepted, so a
/// single-sample glitch never produces an event.
pub struct Debounce {
    accepted: u8,
    candidate: u8,
    count: u8,
}

impl Debounce {
    /// `initial` seeds the accepted value; seeding with an impossible value
    /// (0xFF) makes the first stable reading post as an event, which is how
    /// the boot-time tape-in state reaches the controller.
    pub fn new(initial: u8) -> Self {
        Self {
            accepted: initial,
            candidate: initial,
            count: 0,
        }
    }

    pub fn filter(&mut self, raw: u8) -> Option<u8> {
        if raw == self.accepted {
            self.count = 0;
            return None;
        }

        if raw == self.candidate {
            self.count += 1;
        } else {
            self.candidate = raw;
            self.count = 1;
        }

        if self.count >= 2 {
            self.accepted = raw;
            self.count = 0;
            Some(raw)
        } else {
            None
        }
    }

    pub fn accepted(&self) -> u8 {
        self.accepted
    }
}

/// Debounced events from one 10 ms input poll.
#[derive(Default)]
pub struct PollEvents {
    /// Transport button state change (button bits only).
    pub buttons: Option<u8>,
    /// Tape switch transition: `S_TAPEOUT` or `S_TAPEIN`.
    pub tape: Option<u8>,
    /// Speed select or DIP switch change: (hi_speed, dip bits).
    pub mode_switches: Option<(bool, u8)>,
}

/// Debounce state for the three input groups polled from the expanders.
pub struct InputPoll {
    buttons: Debounce,
    tape_out: Debounce,
    mode: Debounce,
}

impl Default for InputPoll {
    fn default() -> Self {
        Self {
            buttons: Debounce::new(0xFF),
            tape_out: Debounce::new(0xFF),
            mode: Debounce::new(0xFF),
        }
    }
}

impl InputPoll {
    pub fn poll(&mut self, transport_raw: u8, mode_raw: u8) -> PollEvents {
        let mut events = PollEvents::default();

        if let Some(bits) = self.tape_out.filter(transport_raw & S_TAPEOUT) {
            events.tape = Some(if bits & S_TAPEOUT != 0 {
                S_TAPEOUT
            } else {
                S_TAPEIN
            });
        }

        events.buttons = self.buttons.filter(transport_raw & S_BUTTON_MASK);

        if let Some(bits) = self.mode.filter(mode_raw) {
            events.mode_switches = Some((bits & M_HISPEED != 0, bits & M_DIPSW_MASK));
        }

        events
    }
}

/// Translates debounced button chords into transport commands, given the
/// current servo mode and record-hold state.
pub struct CommandTranslator {
    /// Set until the first tape event is delivered, so the power-on state
    /// always produces an initial HALT or STOP.
    firststate: bool,
}

impl Default for CommandTranslator {
    fn default() -> Self {
        Self { firststate: true }
    }
}

impl CommandTranslator {
    fn mode_cmd(mode: ServoMode, flags: ModeFlags) -> Option<TransportCmd> {
        Some(TransportCmd::SetMode {
            mode,
            flags,
            velocity: None,
        })
    }

    /// `mbutton` carries debounced button bits plus a possible S_TAPEOUT /
    /// S_TAPEIN transition bit.
    pub fn translate(
        &mut self,
        mbutton: u8,
        servo_mode: ServoMode,
        record_held: bool,
    ) -> Option<TransportCmd> {
        // Tape out switch transitions first.
        if mbutton & S_TAPEOUT != 0 {
            if servo_mode != ServoMode::Halt || self.firststate {
                self.firststate = false;
                return Self::mode_cmd(ServoMode::Halt, ModeFlags::default());
            }
            return None;
        }

        if mbutton & S_TAPEIN != 0 {
            // Tape back in while halted: release to stop mode.
            if servo_mode == ServoMode::Halt || self.firststate {
                self.firststate = false;
                return Self::mode_cmd(ServoMode::Stop, ModeFlags::default());
            }
            return None;
        }

        if mbutton == S_LDEF {
            return Some(TransportCmd::ToggleLifter);
        }

        // Ignore transport control buttons in halt mode (no tape).
        if servo_mode == ServoMode::Halt {
            return None;
        }

        let mbutton = mbutton & !(S_TAPEOUT | S_TAPEIN);
        if mbutton == 0 {
            return None;
        }

        let libwind = ModeFlags {
            libwind: true,
            ..Default::default()
        };

        match mbutton {
            _ if mbutton == S_STOP => Self::mode_cmd(ServoMode::Stop, ModeFlags::default()),
            _ if mbutton == S_FWD => Self::mode_cmd(ServoMode::Fwd, ModeFlags::default()),
            _ if mbutton == (S_FWD | S_REC) => Self::mode_cmd(ServoMode::Fwd, libwind),
            _ if mbutton == S_REW => Self::mode_cmd(ServoMode::Rew, ModeFlags::default()),
            _ if mbutton == (S_REW | S_REC) => Self::mode_cmd(ServoMode::Rew, libwind),
            _ if mbutton == S_PLAY => Self::mode_cmd(ServoMode::Play, ModeFlags::default()),

            _ if mbutton == (S_STOP | S_REC) => {
                // Stop + record is a punch out, only meaningful in play.
                if servo_mode == ServoMode::Play {
                    Some(TransportCmd::StrobeRecord(RecordOp::Out))
                } else {
                    None
                }
            }

            _ if mbutton & (S_PLAY | S_REC) == (S_PLAY | S_REC) => {
                if servo_mode == ServoMode::Play {
                    // Punch out if recording, punch in otherwise.
                    if record_held {
                        Some(TransportCmd::StrobeRecord(RecordOp::Out))
                    } else {
                        Some(TransportCmd::StrobeRecord(RecordOp::In))
                    }
                } else if servo_mode == ServoMode::Stop {
                    // Start up play in record mode.
                    Self::mode_cmd(
                        ServoMode::Play,
                        ModeFlags {
                            record: true,
                            ..Default::default()
                        },
                    )
                } else {
                    None
                }
            }

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sample_glitch_is_absorbed() {
        let mut db = Debounce::new(0);

        assert_eq!(db.filter(S_PLAY), None);
        // Glitch gone on the next poll: no event, candidate resets.
        assert_eq!(db.filter(0), None);
        assert_eq!(db.filter(0), None);
        assert_eq!(db.accepted(), 0);
    }

    #[test]
    fn stable_change_posts_exactly_once() {
        let mut db = Debounce::new(0);

        assert_eq!(db.filter(S_STOP), None);
        assert_eq!(db.filter(S_STOP), Some(S_STOP));
        // Held button: no repeat events.
        assert_eq!(db.filter(S_STOP), None);
        assert_eq!(db.filter(S_STOP), None);

        // Release debounces the same way.
        assert_eq!(db.filter(0), None);
        assert_eq!(db.filter(0), Some(0));
    }

    #[test]
    fn boot_state_posts_first_stable_reading() {
        let mut poll = InputPoll::default();

        // Tape present at power-up: tape-out bit low.
        let ev = poll.poll(0, 0);
        assert_eq!(ev.tape, None);
        let ev = poll.poll(0, 0);
        assert_eq!(ev.tape, Some(S_TAPEIN));
    }

    #[test]
    fn tape_out_translates_to_halt() {
        let mut tr = CommandTranslator::default();

        let cmd = tr.translate(S_TAPEOUT, ServoMode::Play, false);
        assert!(matches!(
            cmd,
            Some(TransportCmd::SetMode {
                mode: ServoMode::Halt,
                ..
            })
        ));

        // Already halted: no repeat.
        assert!(tr.translate(S_TAPEOUT, ServoMode::Halt, false).is_none());
    }

    #[test]
    fn tape_in_releases_halt_to_stop() {
        let mut tr = CommandTranslator::default();

        let cmd = tr.translate(S_TAPEIN, ServoMode::Halt, false);
        assert!(matches!(
            cmd,
            Some(TransportCmd::SetMode {
                mode: ServoMode::Stop,
                ..
            })
        ));

        assert!(tr.translate(S_TAPEIN, ServoMode::Stop, false).is_none());
    }

    #[test]
    fn buttons_ignored_while_halted() {
        let mut tr = CommandTranslator::default();
        tr.firststate = false;

        assert!(tr.translate(S_PLAY, ServoMode::Halt, false).is_none());
        assert!(tr.translate(S_STOP, ServoMode::Halt, false).is_none());
    }

    #[test]
    fn chords_map_to_modes() {
        let mut tr = CommandTranslator::default();

        let fwd = tr.translate(S_FWD, ServoMode::Stop, false);
        assert!(matches!(
            fwd,
            Some(TransportCmd::SetMode {
                mode: ServoMode::Fwd,
                flags: ModeFlags { libwind: false, .. },
                ..
            })
        ));

        let fwd_lib = tr.translate(S_FWD | S_REC, ServoMode::Stop, false);
        assert!(matches!(
            fwd_lib,
            Some(TransportCmd::SetMode {
                mode: ServoMode::Fwd,
                flags: ModeFlags { libwind: true, .. },
                ..
            })
        ));

        let rew_lib = tr.translate(S_REW | S_REC, ServoMode::Stop, false);
        assert!(matches!(
            rew_lib,
            Some(TransportCmd::SetMode {
                mode: ServoMode::Rew,
                flags: ModeFlags { libwind: true, .. },
                ..
            })
        ));

        let ldef = tr.translate(S_LDEF, ServoMode::Stop, false);
        assert!(matches!(ldef, Some(TransportCmd::ToggleLifter)));
    }

    #[test]
    fn play_plus_record_behavior_depends_on_mode() {
        let mut tr = CommandTranslator::default();

        // In stop: arm record and start play.
        let cmd = tr.translate(S_PLAY | S_REC, ServoMode::Stop, false);
        assert!(matches!(
            cmd,
            Some(TransportCmd::SetMode {
                mode: ServoMode::Play,
                flags: ModeFlags { record: true, .. },
                ..
            })
        ));

        // In play without record: punch in.
        let cmd = tr.translate(S_PLAY | S_REC, ServoMode::Play, false);
        assert!(matches!(cmd, Some(TransportCmd::StrobeRecord(RecordOp::In))));

        // In play while recording: punch out.
        let cmd = tr.translate(S_PLAY | S_REC, ServoMode::Play, true);
        assert!(matches!(
            cmd,
            Some(TransportCmd::StrobeRecord(RecordOp::Out))
        ));

        // Stop + record in play: punch out, stays rolling.
        let cmd = tr.translate(S_STOP | S_REC, ServoMode::Play, true);
        assert!(matches!(
            cmd,
            Some(TransportCmd::StrobeRecord(RecordOp::Out))
        ));
    }

    #[test]
    fn mode_switch_events_decode_speed_and_dip() {
        let mut poll = InputPoll::default();

        poll.poll(0, M_HISPEED | M_DIPSW2);
        let ev = poll.poll(0, M_HISPEED | M_DIPSW2);

        assert_eq!(ev.mode_switches, Some((true, M_DIPSW2)));
    }
}
