//! The system parameter record: every tunable the servo loop and transport
//! sequencer consume, loaded from the non-volatile store at boot and written
//! back on operator command. The in-memory form uses named fields and named
//! boolean flags; a fixed little-endian layout is used wherever the record
//! crosses the storage or IPC boundary.

use packed_struct::prelude::*;

pub const MAGIC: u32 = 0xCEB0_FACE;

pub const FIRMWARE_VER: u32 = 2;
pub const FIRMWARE_REV: u32 = 9;
pub const FIRMWARE_BUILD: u32 = 1_036;

/// Records written by builds older than this are discarded at load time.
pub const FIRMWARE_MIN_BUILD: u32 = 1_030;

/// Encoded size of [`SystemParams`] on the wire and in the EEPROM slots.
pub const PARAMS_WIRE_SIZE: usize = 180;

pub fn make_rev(ver: u32, rev: u32) -> u32 {
    (ver << 16) | (rev & 0xFFFF)
}

/// Tape width select, read from a strap pin at boot. Selects which EEPROM
/// slot is live and which default tension set applies.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum TapeWidth {
    One,
    Two,
}

/// Global behavior flags. In RAM these are plain named booleans; they pack
/// to a single byte (zero-extended to a u32 word) at the storage/IPC
/// boundary.
#[derive(PackedStruct, Clone, Copy, Default, PartialEq, defmt::Format)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct SysFlags {
    /// Leave the tape lifter engaged once stopped.
    #[packed_field(bits = "0")]
    pub lifter_at_stop: bool,
    /// Leave the brakes engaged once stopped.
    #[packed_field(bits = "1")]
    pub brakes_at_stop: bool,
    /// Use the brake solenoid to finish a PLAY -> STOP transition.
    #[packed_field(bits = "2")]
    pub brakes_stop_play: bool,
    /// Engage the pinch roller when entering PLAY.
    #[packed_field(bits = "3")]
    pub engage_pinch_roller: bool,
    /// Drop to STOP when the leader/tape-end sensor trips.
    #[packed_field(bits = "4")]
    pub stop_at_tape_end: bool,
}

impl SysFlags {
    pub fn to_word(self) -> u32 {
        // Infallible for a bool-only field set.
        self.pack().map(|b| b[0] as u32).unwrap_or(0)
    }

    pub fn from_word(word: u32) -> Self {
        Self::unpack(&[(word & 0xFF) as u8]).unwrap_or_default()
    }
}

/// Runtime and program configuration data. Field order here is the wire
/// order; `encode`/`decode` below must be kept in sync with it.
#[derive(Clone, PartialEq)]
pub struct SystemParams {
    pub magic: u32,
    pub version: u32,
    pub build: u32,

    // Global parameters
    pub debug: i32,
    /// Delay before engaging play mode, ms.
    pub pinch_settle_time: u32,
    /// Tape lifter settling time, ms.
    pub lifter_settle_time: u32,
    /// Brake settling time after STOP, ms.
    pub brake_settle_time: u32,
    /// Play-after-shuttle settling time, ms.
    pub play_settle_time: u32,
    /// Record hold settling time before the latch pulse, ms.
    pub rechold_settle_time: u32,
    /// Record latch pulse length, ms.
    pub record_pulse_time: u32,
    /// Combined reel velocity at or below this reads as "not moving".
    pub vel_detect_threshold: u32,
    /// Transport button debounce time, ms.
    pub debounce: u32,
    pub sysflags: SysFlags,

    // Software gain parameters
    pub reel_radius_gain: f32,
    pub reel_offset_gain: f32,
    pub tension_sensor_gain: f32,
    /// ADC mid-scale calibration for 1" tape.
    pub tension_sensor_midscale1: f32,
    /// ADC mid-scale calibration for 2" tape.
    pub tension_sensor_midscale2: f32,

    // Thread tape parameters
    pub thread_supply_tension: u32,
    pub thread_takeup_tension: u32,

    // Stop servo parameters
    pub stop_supply_tension: u32,
    pub stop_takeup_tension: u32,
    pub stop_brake_torque: u32,

    // Shuttle servo parameters
    pub shuttle_supply_tension: u32,
    pub shuttle_takeup_tension: u32,
    pub shuttle_velocity: u32,
    pub shuttle_lib_velocity: u32,
    pub shuttle_autoslow_velocity: u32,
    /// Null offset magnitude that arms the end-of-reel auto-slow.
    pub autoslow_at_offset: u32,
    /// Combined velocity floor for the auto-slow to trigger.
    pub autoslow_at_velocity: u32,
    pub shuttle_fwd_holdback_gain: f32,
    pub shuttle_rew_holdback_gain: f32,
    pub shuttle_servo_pgain: f32,
    pub shuttle_servo_igain: f32,
    pub shuttle_servo_dgain: f32,

    // Play servo parameters, high speed
    pub play_hi_supply_tension: u32,
    pub play_hi_takeup_tension: u32,
    /// Tape tach target that ends the acceleration boost.
    pub play_hi_boost_end: u32,
    pub play_hi_boost_pgain: f32,
    pub play_hi_boost_igain: f32,

    // Play servo parameters, low speed
    pub play_lo_supply_tension: u32,
    pub play_lo_takeup_tension: u32,
    pub play_lo_boost_end: u32,
    pub play_lo_boost_pgain: f32,
    pub play_lo_boost_igain: f32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum ParamsError {
    BufTooSmall,
    BadMagic,
    BadVersion,
    StaleBuild,
}

impl SystemParams {
    /// Factory defaults. The 1" headstack variant halves the tensions and
    /// runs a lighter stop brake torque.
    pub fn defaults(width: TapeWidth) -> Self {
        let mut p = Self {
            magic: MAGIC,
            version: make_rev(FIRMWARE_VER, FIRMWARE_REV),
            build: FIRMWARE_BUILD,

            debug: 0,
            pinch_settle_time: 250,
            lifter_settle_time: 600,
            brake_settle_time: 100,
            play_settle_time: 800,
            rechold_settle_time: 10,
            record_pulse_time: 50,
            vel_detect_threshold: 10,
            debounce: 30,
            sysflags: SysFlags {
                lifter_at_stop: false,
                brakes_at_stop: false,
                brakes_stop_play: true,
                engage_pinch_roller: true,
                stop_at_tape_end: true,
            },

            reel_radius_gain: 1.0,
            reel_offset_gain: 0.150,
            tension_sensor_gain: 0.07,
            tension_sensor_midscale1: 2_047.,
            tension_sensor_midscale2: 2_047.,

            thread_supply_tension: 120,
            thread_takeup_tension: 130,

            stop_supply_tension: 360,
            stop_takeup_tension: 385,
            stop_brake_torque: 650,

            shuttle_supply_tension: 360,
            shuttle_takeup_tension: 385,
            shuttle_velocity: 1_000,
            shuttle_lib_velocity: 500,
            shuttle_autoslow_velocity: 300,
            autoslow_at_offset: 65,
            autoslow_at_velocity: 650,
            shuttle_fwd_holdback_gain: 0.010,
            shuttle_rew_holdback_gain: 0.015,
            shuttle_servo_pgain: 0.56,
            shuttle_servo_igain: 0.19,
            shuttle_servo_dgain: 0.01,

            play_hi_supply_tension: 350,
            play_hi_takeup_tension: 375,
            play_hi_boost_end: 118,
            play_hi_boost_pgain: 1.350,
            play_hi_boost_igain: 0.250,

            play_lo_supply_tension: 350,
            play_lo_takeup_tension: 375,
            play_lo_boost_end: 25,
            play_lo_boost_pgain: 1.300,
            play_lo_boost_igain: 0.300,
        };

        if width == TapeWidth::One {
            p.stop_brake_torque = 400;

            p.stop_supply_tension /= 2;
            p.stop_takeup_tension /= 2;
            p.shuttle_supply_tension /= 2;
            p.shuttle_takeup_tension /= 2;
            p.thread_supply_tension /= 2;
            p.thread_takeup_tension /= 2;
            p.play_hi_supply_tension /= 2;
            p.play_hi_takeup_tension /= 2;
            p.play_lo_supply_tension /= 2;
            p.play_lo_takeup_tension /= 2;
        }

        p
    }

    /// Header check applied at load time; any failure reverts the record to
    /// defaults, which are then written back.
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.magic != MAGIC {
            return Err(ParamsError::BadMagic);
        }
        if self.version != make_rev(FIRMWARE_VER, FIRMWARE_REV) {
            return Err(ParamsError::BadVersion);
        }
        if self.build < FIRMWARE_MIN_BUILD {
            return Err(ParamsError::StaleBuild);
        }
        Ok(())
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, ParamsError> {
        if buf.len() < PARAMS_WIRE_SIZE {
            return Err(ParamsError::BufTooSmall);
        }

        let mut w = Writer { buf, at: 0 };

        w.u32(self.magic);
        w.u32(self.version);
        w.u32(self.build);

        w.i32(self.debug);
        w.u32(self.pinch_settle_time);
        w.u32(self.lifter_settle_time);
        w.u32(self.brake_settle_time);
        w.u32(self.play_settle_time);
        w.u32(self.rechold_settle_time);
        w.u32(self.record_pulse_time);
        w.u32(self.vel_detect_threshold);
        w.u32(self.debounce);
        w.u32(self.sysflags.to_word());

        w.f32(self.reel_radius_gain);
        w.f32(self.reel_offset_gain);
        w.f32(self.tension_sensor_gain);
        w.f32(self.tension_sensor_midscale1);
        w.f32(self.tension_sensor_midscale2);

        w.u32(self.thread_supply_tension);
        w.u32(self.thread_takeup_tension);

        w.u32(self.stop_supply_tension);
        w.u32(self.stop_takeup_tension);
        w.u32(self.stop_brake_torque);

        w.u32(self.shuttle_supply_tension);
        w.u32(self.shuttle_takeup_tension);
        w.u32(self.shuttle_velocity);
        w.u32(self.shuttle_lib_velocity);
        w.u32(self.shuttle_autoslow_velocity);
        w.u32(self.autoslow_at_offset);
        w.u32(self.autoslow_at_velocity);
        w.f32(self.shuttle_fwd_holdback_gain);
        w.f32(self.shuttle_rew_holdback_gain);
        w.f32(self.shuttle_servo_pgain);
        w.f32(self.shuttle_servo_igain);
        w.f32(self.shuttle_servo_dgain);

        w.u32(self.play_hi_supply_tension);
        w.u32(self.play_hi_takeup_tension);
        w.u32(self.play_hi_boost_end);
        w.f32(self.play_hi_boost_pgain);
        w.f32(self.play_hi_boost_igain);

        w.u32(self.play_lo_supply_tension);
        w.u32(self.play_lo_takeup_tension);
        w.u32(self.play_lo_boost_end);
        w.f32(self.play_lo_boost_pgain);
        w.f32(self.play_lo_boost_igain);

        Ok(w.at)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParamsError> {
        if buf.len() < PARAMS_WIRE_SIZE {
            return Err(ParamsError::BufTooSmall);
        }

        let mut r = Reader { buf, at: 0 };

        Ok(Self {
            magic: r.u32(),
            version: r.u32(),
            build: r.u32(),

            debug: r.i32(),
            pinch_settle_time: r.u32(),
            lifter_settle_time: r.u32(),
            brake_settle_time: r.u32(),
            play_settle_time: r.u32(),
            rechold_settle_time: r.u32(),
            record_pulse_time: r.u32(),
            vel_detect_threshold: r.u32(),
            debounce: r.u32(),
            sysflags: SysFlags::from_word(r.u32()),

            reel_radius_gain: r.f32(),
            reel_offset_gain: r.f32(),
            tension_sensor_gain: r.f32(),
            tension_sensor_midscale1: r.f32(),
            tension_sensor_midscale2: r.f32(),

            thread_supply_tension: r.u32(),
            thread_takeup_tension: r.u32(),

            stop_supply_tension: r.u32(),
            stop_takeup_tension: r.u32(),
            stop_brake_torque: r.u32(),

            shuttle_supply_tension: r.u32(),
            shuttle_takeup_tension: r.u32(),
            shuttle_velocity: r.u32(),
            shuttle_lib_velocity: r.u32(),
            shuttle_autoslow_velocity: r.u32(),
            autoslow_at_offset: r.u32(),
            autoslow_at_velocity: r.u32(),
            shuttle_fwd_holdback_gain: r.f32(),
            shuttle_rew_holdback_gain: r.f32(),
            shuttle_servo_pgain: r.f32(),
            shuttle_servo_igain: r.f32(),
            shuttle_servo_dgain: r.f32(),

            play_hi_supply_tension: r.u32(),
            play_hi_takeup_tension: r.u32(),
            play_hi_boost_end: r.u32(),
            play_hi_boost_pgain: r.f32(),
            play_hi_boost_igain: r.f32(),

            play_lo_supply_tension: r.u32(),
            play_lo_takeup_tension: r.u32(),
            play_lo_boost_end: r.u32(),
            play_lo_boost_pgain: r.f32(),
            play_lo_boost_igain: r.f32(),
        })
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl Writer<'_> {
    fn u32(&mut self, v: u32) {
        self.buf[self.at..self.at + 4].copy_from_slice(&v.to_le_bytes());
        self.at += 4;
    }

    fn i32(&mut self, v: i32) {
        self.u32(v as u32);
    }

    fn f32(&mut self, v: f32) {
        self.u32(v.to_bits());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl Reader<'_> {
    fn u32(&mut self) -> u32 {
        let mut b = [0; 4];
        b.copy_from_slice(&self.buf[self.at..self.at + 4]);
        self.at += 4;
        u32::from_le_bytes(b)
    }

    fn i32(&mut self) -> i32 {
        self.u32() as i32
    }

    fn f32(&mut self) -> f32 {
        f32::from_bits(self.u32())
    }
}
