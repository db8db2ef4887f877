//! Bit assignments for the two 8-bit I/O expander ports on the transport
//! interface. Port A of U5 reads the transport buttons and tape-out switch;
//! its port B drives the lamps. U8 reads the config DIP switches and speed
//! select, and drives the solenoid and record control lines.

// Transport push button and pull-up switch input bits.
pub const S_STOP: u8 = 0x01; // stop button
pub const S_PLAY: u8 = 0x02; // play button
pub const S_REC: u8 = 0x04; // record button
pub const S_REW: u8 = 0x08; // rewind button
pub const S_FWD: u8 = 0x10; // fast fwd button
pub const S_LDEF: u8 = 0x20; // lift defeat button
pub const S_TAPEOUT: u8 = 0x40; // tape out switch
pub const S_TAPEIN: u8 = 0x80; // tape detect (dummy bit)

pub const S_BUTTON_MASK: u8 = S_STOP | S_PLAY | S_REC | S_LDEF | S_FWD | S_REW;
pub const S_SWITCH_MASK: u8 = S_TAPEOUT;

// Lamp and diagnostic LED driver output bits.
pub const L_REC: u8 = 0x01; // record indicator lamp
pub const L_PLAY: u8 = 0x02; // play indicator lamp
pub const L_STOP: u8 = 0x04; // stop indicator lamp
pub const L_FWD: u8 = 0x08; // forward indicator lamp
pub const L_REW: u8 = 0x10; // rewind indicator lamp
pub const L_STAT1: u8 = 0x20; // diagnostic led1 (heartbeat)
pub const L_STAT2: u8 = 0x40; // diagnostic led2 (tape out)
pub const L_STAT3: u8 = 0x80; // diagnostic led3 (boost/timeout)

pub const L_LED_MASK: u8 = L_STAT1 | L_STAT2 | L_STAT3;
pub const L_LAMP_MASK: u8 = L_FWD | L_REW | L_PLAY | L_REC | L_STOP;

// Solenoid, record and capstan control output bits.
pub const T_BRAKE: u8 = 0x01; // engage reel motor brakes
pub const T_TLIFT: u8 = 0x02; // engage tape lifter solenoid
pub const T_PROL: u8 = 0x04; // engage pinch roller solenoid
pub const T_RECP: u8 = 0x08; // record pulse toggle bit
pub const T_RECH: u8 = 0x10; // record hold bit
pub const T_SERVO: u8 = 0x20; // capstan servo enable

pub const T_REC_MASK: u8 = T_RECP | T_RECH;

// Mode select switch input bits.
pub const M_DIPSW1: u8 = 0x01; // config DIP switch 1
pub const M_DIPSW2: u8 = 0x02; // config DIP switch 2 (stop lamp blink inhibit)
pub const M_DIPSW3: u8 = 0x04; // config DIP switch 3
pub const M_DIPSW4: u8 = 0x08; // config DIP switch 4
pub const M_HISPEED: u8 = 0x80; // remote speed select switch

pub const M_DIPSW_MASK: u8 = M_DIPSW1 | M_DIPSW2 | M_DIPSW3 | M_DIPSW4;
