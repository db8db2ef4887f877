//! MCP23S17 SPI I/O expanders on the transport interface card. U5 reads
//! the transport buttons and tape-out switch on port A and drives the
//! lamps and diagnostic LEDs on port B; U8 reads the config DIP switches
//! and speed select on port A and drives the solenoid, record and capstan
//! control lines on port B.
//!
//! All access goes through the shared SPI bus; callers hold the bus
//! resource lock for the duration of a call. The solenoid port is only
//! ever written through `set_transport_mask`, a read-modify-write on the
//! shadow mask, so concurrent partial updates never lose bits.

use hal::{gpio::Pin, pac::SPI1, spi::Spi};

// MCP23S17 register addresses (IOCON.BANK = 0).
const MCP_IODIRA: u8 = 0x00;
const MCP_IODIRB: u8 = 0x01;
const MCP_IOCON: u8 = 0x0A;
const MCP_GPPUA: u8 = 0x0C;
const MCP_GPIOA: u8 = 0x12;
const MCP_GPIOB: u8 = 0x13;

/// SPI opcode: 0100 A2 A1 A0 R/W.
const MCP_OPCODE_WRITE: u8 = 0x40;
const MCP_OPCODE_READ: u8 = 0x41;

pub struct IoExpander {
    cs: Pin,
}

impl IoExpander {
    pub fn new(cs: Pin) -> Self {
        Self { cs }
    }

    fn write_reg(&mut self, spi: &mut Spi<SPI1>, reg: u8, val: u8) -> Result<(), ()> {
        self.cs.set_low();
        let result = spi.write(&[MCP_OPCODE_WRITE, reg, val]).map_err(|_| ());
        self.cs.set_high();
        result
    }

    fn read_reg(&mut self, spi: &mut Spi<SPI1>, reg: u8) -> Result<u8, ()> {
        let mut frame = [MCP_OPCODE_READ, reg, 0];

        self.cs.set_low();
        let result = spi.transfer(&mut frame).map_err(|_| ());
        self.cs.set_high();

        result.map(|_| frame[2])
    }

    /// Port A input with pull-ups, port B output, sequential addressing.
    fn init(&mut self, spi: &mut Spi<SPI1>) -> Result<(), ()> {
        self.write_reg(spi, MCP_IOCON, 0x00)?;
        self.write_reg(spi, MCP_IODIRA, 0xFF)?;
        self.write_reg(spi, MCP_GPPUA, 0xFF)?;
        self.write_reg(spi, MCP_IODIRB, 0x00)?;
        self.write_reg(spi, MCP_GPIOB, 0x00)?;
        Ok(())
    }
}

/// Both expanders plus the shadow masks for the write-only ports.
pub struct TransportPorts {
    /// U5: buttons in, lamps out.
    exp_switch: IoExpander,
    /// U8: mode switches in, solenoids out.
    exp_solenoid: IoExpander,

    transport_mask: u8,
    lamp_mask: u8,
    lamp_mask_prev: u8,

    /// Failed SPI transactions since boot.
    pub bus_errors: u32,
}

impl TransportPorts {
    pub fn new(cs_switch: Pin, cs_solenoid: Pin) -> Self {
        Self {
            exp_switch: IoExpander::new(cs_switch),
            exp_solenoid: IoExpander::new(cs_solenoid),
            transport_mask: 0,
            lamp_mask: 0,
            lamp_mask_prev: 0xFF,
            bus_errors: 0,
        }
    }

    pub fn init(&mut self, spi: &mut Spi<SPI1>) -> Result<(), ()> {
        self.exp_switch.init(spi)?;
        self.exp_solenoid.init(spi)?;

        // Everything released: no brakes, no lifter, no roller, no record,
        // capstan off.
        self.write_solenoids(spi)
    }

    fn note_err<T>(&mut self, r: Result<T, ()>) -> Result<T, ()> {
        if r.is_err() {
            self.bus_errors = self.bus_errors.wrapping_add(1);
        }
        r
    }

    /// Transport buttons and tape-out switch. The buttons pull the inputs
    /// to ground, so the raw byte is inverted to active-high bits.
    pub fn read_transport_switches(&mut self, spi: &mut Spi<SPI1>) -> Result<u8, ()> {
        let r = self.exp_switch.read_reg(spi, MCP_GPIOA).map(|v| !v);
        self.note_err(r)
    }

    /// Config DIP switches and the hi/lo speed select.
    pub fn read_mode_switches(&mut self, spi: &mut Spi<SPI1>) -> Result<u8, ()> {
        let r = self.exp_solenoid.read_reg(spi, MCP_GPIOA).map(|v| !v);
        self.note_err(r)
    }

    fn write_solenoids(&mut self, spi: &mut Spi<SPI1>) -> Result<(), ()> {
        let mask = self.transport_mask;
        let r = self.exp_solenoid.write_reg(spi, MCP_GPIOB, mask);
        self.note_err(r)
    }

    /// Clear then set bits on the solenoid/record/capstan port.
    pub fn set_transport_mask(&mut self, spi: &mut Spi<SPI1>, set: u8, clear: u8) {
        self.transport_mask &= !clear;
        self.transport_mask |= set;

        let _ = self.write_solenoids(spi);
    }

    pub fn transport_mask(&self) -> u8 {
        self.transport_mask
    }

    pub fn set_lamp_mask(&mut self, set: u8, clear: u8) {
        self.lamp_mask &= !clear;
        self.lamp_mask |= set;
    }

    pub fn toggle_lamps(&mut self, mask: u8) {
        self.lamp_mask ^= mask;
    }

    pub fn lamp_mask(&self) -> u8 {
        self.lamp_mask
    }

    /// Write the lamp port only when the mask changed since the last
    /// flush; called from the 10 ms poll task.
    pub fn flush_lamps(&mut self, spi: &mut Spi<SPI1>) {
        if self.lamp_mask == self.lamp_mask_prev {
            return;
        }

        let mask = self.lamp_mask;
        let r = self.exp_switch.write_reg(spi, MCP_GPIOB, mask);
        if self.note_err(r).is_ok() {
            self.lamp_mask_prev = mask;
        }
    }

    /// Set the lamp port immediately, bypassing the change check. Used by
    /// the boot-time lamp chase.
    pub fn set_lamps_now(&mut self, spi: &mut Spi<SPI1>, mask: u8) {
        self.lamp_mask = mask;
        let r = self.exp_switch.write_reg(spi, MCP_GPIOB, mask);
        if self.note_err(r).is_ok() {
            self.lamp_mask_prev = mask;
        }
    }
}

/// Borrowed view pairing the ports with the SPI bus, for the sequencer's
/// `TransportIo` seam.
pub struct PortsIo<'a> {
    pub ports: &'a mut TransportPorts,
    pub spi: &'a mut Spi<SPI1>,
}

impl crate::transport_ctrls::sequencer::TransportIo for PortsIo<'_> {
    fn set_transport_mask(&mut self, set: u8, clear: u8) {
        self.ports.set_transport_mask(self.spi, set, clear);
    }

    fn transport_mask(&self) -> u8 {
        self.ports.transport_mask()
    }

    fn set_lamp_mask(&mut self, set: u8, clear: u8) {
        self.ports.set_lamp_mask(set, clear);
    }

    fn toggle_lamps(&mut self, mask: u8) {
        self.ports.toggle_lamps(mask);
    }

    fn lamp_mask(&self) -> u8 {
        self.ports.lamp_mask()
    }
}
