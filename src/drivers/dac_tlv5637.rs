//! TLV5637 dual 10-bit motor DAC on SPI-0, driving the two reel motor
//! amplifiers. The output voltage (full scale set by the internal
//! reference) is `Vout = 2 * REF * CODE / 0x1000`; being a 10-bit part,
//! only D11..D2 carry data. The motor current amp delivers full torque at
//! 1 mA and zero torque at 5.1 mA, so higher DAC codes mean *less* torque:
//! the driver inverts the commanded value before it hits the wire.
//!
//! DAC A is the SUPPLY motor torque level, DAC B the TAKEUP level.

use hal::{gpio::Pin, pac::SPI1, spi::Spi};

use crate::transport_ctrls::DAC_MAX;

/// Control-register word: internal reference at 1.024 V.
const CTRL_REF_1V024: u16 = (1 << 15) | (1 << 12) | 0x01;

pub struct MotorDac {
    cs: Pin,
    /// Failed SPI transfers since boot; the servo loop never blocks on
    /// these, it just retries next tick.
    pub write_errors: u32,
}

impl MotorDac {
    pub fn new(cs: Pin) -> Self {
        Self {
            cs,
            write_errors: 0,
        }
    }

    /// Zero both outputs. Must run before any motion is possible.
    pub fn init(&mut self, spi: &mut Spi<SPI1>) {
        self.cs.set_high();

        if self.write(spi, 0, 0).is_err() {
            defmt::warn!("DAC zero-torque init write failed");
        }
    }

    fn xfer(&mut self, spi: &mut Spi<SPI1>, word: u16) -> Result<(), ()> {
        self.cs.set_low();
        let result = spi.write(&word.to_be_bytes()).map_err(|_| ());
        self.cs.set_high();
        result
    }

    /// Write both torque set-points. Three transactions: reference config,
    /// buffered DAC B, then DAC A with a simultaneous double update so both
    /// outputs step together.
    pub fn write(&mut self, spi: &mut Spi<SPI1>, supply: u16, takeup: u16) -> Result<(), ()> {
        let supply = supply.min(DAC_MAX);
        let takeup = takeup.min(DAC_MAX);

        // Lower codes produce higher motor current.
        let supply = DAC_MAX - supply;
        let takeup = DAC_MAX - takeup;

        // (1) Reference voltage (CONTROL register).
        // (2) DAC B value to the buffer.
        // (3) DAC A value, updating A and B simultaneously.
        let words = [
            CTRL_REF_1V024,
            (1 << 12) | ((takeup & 0x3FF) << 2),
            (1 << 15) | ((supply & 0x3FF) << 2),
        ];

        for word in words {
            if self.xfer(spi, word).is_err() {
                self.write_errors = self.write_errors.wrapping_add(1);
                defmt::warn!("DAC SPI write failed");
                return Err(());
            }
        }

        Ok(())
    }
}
