//! Hardware bring-up: pin modes, the SPI bus to the DAC and I/O expanders,
//! the IPC UART, the encoder and tach-capture timers, and the continuous
//! ADC conversion sequence. Anything the HAL has no wrapper for (encoder
//! mode, raw capture plumbing) is done at register level.

use hal::{
    adc::{self, Adc, AdcConfig, AdcDevice},
    clocks::Clocks,
    dma::{self, ChannelCfg, Dma, DmaChannel},
    gpio::{Pin, PinMode, Port},
    pac,
    spi::{Spi, SpiConfig},
    usart::{Usart, UsartConfig, UsartInterrupt},
};

use crate::params::TapeWidth;
use crate::sensors_shared;

// ADC conversion channels, in sequence order.
pub const TENSION_ADC_CH: u8 = 2; // PA1: tension sensor arm
pub const CURR_SUPPLY_ADC_CH: u8 = 15; // PB0: supply motor current option
pub const CURR_TAKEUP_ADC_CH: u8 = 12; // PB1: takeup motor current option
pub const EXPANSION_ADC_CH: u8 = 11; // expansion port ADC input option
pub const CPU_TEMP_ADC_CH: u8 = 16; // internal CPU temperature sensor

pub const ADC_DMA_CH: DmaChannel = DmaChannel::C1;

/// Capture timer input clock; the tach math divides this by edge periods.
pub const TACH_CLOCK_HZ: u32 = 170_000_000;

/// Set up pins with appropriate modes. Returns the chip selects (DAC,
/// switch expander, solenoid expander) and the tape-width strap reading.
pub fn setup_pins() -> (Pin, Pin, Pin, TapeWidth) {
    // SPI1 on PB3/PB4/PB5.
    let _spi_sck = Pin::new(Port::B, 3, PinMode::Alt(5));
    let _spi_miso = Pin::new(Port::B, 4, PinMode::Alt(5));
    let _spi_mosi = Pin::new(Port::B, 5, PinMode::Alt(5));

    let mut cs_dac = Pin::new(Port::A, 4, PinMode::Output);
    cs_dac.set_high();
    let mut cs_switch = Pin::new(Port::B, 12, PinMode::Output);
    cs_switch.set_high();
    let mut cs_solenoid = Pin::new(Port::B, 11, PinMode::Output);
    cs_solenoid.set_high();

    // IPC UART to the companion controller.
    let _uart_tx = Pin::new(Port::A, 2, PinMode::Alt(7));
    let _uart_rx = Pin::new(Port::A, 3, PinMode::Alt(7));

    // Reel encoders: TIM3 CH1/CH2 (supply), TIM4 CH1/CH2 (takeup).
    let _enc_sup_a = Pin::new(Port::A, 6, PinMode::Alt(2));
    let _enc_sup_b = Pin::new(Port::A, 7, PinMode::Alt(2));
    let _enc_tk_a = Pin::new(Port::B, 6, PinMode::Alt(2));
    let _enc_tk_b = Pin::new(Port::B, 7, PinMode::Alt(2));

    // Tape roller tach on TIM2 CH1.
    let _tach = Pin::new(Port::A, 0, PinMode::Alt(1));

    // Analog inputs.
    let _tension = Pin::new(Port::A, 1, PinMode::Analog);
    let _curr_sup = Pin::new(Port::B, 0, PinMode::Analog);
    let _curr_tk = Pin::new(Port::B, 1, PinMode::Analog);

    // Tape width strap: open (high) = 2", grounded = 1".
    let width_strap = Pin::new(Port::C, 13, PinMode::Input);
    let width = if width_strap.is_high() {
        TapeWidth::Two
    } else {
        TapeWidth::One
    };

    (cs_dac, cs_switch, cs_solenoid, width)
}

pub fn setup_spi(regs: pac::SPI1) -> Spi<pac::SPI1> {
    Spi::new(regs, SpiConfig::default(), hal::spi::BaudRate::Div32)
}

pub fn setup_ipc_uart(regs: pac::USART2, clocks: &Clocks) -> Usart<pac::USART2> {
    let mut uart = Usart::new(regs, 115_200, UsartConfig::default(), clocks);

    uart.enable_interrupt(UsartInterrupt::ReadNotEmpty);
    uart.enable_interrupt(UsartInterrupt::Idle);

    uart
}

/// TIM3 and TIM4 in quadrature encoder mode, free-running 16-bit counts.
/// The HAL has no encoder wrapper, so this is raw register work.
pub fn setup_encoder_timers() {
    let rcc = unsafe { &(*pac::RCC::ptr()) };
    rcc.apb1enr1
        .modify(|_, w| w.tim3en().set_bit().tim4en().set_bit());

    let tim3 = unsafe { &(*pac::TIM3::ptr()) };
    tim3.ccmr1_input()
        .modify(|_, w| unsafe { w.cc1s().bits(0b01).cc2s().bits(0b01) });
    // Encoder mode 3: count on both edges of both phases.
    tim3.smcr.modify(|_, w| unsafe { w.sms().bits(0b011) });
    tim3.arr.write(|w| unsafe { w.bits(0xFFFF) });
    tim3.cnt.write(|w| unsafe { w.bits(0) });
    tim3.cr1.modify(|_, w| w.cen().set_bit());

    let tim4 = unsafe { &(*pac::TIM4::ptr()) };
    tim4.ccmr1_input()
        .modify(|_, w| unsafe { w.cc1s().bits(0b01).cc2s().bits(0b01) });
    tim4.smcr.modify(|_, w| unsafe { w.sms().bits(0b011) });
    tim4.arr.write(|w| unsafe { w.bits(0xFFFF) });
    tim4.cnt.write(|w| unsafe { w.bits(0) });
    tim4.cr1.modify(|_, w| w.cen().set_bit());
}

/// Current (supply, takeup) encoder counts.
pub fn read_encoder_counts() -> (u16, u16) {
    let supply = unsafe { (*pac::TIM3::ptr()).cnt.read().bits() as u16 };
    let takeup = unsafe { (*pac::TIM4::ptr()).cnt.read().bits() as u16 };
    (supply, takeup)
}

/// TIM2 as a 32-bit falling-edge capture timer for the tape roller tach.
pub fn setup_tach_capture() {
    let rcc = unsafe { &(*pac::RCC::ptr()) };
    rcc.apb1enr1.modify(|_, w| w.tim2en().set_bit());

    let tim2 = unsafe { &(*pac::TIM2::ptr()) };
    tim2.psc.write(|w| unsafe { w.bits(0) });
    tim2.arr.write(|w| unsafe { w.bits(0xFFFF_FFFF) });
    tim2.ccmr1_input()
        .modify(|_, w| unsafe { w.cc1s().bits(0b01) });
    tim2.ccer
        .modify(|_, w| w.cc1p().set_bit().cc1e().set_bit());
    tim2.dier.modify(|_, w| w.cc1ie().set_bit());
    tim2.cr1.modify(|_, w| w.cen().set_bit());
}

/// Poll-and-clear the tach capture: the captured timestamp if an edge
/// arrived since the last call. Reading CCR1 clears the capture flag.
pub fn read_tach_capture() -> Option<u32> {
    let tim2 = unsafe { &(*pac::TIM2::ptr()) };

    if tim2.sr.read().cc1if().bit_is_set() {
        Some(tim2.ccr1.read().bits())
    } else {
        None
    }
}

/// Restart the absent-edge watchdog countdown; called on every tach edge.
pub fn tach_watchdog_feed() {
    unsafe {
        (*pac::TIM5::ptr()).cnt.write(|w| w.bits(0));
    }
}

/// Kick off the circular DMA conversion sequence into the shared buffer.
pub fn start_adc(adc: &mut Adc<pac::ADC1>, dma: &mut Dma<pac::DMA1>) {
    unsafe {
        adc.read_dma(
            &mut sensors_shared::ADC_READ_BUF,
            &[
                TENSION_ADC_CH,
                CURR_SUPPLY_ADC_CH,
                CURR_TAKEUP_ADC_CH,
                EXPANSION_ADC_CH,
                CPU_TEMP_ADC_CH,
            ],
            ADC_DMA_CH,
            ChannelCfg {
                circular: dma::Circular::Enabled,
                ..Default::default()
            },
            dma,
        );
    }
}

pub fn setup_adc(regs: pac::ADC1, clocks: &Clocks) -> Adc<pac::ADC1> {
    let adc_cfg = AdcConfig {
        operation_mode: adc::OperationMode::Continuous,
        ..Default::default()
    };

    let mut adc = Adc::new_adc1(regs, AdcDevice::One, adc_cfg, clocks);

    // Long sample times are fine for continuous background reads.
    adc.set_sample_time(TENSION_ADC_CH, adc::SampleTime::T601);

    adc
}
