//! Shared ADC plumbing. One circular DMA sequence continuously converts
//! the five servo analog channels into a static buffer; the servo tick
//! snapshots the buffer each pass. With non-timing-critical continuous
//! reads we discard many conversions, at no cost beyond power.

use core::ptr::addr_of;

/// Conversion sequence order, also the buffer layout:
/// tension arm, supply motor current (option), takeup motor current
/// (option), expansion port input (option), internal CPU temperature.
pub const ADC_SEQ_LEN: usize = 5;

pub const ADC_IDX_TENSION: usize = 0;
pub const ADC_IDX_CURRENT_SUPPLY: usize = 1;
pub const ADC_IDX_CURRENT_TAKEUP: usize = 2;
pub const ADC_IDX_EXPANSION: usize = 3;
pub const ADC_IDX_CPU_TEMP: usize = 4;

/// DMA target for the continuous conversion sequence.
pub static mut ADC_READ_BUF: [u16; ADC_SEQ_LEN] = [0; ADC_SEQ_LEN];

/// Copy of the conversion buffer for the current servo tick.
pub fn adc_snapshot() -> [u16; ADC_SEQ_LEN] {
    unsafe { core::ptr::read_volatile(addr_of!(ADC_READ_BUF)) }
}
