//! Drivers for the transport interface hardware, each in its own
//! sub-module. The tach and encoder modules are pure count math (their
//! timer plumbing lives in `setup`), so they build and test anywhere; the
//! SPI peripherals only build for the target.

#[cfg(target_os = "none")]
pub mod dac_tlv5637;
#[cfg(target_os = "none")]
pub mod ioexp_mcp23s17;
pub mod reel_qei;
pub mod tape_tach;
