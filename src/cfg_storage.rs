//! Parameter persistence in the last two pages of onboard flash. One page
//! per tape width, selected by the width strap pin at boot, so 1" and 2"
//! machines coexist on one firmware image without clobbering each other's
//! tensions.

use hal::flash::{Bank, Flash};

use crate::params::{
    make_rev, SystemParams, TapeWidth, FIRMWARE_BUILD, FIRMWARE_REV, FIRMWARE_VER, MAGIC,
    PARAMS_WIRE_SIZE,
};
use crate::protocols::ipc_cmd::ParamStore;

// G47x: 512k flash as a single bank of 128 4kb pages.
pub const FLASH_CFG_PAGE_2IN: usize = 126;
pub const FLASH_CFG_PAGE_1IN: usize = 127;

fn page(width: TapeWidth) -> usize {
    match width {
        TapeWidth::Two => FLASH_CFG_PAGE_2IN,
        TapeWidth::One => FLASH_CFG_PAGE_1IN,
    }
}

/// Write the record to its slot, stamping the current header so a record
/// saved by this firmware always identifies itself correctly.
pub fn save(flash: &mut Flash, width: TapeWidth, params: &SystemParams) -> Result<(), ()> {
    let mut stamped = params.clone();
    stamped.magic = MAGIC;
    stamped.version = make_rev(FIRMWARE_VER, FIRMWARE_REV);
    stamped.build = FIRMWARE_BUILD;

    let mut buf = [0u8; PARAMS_WIRE_SIZE];
    stamped.encode(&mut buf).map_err(|_| ())?;

    flash
        .erase_write_page(Bank::B1, page(width), &buf)
        .map_err(|_| ())
}

/// Load the record for this machine's tape width. On any header mismatch
/// (magic, version, or a build below the accepted floor) the defaults are
/// installed and immediately written back, making the slot self-healing.
/// Returns the record and a status: 0 clean, -1 when defaults were
/// restored.
pub fn load(flash: &mut Flash, width: TapeWidth) -> (SystemParams, i32) {
    let mut buf = [0u8; PARAMS_WIRE_SIZE];
    flash.read(Bank::B1, page(width), 0, &mut buf);

    match SystemParams::decode(&buf) {
        Ok(p) if p.validate().is_ok() => (p, 0),
        Ok(p) => {
            defmt::warn!(
                "Stored parameters rejected (magic {:x} version {:x} build {}); using defaults",
                p.magic,
                p.version,
                p.build
            );

            let defaults = SystemParams::defaults(width);
            if save(flash, width, &defaults).is_err() {
                defmt::warn!("Parameter default write-back failed");
            }
            (defaults, -1)
        }
        Err(_) => {
            defmt::warn!("Stored parameters unreadable; using defaults");

            let defaults = SystemParams::defaults(width);
            if save(flash, width, &defaults).is_err() {
                defmt::warn!("Parameter default write-back failed");
            }
            (defaults, -1)
        }
    }
}

/// `ParamStore` adapter over the flash slot, for the IPC dispatcher.
pub struct FlashStore<'a> {
    pub flash: &'a mut Flash,
    pub width: TapeWidth,
}

impl ParamStore for FlashStore<'_> {
    fn load(&mut self, params: &mut SystemParams) -> i32 {
        let (p, status) = load(self.flash, self.width);
        *params = p;
        status
    }

    fn save(&mut self, params: &SystemParams) -> i32 {
        match save(self.flash, self.width, params) {
            Ok(()) => 0,
            Err(()) => -1,
        }
    }

    fn defaults(&mut self, params: &mut SystemParams) {
        *params = SystemParams::defaults(self.width);
    }
}
