// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! ROM primitives behind the boot-region installer and its IRAM entry point.

use migrator_common::{ArmedInstaller, RomFlash};
use xtensa_lx::interrupt;

use crate::board;
use crate::rom;

/// The mask ROM as seen by the installer. Every method is inlined into
/// [`install_from_iram`].
pub struct EspRom;

impl RomFlash for EspRom {
    #[inline(always)]
    fn erase_sector(&mut self, sector: u32) -> bool {
        unsafe { rom::SPIEraseSector(sector) == 0 }
    }

    #[inline(always)]
    fn write(&mut self, addr: u32, data: &[u8]) -> bool {
        unsafe { rom::SPIWrite(addr, data.as_ptr().cast::<u32>(), data.len() as u32) == 0 }
    }

    #[inline(always)]
    fn delay_us(&mut self, us: u32) {
        board::feed_watchdog();
        unsafe { rom::ets_delay_us(us) };
    }

    #[inline(always)]
    fn disable_cache_and_interrupts(&mut self) -> u32 {
        unsafe {
            let saved = interrupt::disable();
            rom::Cache_Read_Disable();
            saved
        }
    }

    #[inline(always)]
    fn restore_cache_and_interrupts(&mut self, saved: u32) {
        unsafe {
            rom::cache_enable();
            interrupt::set_mask(saved);
        }
    }

    #[inline(always)]
    fn restart(&mut self) -> ! {
        unsafe { rom::restart() }
    }
}

/// Run the installer. Never returns: the chip restarts into whatever the
/// boot region now holds.
///
/// This function is placed in IRAM and the installer is inlined into it; the
/// payload it writes sits in DRAM. Once the cache is off nothing here reads
/// flash-mapped memory.
#[link_section = ".rwtext"]
#[inline(never)]
pub fn install_from_iram(installer: &ArmedInstaller<'_>) -> ! {
    installer.run(&mut EspRom)
}
