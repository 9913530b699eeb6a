// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

#![no_std]
#![no_main]

use migrator_common::{error_loop, FlashLayout};
use migrator_fw::boot::{self, BootloaderRam};
use migrator_fw::board::{self, RomDelay};
use migrator_fw::config;
use migrator_fw::flash::EspFlash;
use panic_halt as _;
use xtensa_lx_rt::entry;

static BOOTLOADER_RAM: BootloaderRam = BootloaderRam::new();

#[entry]
fn main() -> ! {
    defmt::println!("Boot stub v{}", config::VERSION);

    let mut led = board::status_led();
    let mut delay = RomDelay;
    let layout = FlashLayout::ESP8266_4M;
    let source = layout.staging_bootloader.start;

    let Some(ram) = BOOTLOADER_RAM.take() else {
        error_loop(&mut led, &mut delay)
    };

    defmt::println!("Loading bootloader from 0x{:06x}...", source);
    let mut flash = EspFlash::new();
    match boot::load(&mut flash, source, ram) {
        Ok(entry) => {
            defmt::println!("Jumping to 0x{:08x}", entry);
            unsafe { boot::jump_to_entry(entry) }
        }
        Err(e) => {
            defmt::error!("Cannot boot: {}", e);
            error_loop(&mut led, &mut delay)
        }
    }
}
