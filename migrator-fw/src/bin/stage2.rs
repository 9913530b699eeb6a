// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

#![no_std]
#![no_main]

use migrator_common::{error_loop, FlashLayout, Migrator, StagingPool};
use migrator_fw::board::{self, RomDelay};
use migrator_fw::boot::BootloaderRam;
use migrator_fw::flash::EspFlash;
use migrator_fw::install::install_from_iram;
use migrator_fw::progress::LedProgress;
use migrator_fw::{config, running_image};
use panic_halt as _;
use xtensa_lx_rt::entry;

static STAGING: StagingPool = StagingPool::new();
static BOOTLOADER_RAM: BootloaderRam = BootloaderRam::new();

#[entry]
fn main() -> ! {
    defmt::println!("Migrator stage 2 v{}", config::VERSION);

    let mut led = board::status_led();
    let mut delay = RomDelay;

    let Some(ram) = BOOTLOADER_RAM.take() else {
        error_loop(&mut led, &mut delay)
    };

    let layout = FlashLayout::ESP8266_4M;
    let running = running_image();
    let mut flash = EspFlash::new();

    let result = {
        let mut progress = LedProgress::new(&mut led, &mut delay);
        Migrator::new(&mut flash, &STAGING, &layout).run_stage2(running.start, ram, &mut progress)
    };

    match result {
        Ok(installer) => {
            defmt::println!("Installing boot region, the chip restarts when done");
            install_from_iram(&installer)
        }
        Err(e) => {
            defmt::error!(
                "Stage 2 failed: {} ({}, retry safe: {})",
                e,
                e.class(),
                e.is_retry_safe()
            );
            error_loop(&mut led, &mut delay)
        }
    }
}
