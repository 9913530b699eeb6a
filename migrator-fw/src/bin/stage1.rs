// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

#![no_std]
#![no_main]

use embedded_hal::delay::DelayNs;
use migrator_common::{error_loop, FlashDriver, FlashLayout, Migrator, StagingPool};
use migrator_fw::board::{self, RomDelay};
use migrator_fw::flash::EspFlash;
use migrator_fw::net::{HttpSource, ShimNetwork};
use migrator_fw::progress::LedProgress;
use migrator_fw::{config, rom, running_image};
use panic_halt as _;
use xtensa_lx_rt::entry;

static STAGING: StagingPool = StagingPool::new();

#[entry]
fn main() -> ! {
    defmt::println!("Migrator stage 1 v{}", config::VERSION);

    let mut led = board::status_led();
    let mut delay = RomDelay;
    delay.delay_ms(3_000);

    let layout = FlashLayout::ESP8266_4M;
    let running = running_image();
    let mut flash = EspFlash::new();
    defmt::info!(
        "Flash JEDEC ID 0x{:06x}, {} bytes",
        flash.jedec_id(),
        flash.capacity()
    );

    let mut net = ShimNetwork::new(config::WIFI_SSID, config::WIFI_PASSWORD, config::WIFI_TIMEOUT_MS);
    let mut source = HttpSource::new(config::SERVER_URL);

    let result = {
        let mut progress = LedProgress::new(&mut led, &mut delay);
        Migrator::new(&mut flash, &STAGING, &layout).run_stage1(
            running,
            &mut net,
            &mut source,
            &mut progress,
        )
    };

    match result {
        Ok(record) => {
            defmt::println!("Stage 1 complete (record {})", record.sequence);
            defmt::println!(
                "Bootloader {} bytes, partition table {} bytes, app {} bytes staged",
                record.bootloader_len,
                record.partition_len,
                record.app_len
            );
            defmt::println!("Rebooting into stage 2...");
            delay.delay_ms(config::REBOOT_DELAY_MS);
            unsafe { rom::restart() }
        }
        Err(e) => {
            defmt::error!(
                "Stage 1 failed: {} ({}, retry safe: {})",
                e,
                e.class(),
                e.is_retry_safe()
            );
            error_loop(&mut led, &mut delay)
        }
    }
}
