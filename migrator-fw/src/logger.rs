// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! `defmt` global logger writing frames to UART0 through the ROM.

use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use xtensa_lx::interrupt;

use crate::rom;

#[defmt::global_logger]
struct UartLogger;

static TAKEN: AtomicBool = AtomicBool::new(false);
static SAVED_MASK: AtomicU32 = AtomicU32::new(0);
static LAST_CYCLES: AtomicU32 = AtomicU32::new(0);
static CYCLE_WRAPS: AtomicU32 = AtomicU32::new(0);
static mut ENCODER: defmt::Encoder = defmt::Encoder::new();

fn write_bytes(bytes: &[u8]) {
    for &b in bytes {
        unsafe { rom::uart_tx_one_char(b) };
    }
}

unsafe impl defmt::Logger for UartLogger {
    fn acquire() {
        let mask = unsafe { interrupt::disable() };
        if TAKEN.load(Ordering::Relaxed) {
            panic!("defmt logger taken reentrantly");
        }
        TAKEN.store(true, Ordering::Relaxed);
        SAVED_MASK.store(mask, Ordering::Relaxed);

        // SAFETY: interrupts are masked and TAKEN guards against reentry.
        unsafe { (*addr_of_mut!(ENCODER)).start_frame(write_bytes) };
    }

    unsafe fn flush() {}

    unsafe fn release() {
        (*addr_of_mut!(ENCODER)).end_frame(write_bytes);
        TAKEN.store(false, Ordering::Relaxed);
        interrupt::set_mask(SAVED_MASK.load(Ordering::Relaxed));
    }

    unsafe fn write(bytes: &[u8]) {
        (*addr_of_mut!(ENCODER)).write(bytes, write_bytes);
    }
}

/// CPU clock the ROM leaves the core running at.
const CPU_MHZ: u64 = 80;

/// Microseconds since reset, from CCOUNT. The 32-bit counter wraps every
/// ~53 s at 80 MHz; a wrap is only seen if something logs at least that often.
fn uptime_us() -> u64 {
    let now = xtensa_lx::timer::get_cycle_count();
    // Called from `acquire`, with interrupts masked.
    if now < LAST_CYCLES.load(Ordering::Relaxed) {
        CYCLE_WRAPS.store(CYCLE_WRAPS.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);
    }
    LAST_CYCLES.store(now, Ordering::Relaxed);
    let cycles = ((CYCLE_WRAPS.load(Ordering::Relaxed) as u64) << 32) | now as u64;
    cycles / CPU_MHZ
}

defmt::timestamp!("{=u64:us}", uptime_us());
