// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Status LED on GPIO2, ROM busy-wait delay and the hardware watchdog.

use core::convert::Infallible;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, OutputPin};
use migrator_common::ActiveLow;

use crate::rom;

const GPIO_OUT_W1TS: *mut u32 = 0x6000_0304 as *mut u32;
const GPIO_OUT_W1TC: *mut u32 = 0x6000_0308 as *mut u32;
const GPIO_ENABLE_W1TS: *mut u32 = 0x6000_0310 as *mut u32;
const IO_MUX_GPIO2: *mut u32 = 0x6000_0838 as *mut u32;
const IO_MUX_FUNC_MASK: u32 = 0x130;
const GPIO2: u32 = 1 << 2;

const WDT_FEED: *mut u32 = 0x6000_0914 as *mut u32;
const WDT_FEED_MAGIC: u32 = 0x73;

/// Kick the hardware watchdog.
#[inline(always)]
pub fn feed_watchdog() {
    unsafe { WDT_FEED.write_volatile(WDT_FEED_MAGIC) };
}

/// GPIO2 driven as a push-pull output.
pub struct Gpio2 {
    _private: (),
}

impl Gpio2 {
    /// Route GPIO2 to the GPIO block and enable its output driver.
    pub fn new() -> Self {
        unsafe {
            let mux = IO_MUX_GPIO2.read_volatile();
            IO_MUX_GPIO2.write_volatile(mux & !IO_MUX_FUNC_MASK);
            GPIO_ENABLE_W1TS.write_volatile(GPIO2);
        }
        Self { _private: () }
    }
}

impl Default for Gpio2 {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorType for Gpio2 {
    type Error = Infallible;
}

impl OutputPin for Gpio2 {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        unsafe { GPIO_OUT_W1TC.write_volatile(GPIO2) };
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        unsafe { GPIO_OUT_W1TS.write_volatile(GPIO2) };
        Ok(())
    }
}

/// The on-board LED, wired from VCC to GPIO2.
pub type StatusLed = ActiveLow<Gpio2>;

/// Status LED, switched off.
pub fn status_led() -> StatusLed {
    let mut led = ActiveLow(Gpio2::new());
    led.set_low().ok();
    led
}

/// Busy-wait through the ROM, feeding the watchdog every millisecond.
pub struct RomDelay;

impl DelayNs for RomDelay {
    fn delay_ns(&mut self, ns: u32) {
        unsafe { rom::ets_delay_us(ns.div_ceil(1_000)) };
    }

    fn delay_ms(&mut self, ms: u32) {
        for _ in 0..ms {
            feed_watchdog();
            unsafe { rom::ets_delay_us(1_000) };
        }
    }
}
