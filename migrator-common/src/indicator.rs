// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Status LED patterns.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, OutputPin};

/// Blinks in one burst of the error pattern.
pub const ERROR_BLINKS: u32 = 10;
pub const ERROR_PERIOD_MS: u32 = 100;
/// Pause between bursts of the error pattern.
pub const ERROR_PAUSE_MS: u32 = 2_000;
/// Default period for milestone blinks.
pub const MILESTONE_PERIOD_MS: u32 = 200;

/// Blink an LED `count` times. "High" means lit; wrap active-low LEDs in
/// [`ActiveLow`].
pub fn blink(led: &mut impl OutputPin, timer: &mut impl DelayNs, count: u32, period_ms: u32) {
    for _ in 0..count {
        led.set_high().ok();
        timer.delay_ms(period_ms);
        led.set_low().ok();
        timer.delay_ms(period_ms);
    }
}

/// Halt with the error pattern: [`ERROR_BLINKS`] quick blinks, a pause,
/// forever.
pub fn error_loop(led: &mut impl OutputPin, timer: &mut impl DelayNs) -> ! {
    loop {
        blink(led, timer, ERROR_BLINKS, ERROR_PERIOD_MS);
        timer.delay_ms(ERROR_PAUSE_MS);
    }
}

/// Inverts an output pin so that `set_high` lights an LED wired to VCC.
pub struct ActiveLow<P>(pub P);

impl<P: OutputPin> ErrorType for ActiveLow<P> {
    type Error = P::Error;
}

impl<P: OutputPin> OutputPin for ActiveLow<P> {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.set_high()
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.set_low()
    }
}
