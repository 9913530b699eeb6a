// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Progress shown on the status LED.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{OutputPin, PinState};
use migrator_common::indicator::MILESTONE_PERIOD_MS;
use migrator_common::{blink, ImageKind, Milestone, ProgressSink};

/// Blinks for milestones; toggles the LED every 4 KiB transferred.
pub struct LedProgress<'a, P: OutputPin, D: DelayNs> {
    led: &'a mut P,
    delay: &'a mut D,
    lit: bool,
}

impl<'a, P: OutputPin, D: DelayNs> LedProgress<'a, P, D> {
    pub fn new(led: &'a mut P, delay: &'a mut D) -> Self {
        Self {
            led,
            delay,
            lit: false,
        }
    }
}

impl<P: OutputPin, D: DelayNs> ProgressSink for LedProgress<'_, P, D> {
    fn milestone(&mut self, milestone: Milestone) {
        defmt::info!("{}", milestone);
        self.led.set_low().ok();
        self.lit = false;
        blink(&mut *self.led, &mut *self.delay, milestone.blinks(), MILESTONE_PERIOD_MS);
    }

    fn bytes(&mut self, kind: ImageKind, done: u32, total: u32) {
        defmt::debug!("{}: {}/{}", kind, done, total);
        self.lit = !self.lit;
        self.led.set_state(PinState::from(self.lit)).ok();
    }
}
