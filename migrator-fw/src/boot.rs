// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Staged bootloader loading: RAM buffer, relocation and the final jump.

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use migrator_common::image::MAX_BOOTLOADER_SIZE;
use migrator_common::{BootImage, FlashDriver, FlashError, ImageError, RawMemory};

#[repr(C, align(4))]
struct Aligned([u8; MAX_BOOTLOADER_SIZE]);

/// One statically allocated buffer large enough for a whole bootloader.
pub struct BootloaderRam {
    buf: UnsafeCell<Aligned>,
    taken: AtomicBool,
}

// SAFETY: `take` hands out the buffer at most once.
unsafe impl Sync for BootloaderRam {}

impl BootloaderRam {
    pub const fn new() -> Self {
        Self {
            buf: UnsafeCell::new(Aligned([0; MAX_BOOTLOADER_SIZE])),
            taken: AtomicBool::new(false),
        }
    }

    /// The buffer, the first time this is called.
    pub fn take(&'static self) -> Option<&'static mut [u8]> {
        // Single core, one foreground task: load then store is enough.
        if self.taken.load(Ordering::Acquire) {
            return None;
        }
        self.taken.store(true, Ordering::Release);
        Some(unsafe { &mut (*self.buf.get()).0 })
    }
}

impl Default for BootloaderRam {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum BootError {
    Flash(FlashError),
    Image(ImageError),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::Flash(e) => write!(f, "flash: {}", e),
            BootError::Image(e) => write!(f, "image: {}", e),
        }
    }
}

impl From<FlashError> for BootError {
    fn from(e: FlashError) -> Self {
        BootError::Flash(e)
    }
}

impl From<ImageError> for BootError {
    fn from(e: ImageError) -> Self {
        BootError::Image(e)
    }
}

/// Read the image at `addr` into `ram`, copy its segments to their load
/// addresses and return the entry point.
///
/// Segment destinations are not checked; they must not overlap the caller's
/// own code or `ram`.
pub fn load<F: FlashDriver>(flash: &mut F, addr: u32, ram: &mut [u8]) -> Result<u32, BootError> {
    flash.read(addr, ram)?;
    let image = BootImage::parse(ram)?;
    defmt::info!(
        "Valid image, segments: {}, entry: 0x{:08x}",
        image.header().segment_count,
        image.entry_addr()
    );
    for segment in image.segments() {
        let segment = segment?;
        defmt::info!(
            "  Segment {}: addr=0x{:08x} len={}",
            segment.index,
            segment.load_addr,
            segment.data.len()
        );
    }
    Ok(image.relocate(&mut RawMemory)?)
}

/// # Safety
/// `entry` must be the entry point of an image that [`load`] relocated.
pub unsafe fn jump_to_entry(entry: u32) -> ! {
    let start: extern "C" fn() -> ! = core::mem::transmute(entry as usize);
    start()
}
