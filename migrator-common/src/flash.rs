// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Low-level flash driver interface.
//!
//! The driver works on absolute flash offsets. Erase is per sector; program
//! and read addresses and lengths follow the 4-byte program granularity of
//! the SPI flash. Programming can only clear bits, so a sector must be erased
//! before anything is programmed into it.

use core::fmt;

use crate::layout::{PROGRAM_ALIGN, SECTOR_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Address or length is not a multiple of the program granularity.
    NotAligned,
    /// Access runs past the end of the device.
    OutOfBounds,
    /// The hardware reported a failed sector erase.
    Erase { sector: u32 },
    /// The hardware reported a failed program operation.
    Program { addr: u32 },
    /// The hardware reported a failed read.
    Read { addr: u32 },
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::NotAligned => write!(f, "flash access not 4-byte aligned"),
            FlashError::OutOfBounds => write!(f, "flash access out of bounds"),
            FlashError::Erase { sector } => write!(f, "erase of sector {} failed", sector),
            FlashError::Program { addr } => write!(f, "program at 0x{:06x} failed", addr),
            FlashError::Read { addr } => write!(f, "read at 0x{:06x} failed", addr),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FlashError {}

pub type Result<T> = core::result::Result<T, FlashError>;

/// Raw access to the SPI flash.
pub trait FlashDriver {
    /// Size of the device in bytes.
    fn capacity(&self) -> u32;

    /// Erase sector `sector` (offset `sector * SECTOR_SIZE`) back to all-ones.
    fn erase_sector(&mut self, sector: u32) -> Result<()>;

    /// Program `data` at `addr`. Both must be 4-byte aligned.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    /// Read `buf.len()` bytes starting at `addr`.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Service the hardware watchdog and any background work.
    ///
    /// Called around every erase and program, which can each take tens of
    /// milliseconds.
    fn feed_watchdog(&mut self) {}
}

// Argument checks in the spirit of embedded-storage's helpers.

pub fn check_erase<F: FlashDriver + ?Sized>(flash: &F, sector: u32) -> Result<()> {
    let end = (sector as u64 + 1) * SECTOR_SIZE as u64;
    if end > flash.capacity() as u64 {
        return Err(FlashError::OutOfBounds);
    }
    Ok(())
}

pub fn check_program<F: FlashDriver + ?Sized>(flash: &F, addr: u32, len: usize) -> Result<()> {
    check_bounds(flash, addr, len)?;
    if addr as usize % PROGRAM_ALIGN != 0 || len % PROGRAM_ALIGN != 0 {
        return Err(FlashError::NotAligned);
    }
    Ok(())
}

pub fn check_read<F: FlashDriver + ?Sized>(flash: &F, addr: u32, len: usize) -> Result<()> {
    check_bounds(flash, addr, len)
}

fn check_bounds<F: FlashDriver + ?Sized>(flash: &F, addr: u32, len: usize) -> Result<()> {
    let capacity = flash.capacity() as u64;
    if len as u64 > capacity || addr as u64 > capacity - len as u64 {
        return Err(FlashError::OutOfBounds);
    }
    Ok(())
}
