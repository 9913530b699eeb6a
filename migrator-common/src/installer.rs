// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Boot-region installer.
//!
//! The last step of the migration rewrites the sectors the chip boots from.
//! While that happens the flash cache is off, so nothing may be fetched from
//! flash: no code, no constants, no logging. The sequence is therefore split
//! in two:
//!
//! 1. [`InstallerPayload::arm`] validates the plan (targets, sizes, order)
//!    while normal execution and logging are still available.
//! 2. [`ArmedInstaller::run`] disables the cache and interrupts, erases and
//!    programs every region in order, waits, and restarts the chip. It never
//!    returns and ignores every ROM result, since there is nobody left to
//!    report to.
//!
//! Placement: `run` and the [`RomFlash`] methods it calls are
//! `#[inline(always)]` so that they are compiled into the single caller the
//! firmware places in IRAM. The payload data must live in RAM.

use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use heapless::Vec;

use crate::layout::{align_up, is_sector_aligned, sector_of, FlashLayout, ERASED_BYTE, PROGRAM_ALIGN, SECTOR_SIZE};

/// Bytes handed to the ROM program routine per call.
pub const CHUNK_SIZE: usize = 256;
/// Busy-wait after every erase and program call.
pub const SETTLE_DELAY_US: u32 = 5_000;
/// Busy-wait before the final restart.
pub const RESET_DELAY_US: u32 = 100_000;
/// Partition table plus boot region.
pub const MAX_REGIONS: usize = 2;

/// ROM-resident primitives usable with the flash cache disabled.
pub trait RomFlash {
    /// Erase one sector. `true` on success.
    fn erase_sector(&mut self, sector: u32) -> bool;

    /// Program `data` at `addr`; both 4-byte aligned. `true` on success.
    fn write(&mut self, addr: u32, data: &[u8]) -> bool;

    /// Busy-wait.
    fn delay_us(&mut self, us: u32);

    /// Disable the flash cache and mask interrupts. Returns the state that
    /// [`restore_cache_and_interrupts`](Self::restore_cache_and_interrupts)
    /// needs.
    fn disable_cache_and_interrupts(&mut self) -> u32;

    fn restore_cache_and_interrupts(&mut self, saved: u32);

    /// Hardware reset.
    fn restart(&mut self) -> !;
}

/// Scoped "cache off, interrupts masked" capability.
///
/// Entering disables both; dropping the guard restores them on every exit
/// path. [`never_release`](Self::never_release) gives the section up for good:
/// the only way out after that is a restart.
pub struct FlashCriticalSection<'a, R: RomFlash> {
    rom: &'a mut R,
    saved: u32,
}

impl<'a, R: RomFlash> FlashCriticalSection<'a, R> {
    #[inline(always)]
    pub fn enter(rom: &'a mut R) -> Self {
        let saved = rom.disable_cache_and_interrupts();
        Self { rom, saved }
    }

    /// Leave the cache disabled and interrupts masked for the rest of this
    /// boot. The caller must end in [`RomFlash::restart`].
    #[inline(always)]
    pub fn never_release(self) -> &'a mut R {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the reference is moved out once.
        unsafe { core::ptr::read(&this.rom) }
    }
}

impl<R: RomFlash> Deref for FlashCriticalSection<'_, R> {
    type Target = R;

    fn deref(&self) -> &R {
        &*self.rom
    }
}

impl<R: RomFlash> DerefMut for FlashCriticalSection<'_, R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut *self.rom
    }
}

impl<R: RomFlash> Drop for FlashCriticalSection<'_, R> {
    #[inline(always)]
    fn drop(&mut self) {
        self.rom.restore_cache_and_interrupts(self.saved);
    }
}

/// One contiguous area to erase and then program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallRegion<'a> {
    /// Flash offset; must be sector aligned.
    pub target: u32,
    /// Sectors erased starting at `target`.
    pub erase_sectors: u32,
    /// Bytes programmed starting at `target`.
    pub data: &'a [u8],
}

impl<'a> InstallRegion<'a> {
    pub const fn new(target: u32, erase_sectors: u32, data: &'a [u8]) -> Self {
        Self {
            target,
            erase_sectors,
            data,
        }
    }

    pub fn erase_span(&self) -> u32 {
        self.erase_sectors * SECTOR_SIZE
    }

    fn overlaps(&self, other: &InstallRegion<'_>) -> bool {
        self.target < other.target + other.erase_span()
            && other.target < self.target + self.erase_span()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InstallerError {
    /// Region target is not on a sector boundary.
    Misaligned { target: u32 },
    /// Region erases nothing or has nothing to program.
    Empty { target: u32 },
    /// Region data does not fit in the sectors it erases.
    TooLarge { target: u32, len: u32 },
    /// Two regions share a sector.
    Overlap { first: u32, second: u32 },
    /// The last region does not cover the boot region.
    BootRegionNotLast,
}

impl fmt::Display for InstallerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallerError::Misaligned { target } => {
                write!(f, "install target 0x{:06x} is not sector aligned", target)
            }
            InstallerError::Empty { target } => {
                write!(f, "install region at 0x{:06x} is empty", target)
            }
            InstallerError::TooLarge { target, len } => {
                write!(f, "{} bytes do not fit the region at 0x{:06x}", len, target)
            }
            InstallerError::Overlap { first, second } => {
                write!(f, "install regions 0x{:06x} and 0x{:06x} overlap", first, second)
            }
            InstallerError::BootRegionNotLast => {
                write!(f, "the boot region must be the last region installed")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for InstallerError {}

/// Plain-data description of what the installer writes, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerPayload<'a> {
    regions: Vec<InstallRegion<'a>, MAX_REGIONS>,
    boot_region_start: u32,
    boot_region_sectors: u32,
}

impl<'a> InstallerPayload<'a> {
    /// Install `bootloader` into the boot region of `layout`, preceded by
    /// `partition_table` at its final location when given.
    pub fn new(layout: &FlashLayout, bootloader: &'a [u8], partition_table: Option<&'a [u8]>) -> Self {
        let mut regions = Vec::new();
        if let Some(table) = partition_table {
            let region = InstallRegion::new(
                layout.partition_table.start,
                layout.partition_table.sector_count(),
                table,
            );
            // Capacity is MAX_REGIONS, so the two pushes below cannot fail.
            let _ = regions.push(region);
        }
        let _ = regions.push(InstallRegion::new(
            layout.boot_region.start,
            layout.boot_region.sector_count(),
            bootloader,
        ));
        Self {
            regions,
            boot_region_start: layout.boot_region.start,
            boot_region_sectors: layout.boot_region.sector_count(),
        }
    }

    pub fn regions(&self) -> &[InstallRegion<'a>] {
        &self.regions
    }

    /// Replace the region list, for payloads built by hand.
    pub fn with_regions(mut self, regions: &[InstallRegion<'a>]) -> Self {
        self.regions.clear();
        for r in regions.iter().take(MAX_REGIONS) {
            let _ = self.regions.push(*r);
        }
        self
    }

    /// Validate the plan. Nothing is touched until the returned installer is
    /// run.
    pub fn arm(self) -> Result<ArmedInstaller<'a>, InstallerError> {
        for r in &self.regions {
            if !is_sector_aligned(r.target) {
                return Err(InstallerError::Misaligned { target: r.target });
            }
            if r.erase_sectors == 0 || r.data.is_empty() {
                return Err(InstallerError::Empty { target: r.target });
            }
            if r.data.len() > r.erase_span() as usize {
                return Err(InstallerError::TooLarge {
                    target: r.target,
                    len: r.data.len() as u32,
                });
            }
        }

        for (i, a) in self.regions.iter().enumerate() {
            for b in self.regions.iter().skip(i + 1) {
                if a.overlaps(b) {
                    return Err(InstallerError::Overlap {
                        first: a.target,
                        second: b.target,
                    });
                }
            }
        }

        match self.regions.last() {
            Some(last)
                if last.target == self.boot_region_start
                    && last.erase_sectors >= self.boot_region_sectors => {}
            _ => return Err(InstallerError::BootRegionNotLast),
        }

        for r in &self.regions {
            info!(
                "Installer armed: 0x{:06x} erase {} sectors, program {} bytes",
                r.target,
                r.erase_sectors,
                r.data.len()
            );
        }
        Ok(ArmedInstaller {
            regions: self.regions,
        })
    }
}

/// ROM program routines read their source a word at a time.
#[repr(C, align(4))]
struct WordAligned([u8; CHUNK_SIZE]);

/// A validated payload, ready for the irreversible sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedInstaller<'a> {
    regions: Vec<InstallRegion<'a>, MAX_REGIONS>,
}

impl<'a> ArmedInstaller<'a> {
    pub fn regions(&self) -> &[InstallRegion<'a>] {
        &self.regions
    }

    /// Point of no return.
    ///
    /// Disables the flash cache and interrupts without ever restoring them,
    /// erases and programs each region, then restarts the chip.
    #[inline(always)]
    pub fn run<R: RomFlash>(&self, rom: &mut R) -> ! {
        let rom = FlashCriticalSection::enter(rom).never_release();
        self.program_sequence(rom);
        rom.delay_us(RESET_DELAY_US);
        rom.restart()
    }

    /// The erase/program part of [`run`](Self::run), without the critical
    /// section or the restart.
    #[inline(always)]
    pub fn program_sequence<R: RomFlash>(&self, rom: &mut R) {
        for region in self.regions.iter() {
            let first = sector_of(region.target);
            for sector in first..first + region.erase_sectors {
                let _ = rom.erase_sector(sector);
                rom.delay_us(SETTLE_DELAY_US);
            }

            let mut chunk = WordAligned([ERASED_BYTE; CHUNK_SIZE]);
            let mut addr = region.target;
            for src in region.data.chunks(CHUNK_SIZE) {
                let aligned = align_up(src.len(), PROGRAM_ALIGN);
                chunk.0[..src.len()].copy_from_slice(src);
                chunk.0[src.len()..aligned].fill(ERASED_BYTE);
                let _ = rom.write(addr, &chunk.0[..aligned]);
                rom.delay_us(SETTLE_DELAY_US);
                addr += src.len() as u32;
            }
        }
    }
}
