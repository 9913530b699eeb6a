// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Simulated NOR flash and execution memory for host-side runs and tests.

use std::collections::BTreeMap;

use crate::flash::{check_erase, check_program, check_read, FlashDriver, FlashError, Result};
use crate::image::LoadTarget;
use crate::installer::RomFlash;
use crate::layout::{ERASED_BYTE, SECTOR_SIZE};

/// Panic message of [`SimFlash`]'s [`RomFlash::restart`].
pub const RESTART_MESSAGE: &str = "simulated chip restart";

/// One operation seen by a [`SimFlash`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    Erase { sector: u32 },
    Program { addr: u32, len: usize },
    Read { addr: u32, len: usize },
    Delay { us: u32 },
    CacheDisabled,
    CacheRestored,
    Restart,
}

/// In-memory NOR flash.
///
/// Erase sets a whole sector to 0xFF; program can only clear bits (the new
/// value is ANDed in), so programming an unerased sector corrupts it the way
/// real hardware does.
#[derive(Debug, Clone)]
pub struct SimFlash {
    data: Vec<u8>,
    erase_counts: Vec<u32>,
    ops: Vec<FlashOp>,
    fail_erase: Option<u32>,
    fail_program: Option<u32>,
    cache_disabled: bool,
    watchdog_feeds: u32,
}

impl SimFlash {
    /// Blank flash of `capacity` bytes. `capacity` must be a whole number of
    /// sectors.
    pub fn new(capacity: u32) -> Self {
        let sectors = (capacity / SECTOR_SIZE) as usize;
        Self {
            data: vec![ERASED_BYTE; capacity as usize],
            erase_counts: vec![0; sectors],
            ops: Vec::new(),
            fail_erase: None,
            fail_program: None,
            cache_disabled: false,
            watchdog_feeds: 0,
        }
    }

    /// Flash initialised from a dump.
    pub fn from_image(image: &[u8]) -> Self {
        let mut flash = Self::new(image.len() as u32);
        flash.data.copy_from_slice(image);
        flash
    }

    /// Overwrite bytes directly, outside the erase/program rules.
    pub fn preload(&mut self, addr: u32, bytes: &[u8]) {
        let start = addr as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    pub fn slice(&self, addr: u32, len: usize) -> &[u8] {
        &self.data[addr as usize..addr as usize + len]
    }

    pub fn erase_count(&self, sector: u32) -> u32 {
        self.erase_counts[sector as usize]
    }

    /// Sectors erased, in order.
    pub fn erased_sectors(&self) -> Vec<u32> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                FlashOp::Erase { sector } => Some(*sector),
                _ => None,
            })
            .collect()
    }

    pub fn ops(&self) -> &[FlashOp] {
        &self.ops
    }

    /// Operations that changed flash contents.
    pub fn mutations(&self) -> Vec<FlashOp> {
        self.ops
            .iter()
            .copied()
            .filter(|op| matches!(op, FlashOp::Erase { .. } | FlashOp::Program { .. }))
            .collect()
    }

    pub fn clear_log(&mut self) {
        self.ops.clear();
        self.erase_counts.iter_mut().for_each(|c| *c = 0);
        self.watchdog_feeds = 0;
    }

    /// Make every erase of `sector` fail.
    pub fn fail_erase_at(&mut self, sector: u32) {
        self.fail_erase = Some(sector);
    }

    /// Make every program that covers `addr` fail.
    pub fn fail_program_at(&mut self, addr: u32) {
        self.fail_program = Some(addr);
    }

    pub fn clear_failures(&mut self) {
        self.fail_erase = None;
        self.fail_program = None;
    }

    pub fn watchdog_feeds(&self) -> u32 {
        self.watchdog_feeds
    }

    pub fn cache_disabled(&self) -> bool {
        self.cache_disabled
    }
}

impl FlashDriver for SimFlash {
    fn capacity(&self) -> u32 {
        self.data.len() as u32
    }

    fn erase_sector(&mut self, sector: u32) -> Result<()> {
        check_erase(self, sector)?;
        self.ops.push(FlashOp::Erase { sector });
        if self.fail_erase == Some(sector) {
            return Err(FlashError::Erase { sector });
        }
        let start = (sector * SECTOR_SIZE) as usize;
        self.data[start..start + SECTOR_SIZE as usize].fill(ERASED_BYTE);
        self.erase_counts[sector as usize] += 1;
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        check_program(self, addr, data.len())?;
        self.ops.push(FlashOp::Program {
            addr,
            len: data.len(),
        });
        if let Some(bad) = self.fail_program {
            if bad >= addr && bad < addr + data.len() as u32 {
                return Err(FlashError::Program { addr });
            }
        }
        let start = addr as usize;
        for (dst, src) in self.data[start..start + data.len()].iter_mut().zip(data) {
            *dst &= *src;
        }
        Ok(())
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        check_read(self, addr, buf.len())?;
        self.ops.push(FlashOp::Read {
            addr,
            len: buf.len(),
        });
        buf.copy_from_slice(self.slice(addr, buf.len()));
        Ok(())
    }

    fn feed_watchdog(&mut self) {
        self.watchdog_feeds += 1;
    }
}

impl RomFlash for SimFlash {
    fn erase_sector(&mut self, sector: u32) -> bool {
        FlashDriver::erase_sector(self, sector).is_ok()
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> bool {
        FlashDriver::program(self, addr, data).is_ok()
    }

    fn delay_us(&mut self, us: u32) {
        self.ops.push(FlashOp::Delay { us });
    }

    fn disable_cache_and_interrupts(&mut self) -> u32 {
        self.ops.push(FlashOp::CacheDisabled);
        self.cache_disabled = true;
        0
    }

    fn restore_cache_and_interrupts(&mut self, _saved: u32) {
        self.ops.push(FlashOp::CacheRestored);
        self.cache_disabled = false;
    }

    fn restart(&mut self) -> ! {
        self.ops.push(FlashOp::Restart);
        panic!("{}", RESTART_MESSAGE)
    }
}

/// Sparse execution memory recording every word store.
#[derive(Debug, Default, Clone)]
pub struct SimMemory {
    bytes: BTreeMap<u32, u8>,
    stores: Vec<(u32, usize)>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes at `addr`; never-written bytes read as zero.
    pub fn read(&self, addr: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| self.bytes.get(&(addr + i)).copied().unwrap_or(0))
            .collect()
    }

    /// `(addr, len)` of every store, in order.
    pub fn stores(&self) -> &[(u32, usize)] {
        &self.stores
    }
}

impl LoadTarget for SimMemory {
    fn store_words(&mut self, addr: u32, bytes: &[u8]) {
        assert_eq!(bytes.len() % 4, 0, "word store of {} bytes", bytes.len());
        self.stores.push((addr, bytes.len()));
        for (i, b) in bytes.iter().enumerate() {
            self.bytes.insert(addr + i as u32, *b);
        }
    }
}
