// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! `FlashDriver` over the mask ROM SPI routines.
//!
//! Each operation runs from IRAM with interrupts masked and the flash cache
//! off, then restores both:
//!   1. mask interrupts
//!   2. Cache_Read_Disable()
//!   3. SPIEraseSector() / SPIWrite() / SPIRead()
//!   4. Cache_Read_Enable()
//!   5. restore interrupts
//!
//! The ROM routines move whole words, so data passes through a word-aligned
//! bounce buffer.

use migrator_common::flash::{check_erase, check_program, check_read, Result};
use migrator_common::{FlashDriver, FlashError};
use xtensa_lx::interrupt;

use crate::board;
use crate::rom;

const SPI0_CMD: *mut u32 = 0x6000_0200 as *mut u32;
const SPI0_W0: *mut u32 = 0x6000_0240 as *mut u32;
const SPI_FLASH_RDID: u32 = 1 << 28;

const BOUNCE_WORDS: usize = 64;
const BOUNCE_BYTES: usize = BOUNCE_WORDS * 4;

/// Read the JEDEC ID of the flash chip.
#[link_section = ".rwtext"]
#[inline(never)]
unsafe fn read_jedec_id() -> u32 {
    let saved = interrupt::disable();
    rom::Cache_Read_Disable();
    SPI0_W0.write_volatile(0);
    SPI0_CMD.write_volatile(SPI_FLASH_RDID);
    while SPI0_CMD.read_volatile() != 0 {}
    let id = SPI0_W0.read_volatile() & 0x00FF_FFFF;
    rom::cache_enable();
    interrupt::set_mask(saved);
    id
}

#[link_section = ".rwtext"]
#[inline(never)]
unsafe fn rom_erase(sector: u32) -> i32 {
    let saved = interrupt::disable();
    rom::Cache_Read_Disable();
    let rc = rom::SPIEraseSector(sector);
    rom::cache_enable();
    interrupt::set_mask(saved);
    rc
}

#[link_section = ".rwtext"]
#[inline(never)]
unsafe fn rom_write(addr: u32, src: *const u32, len: u32) -> i32 {
    let saved = interrupt::disable();
    rom::Cache_Read_Disable();
    let rc = rom::SPIWrite(addr, src, len);
    rom::cache_enable();
    interrupt::set_mask(saved);
    rc
}

#[link_section = ".rwtext"]
#[inline(never)]
unsafe fn rom_read(addr: u32, dst: *mut u32, len: u32) -> i32 {
    let saved = interrupt::disable();
    rom::Cache_Read_Disable();
    let rc = rom::SPIRead(addr, dst, len);
    rom::cache_enable();
    interrupt::set_mask(saved);
    rc
}

/// Capacity encoded in the third JEDEC ID byte, or 0 for an unknown chip.
fn capacity_from_jedec(id: u32) -> u32 {
    match (id >> 16) & 0xFF {
        exp @ 16..=31 => 1 << exp,
        _ => 0,
    }
}

/// The on-board SPI flash.
pub struct EspFlash {
    jedec_id: u32,
    capacity: u32,
}

impl EspFlash {
    pub fn new() -> Self {
        let jedec_id = unsafe { read_jedec_id() };
        Self {
            jedec_id,
            capacity: capacity_from_jedec(jedec_id),
        }
    }

    pub fn jedec_id(&self) -> u32 {
        self.jedec_id
    }
}

impl Default for EspFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashDriver for EspFlash {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn erase_sector(&mut self, sector: u32) -> Result<()> {
        check_erase(self, sector)?;
        if unsafe { rom_erase(sector) } != 0 {
            return Err(FlashError::Erase { sector });
        }
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        check_program(self, addr, data.len())?;

        let mut bounce = [0u32; BOUNCE_WORDS];
        let mut at = addr;
        for chunk in data.chunks(BOUNCE_BYTES) {
            for (word, bytes) in bounce.iter_mut().zip(chunk.chunks_exact(4)) {
                *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
            if unsafe { rom_write(at, bounce.as_ptr(), chunk.len() as u32) } != 0 {
                return Err(FlashError::Program { addr: at });
            }
            at += chunk.len() as u32;
        }
        Ok(())
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        check_read(self, addr, buf.len())?;

        let mut bounce = [0u32; BOUNCE_WORDS];
        let mut done = 0usize;
        while done < buf.len() {
            let at = addr + done as u32;
            let base = at & !3;
            let skip = (at - base) as usize;
            let n = (buf.len() - done).min(BOUNCE_BYTES - skip);
            let span = (skip + n + 3) & !3;

            if unsafe { rom_read(base, bounce.as_mut_ptr(), span as u32) } != 0 {
                return Err(FlashError::Read { addr: at });
            }
            for (i, byte) in buf[done..done + n].iter_mut().enumerate() {
                let idx = skip + i;
                *byte = (bounce[idx / 4] >> (8 * (idx % 4))) as u8;
            }
            done += n;
        }
        Ok(())
    }

    fn feed_watchdog(&mut self) {
        board::feed_watchdog();
    }
}
