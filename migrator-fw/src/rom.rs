// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! ESP8266 mask ROM routines. Addresses come from `rom_functions.x`.
//!
//! The SPI routines access the flash chip directly and need the flash cache
//! disabled while they run. Everything here lives in ROM and stays callable
//! with the cache off.

#[allow(non_snake_case)]
unsafe extern "C" {
    /// Erase one 4 KiB sector. Returns 0 on success.
    pub fn SPIEraseSector(sector: u32) -> i32;
    /// Program `len` bytes from word-aligned `src`. Returns 0 on success.
    pub fn SPIWrite(addr: u32, src: *const u32, len: u32) -> i32;
    /// Read `len` bytes into word-aligned `dst`. Returns 0 on success.
    pub fn SPIRead(addr: u32, dst: *mut u32, len: u32) -> i32;
    pub fn Cache_Read_Disable();
    pub fn Cache_Read_Enable(odd_even: u8, mb_count: u8, unknown: u8);
    pub fn ets_delay_us(us: u32);
    pub fn uart_tx_one_char(c: u8) -> i32;
}

/// ROM reset vector; jumping here restarts the chip.
const RESET_VECTOR: usize = 0x4000_0080;

/// Re-enable the cache with the first flash megabyte mapped, as the ROM
/// loader leaves it.
#[inline(always)]
pub unsafe fn cache_enable() {
    Cache_Read_Enable(0, 0, 1);
}

/// Restart the chip through the ROM reset vector.
#[inline(always)]
pub unsafe fn restart() -> ! {
    let reset: extern "C" fn() -> ! = core::mem::transmute(RESET_VECTOR);
    reset()
}
