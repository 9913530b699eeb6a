// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Sector-aligned buffered flash writer.
//!
//! Turns an arbitrary-length byte stream into erase/program operations:
//! - bytes are staged in a 512-byte buffer that never spans a sector boundary
//! - the buffer is flushed when full or when the next byte would start a new
//!   sector
//! - a sector is erased right before its first byte is programmed, and only
//!   then, so each sector touched is erased exactly once
//! - the final partial buffer is padded with erased-value bytes up to the
//!   4-byte program granularity by [`SectorWriter::end`]
//!
//! Any erase or program failure poisons the writer: the error sticks, every
//! later `write` consumes nothing, and the transfer has to be restarted from
//! [`SectorWriter::begin`].

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::flash::FlashDriver;
use crate::layout::{align_up, sector_of, ERASED_BYTE, PROGRAM_ALIGN, SECTOR_SIZE};

/// Size of the staging buffer, independent of the transfer size.
pub const STAGING_BUFFER_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriterError {
    /// The staging buffer is already held by another writer.
    Alloc,
    /// Start address is not on the 4-byte program granularity.
    Misaligned { addr: u32 },
    /// The transfer does not fit between `addr` and the end of the flash.
    OutOfBounds { addr: u32 },
    /// Sector erase failed.
    Erase { sector: u32 },
    /// Programming a buffer failed.
    Program { addr: u32 },
}

impl WriterError {
    /// Numeric code, stable across builds, for log lines and blink codes.
    pub fn code(&self) -> u8 {
        match self {
            WriterError::Alloc => 1,
            WriterError::Erase { .. } => 2,
            WriterError::Program { .. } => 3,
            WriterError::Misaligned { .. } => 4,
            WriterError::OutOfBounds { .. } => 5,
        }
    }
}

impl fmt::Display for WriterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriterError::Alloc => write!(f, "staging buffer unavailable"),
            WriterError::Misaligned { addr } => {
                write!(f, "start address 0x{:06x} is not 4-byte aligned", addr)
            }
            WriterError::OutOfBounds { addr } => {
                write!(f, "transfer at 0x{:06x} runs past the end of the flash", addr)
            }
            WriterError::Erase { sector } => write!(f, "failed to erase sector {}", sector),
            WriterError::Program { addr } => write!(f, "failed to program at 0x{:06x}", addr),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for WriterError {}

/// Holder of the one staging buffer a writer may use at a time.
///
/// Lives in a `static` on the device. Claiming it twice without releasing
/// fails, which is how a writer reports an allocation error.
pub struct StagingPool {
    buf: UnsafeCell<[u8; STAGING_BUFFER_SIZE]>,
    taken: AtomicBool,
}

// SAFETY: the buffer is only reachable through a `StagingBuf`, and `claim`
// hands out at most one of those at a time. The load/store pair in `claim`
// is not atomic as a whole; that is fine on the single foreground task this
// runs on (the ESP8266 has no compare-and-swap).
unsafe impl Sync for StagingPool {}

impl StagingPool {
    pub const fn new() -> Self {
        Self {
            buf: UnsafeCell::new([0u8; STAGING_BUFFER_SIZE]),
            taken: AtomicBool::new(false),
        }
    }

    /// Take the buffer, or `None` if a writer already holds it.
    pub fn claim(&self) -> Option<StagingBuf<'_>> {
        if self.taken.load(Ordering::Acquire) {
            return None;
        }
        self.taken.store(true, Ordering::Release);
        // SAFETY: `taken` was clear, so no other reference to the buffer exists.
        let buf = unsafe { &mut *self.buf.get() };
        Some(StagingBuf {
            buf,
            taken: &self.taken,
        })
    }

    pub fn is_claimed(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }
}

impl Default for StagingPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive handle on the staging buffer. Released on drop.
pub struct StagingBuf<'a> {
    buf: &'a mut [u8; STAGING_BUFFER_SIZE],
    taken: &'a AtomicBool,
}

impl Deref for StagingBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..]
    }
}

impl DerefMut for StagingBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }
}

impl Drop for StagingBuf<'_> {
    fn drop(&mut self) {
        self.taken.store(false, Ordering::Release);
    }
}

/// Write cursor over one flash transfer.
///
/// Owned by a single transfer. Dropping it without calling
/// [`end`](Self::end) discards whatever is still buffered.
pub struct SectorWriter<'a, F: FlashDriver> {
    flash: &'a mut F,
    buf: StagingBuf<'a>,
    buf_len: usize,
    start: u32,
    cursor: u32,
    expected_len: usize,
    error: Option<WriterError>,
}

impl<'a, F: FlashDriver> SectorWriter<'a, F> {
    /// Start a transfer of `total_size` bytes at `start`.
    ///
    /// Nothing is erased here; erasing happens lazily as sectors are reached.
    /// A `start` that is not sector aligned means the first, partial sector is
    /// programmed without being erased, so the caller must know it is blank.
    pub fn begin(
        flash: &'a mut F,
        pool: &'a StagingPool,
        total_size: usize,
        start: u32,
    ) -> Result<Self, WriterError> {
        if start as usize % PROGRAM_ALIGN != 0 {
            return Err(WriterError::Misaligned { addr: start });
        }
        let end = start as u64 + align_up(total_size, PROGRAM_ALIGN) as u64;
        if end > flash.capacity() as u64 {
            return Err(WriterError::OutOfBounds { addr: start });
        }
        let buf = pool.claim().ok_or(WriterError::Alloc)?;
        Ok(Self {
            flash,
            buf,
            buf_len: 0,
            start,
            cursor: start,
            expected_len: total_size,
            error: None,
        })
    }

    /// Queue `data` for writing and return how many bytes were consumed.
    ///
    /// Fewer than `data.len()` bytes are consumed only when a flush fails;
    /// from then on the writer is poisoned and consumes nothing.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if self.error.is_some() {
            return 0;
        }

        let mut written = 0;
        while written < data.len() {
            let next = self.cursor + self.buf_len as u32;
            if self.buf_len == STAGING_BUFFER_SIZE
                || (self.buf_len > 0 && next % SECTOR_SIZE == 0)
            {
                if self.flush().is_err() {
                    return written;
                }
            }

            let next = self.cursor + self.buf_len as u32;
            let until_sector_end = (SECTOR_SIZE - next % SECTOR_SIZE) as usize;
            let n = (STAGING_BUFFER_SIZE - self.buf_len)
                .min(until_sector_end)
                .min(data.len() - written);

            self.buf[self.buf_len..self.buf_len + n].copy_from_slice(&data[written..written + n]);
            self.buf_len += n;
            written += n;
        }
        written
    }

    /// Flush the buffered remainder, padded to the program granularity.
    ///
    /// Must be called once all data is written. With nothing buffered this is
    /// a no-op that succeeds.
    pub fn end(&mut self) -> Result<(), WriterError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.flush()
    }

    /// The sticky error, if any operation has failed.
    pub fn error(&self) -> Option<WriterError> {
        self.error
    }

    /// Address the next flushed byte lands at.
    pub fn position(&self) -> u32 {
        self.cursor + self.buf_len as u32
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    /// Bytes accepted so far, flushed or not.
    pub fn accepted(&self) -> usize {
        (self.position() - self.start) as usize
    }

    /// Size declared at `begin`.
    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    /// Bytes still buffered and not yet on flash.
    pub fn pending(&self) -> usize {
        self.buf_len
    }

    /// The underlying driver, for reading regions that do not overlap the
    /// one being written.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut *self.flash
    }

    fn fail(&mut self, e: WriterError) -> WriterError {
        self.error = Some(e);
        e
    }

    fn flush(&mut self) -> Result<(), WriterError> {
        if self.buf_len == 0 {
            return Ok(());
        }

        if self.cursor % SECTOR_SIZE == 0 {
            let sector = sector_of(self.cursor);
            debug!("Erasing sector {} at 0x{:06x}", sector, self.cursor);

            self.flash.feed_watchdog();
            let erased = self.flash.erase_sector(sector);
            self.flash.feed_watchdog();

            if let Err(e) = erased {
                error!("Erase of sector {} failed: {}", sector, e);
                return Err(self.fail(WriterError::Erase { sector }));
            }
        }

        let aligned = align_up(self.buf_len, PROGRAM_ALIGN);
        self.buf[self.buf_len..aligned].fill(ERASED_BYTE);

        let addr = self.cursor;
        let programmed = self.flash.program(addr, &self.buf[..aligned]);
        self.flash.feed_watchdog();
        if let Err(e) = programmed {
            error!("Program at 0x{:06x} failed: {}", addr, e);
            return Err(self.fail(WriterError::Program { addr }));
        }

        // Advance by the unpadded length; padding only ever happens on the
        // final flush.
        self.cursor += self.buf_len as u32;
        self.buf_len = 0;
        Ok(())
    }
}

/// Erase `len` bytes starting at `start` by streaming erased-value bytes
/// through a writer, so each sector is erased once.
pub fn erase_region<F: FlashDriver>(
    flash: &mut F,
    pool: &StagingPool,
    start: u32,
    len: usize,
) -> Result<(), WriterError> {
    let fill = [ERASED_BYTE; STAGING_BUFFER_SIZE];
    let mut writer = SectorWriter::begin(flash, pool, len, start)?;
    let mut done = 0;
    while done < len {
        let n = (len - done).min(fill.len());
        if writer.write(&fill[..n]) != n {
            return Err(writer.error().unwrap_or(WriterError::Program { addr: writer.position() }));
        }
        done += n;
    }
    writer.end()
}

