// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Persisted migration progress.
//!
//! The record lives in two fixed sectors used alternately: record `n` goes to
//! slot `n % 2`. A write tears at most the slot being written, so the previous
//! record stays readable and the reader takes the newest valid one.
//!
//! Slot format (little-endian):
//!
//! ```text
//! magic: u32 | len: u16 | postcard payload (len bytes) | crc32: u32
//! ```
//!
//! The CRC (ISO-HDLC) covers magic, length, and payload.

use core::fmt;

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};

use crate::flash::{FlashDriver, FlashError};
use crate::layout::{align_up, sector_of, FlashLayout, ImageKind, ERASED_BYTE, PROGRAM_ALIGN};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// "MIGR"
pub const RECORD_MAGIC: u32 = 0x4D49_4752;
/// Upper bound on an encoded slot, header and CRC included.
pub const RECORD_SLOT_BYTES: usize = 64;
const HEADER_LEN: usize = 6;
const CRC_LEN: usize = 4;

/// Which binary owns the migration right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stage {
    /// Stage 1: downloading into the staging area.
    Staging,
    /// Stage 2: copying to final locations and installing the boot region.
    Finishing,
}

/// Steps in completion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    Started,
    BootloaderStaged,
    PartitionTableStaged,
    AppStaged,
    FinisherWritten,
    PartitionTableInstalled,
    AppInstalled,
    /// Written right before the installer runs; the boot region may be torn
    /// from here on.
    BootRegionInstalling,
}

impl Step {
    /// Step recorded once stage 1 has written `kind`.
    pub fn staged(kind: ImageKind) -> Step {
        match kind {
            ImageKind::Bootloader => Step::BootloaderStaged,
            ImageKind::PartitionTable => Step::PartitionTableStaged,
            ImageKind::App => Step::AppStaged,
            ImageKind::Finisher => Step::FinisherWritten,
        }
    }

    pub fn stage(self) -> Stage {
        if self <= Step::FinisherWritten {
            Stage::Staging
        } else {
            Stage::Finishing
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MigrationRecord {
    /// Incremented on every commit; picks the slot and the newest record.
    pub sequence: u32,
    pub stage: Stage,
    pub last_completed: Step,
    pub bootloader_len: u32,
    pub partition_len: u32,
    pub app_len: u32,
    pub finisher_len: u32,
}

impl Default for MigrationRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationRecord {
    pub const fn new() -> Self {
        Self {
            sequence: 0,
            stage: Stage::Staging,
            last_completed: Step::Started,
            bootloader_len: 0,
            partition_len: 0,
            app_len: 0,
            finisher_len: 0,
        }
    }

    /// Drop all progress and staged lengths. The sequence number is kept so
    /// the next commit still outranks both slots.
    pub fn restart(&mut self) {
        *self = Self {
            sequence: self.sequence,
            ..Self::new()
        };
    }

    pub fn is_done(&self, step: Step) -> bool {
        self.last_completed >= step
    }

    /// Mark `step` complete. Never moves backwards.
    pub fn complete(&mut self, step: Step) {
        if step > self.last_completed {
            self.last_completed = step;
            self.stage = step.stage();
        }
    }

    pub fn staged_len(&self, kind: ImageKind) -> u32 {
        match kind {
            ImageKind::Bootloader => self.bootloader_len,
            ImageKind::PartitionTable => self.partition_len,
            ImageKind::App => self.app_len,
            ImageKind::Finisher => self.finisher_len,
        }
    }

    pub fn set_staged_len(&mut self, kind: ImageKind, len: u32) {
        match kind {
            ImageKind::Bootloader => self.bootloader_len = len,
            ImageKind::PartitionTable => self.partition_len = len,
            ImageKind::App => self.app_len = len,
            ImageKind::Finisher => self.finisher_len = len,
        }
    }

    /// Encode into `buf` and return the used prefix, padded to the program
    /// granularity with erased bytes.
    pub fn encode<'b>(&self, buf: &'b mut [u8; RECORD_SLOT_BYTES]) -> Result<&'b [u8], RecordError> {
        buf.fill(ERASED_BYTE);
        let payload_len = {
            let (_, rest) = buf.split_at_mut(HEADER_LEN);
            let room = rest.len() - CRC_LEN;
            postcard::to_slice(self, &mut rest[..room])
                .map_err(|_| RecordError::Encode)?
                .len()
        };

        buf[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&(payload_len as u16).to_le_bytes());
        let body_end = HEADER_LEN + payload_len;
        let crc = CRC32.checksum(&buf[..body_end]);
        buf[body_end..body_end + CRC_LEN].copy_from_slice(&crc.to_le_bytes());

        let total = align_up(body_end + CRC_LEN, PROGRAM_ALIGN);
        Ok(&buf[..total])
    }

    /// Decode a slot image produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let header = bytes.get(..HEADER_LEN).ok_or(RecordError::Truncated)?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != RECORD_MAGIC {
            return Err(RecordError::BadMagic);
        }
        let len = u16::from_le_bytes([header[4], header[5]]) as usize;
        let body_end = HEADER_LEN + len;
        let stored = bytes
            .get(body_end..body_end + CRC_LEN)
            .ok_or(RecordError::Truncated)?;
        let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        if CRC32.checksum(&bytes[..body_end]) != stored {
            return Err(RecordError::BadCrc);
        }
        postcard::from_bytes(&bytes[HEADER_LEN..body_end]).map_err(|_| RecordError::Decode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecordError {
    /// Slot does not start with the record magic (blank or foreign data).
    BadMagic,
    BadCrc,
    Truncated,
    Encode,
    Decode,
    Flash(FlashError),
}

impl From<FlashError> for RecordError {
    fn from(e: FlashError) -> Self {
        RecordError::Flash(e)
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::BadMagic => write!(f, "no migration record"),
            RecordError::BadCrc => write!(f, "migration record CRC mismatch"),
            RecordError::Truncated => write!(f, "migration record truncated"),
            RecordError::Encode => write!(f, "migration record does not fit its slot"),
            RecordError::Decode => write!(f, "migration record payload is malformed"),
            RecordError::Flash(e) => write!(f, "migration record flash access: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RecordError {}

/// Reads and commits [`MigrationRecord`]s in the two record slots.
#[derive(Debug, Clone, Copy)]
pub struct RecordStore {
    slots: [u32; 2],
}

impl RecordStore {
    pub fn new(layout: &FlashLayout) -> Self {
        Self {
            slots: layout.record_slots,
        }
    }

    pub fn slots(&self) -> [u32; 2] {
        self.slots
    }

    /// Decode one slot.
    pub fn read_slot<F: FlashDriver + ?Sized>(
        &self,
        flash: &mut F,
        slot: usize,
    ) -> Result<MigrationRecord, RecordError> {
        let mut buf = [0u8; RECORD_SLOT_BYTES];
        flash.read(self.slots[slot % 2], &mut buf)?;
        MigrationRecord::decode(&buf)
    }

    /// The newest valid record, or `None` when neither slot holds one.
    pub fn load<F: FlashDriver + ?Sized>(&self, flash: &mut F) -> Result<Option<MigrationRecord>, RecordError> {
        let mut newest: Option<MigrationRecord> = None;
        for slot in 0..2 {
            match self.read_slot(flash, slot) {
                Ok(r) => {
                    if newest.map_or(true, |n| r.sequence > n.sequence) {
                        newest = Some(r);
                    }
                }
                Err(RecordError::Flash(e)) => return Err(RecordError::Flash(e)),
                Err(RecordError::BadMagic) => {}
                Err(e) => warn!("Record slot {} unreadable: {}", slot, e),
            }
        }
        Ok(newest)
    }

    /// Bump the sequence number and write the record to its slot.
    pub fn commit<F: FlashDriver + ?Sized>(
        &self,
        flash: &mut F,
        record: &mut MigrationRecord,
    ) -> Result<(), RecordError> {
        record.sequence = record.sequence.wrapping_add(1);
        let addr = self.slots[(record.sequence % 2) as usize];

        let mut buf = [0u8; RECORD_SLOT_BYTES];
        let bytes = record.encode(&mut buf)?;

        flash.feed_watchdog();
        flash.erase_sector(sector_of(addr))?;
        flash.program(addr, bytes)?;
        flash.feed_watchdog();

        debug!(
            "Record {} committed at 0x{:06x}: step {}",
            record.sequence,
            addr,
            record.last_completed as u8
        );
        Ok(())
    }

    /// Erase both slots.
    pub fn clear<F: FlashDriver + ?Sized>(&self, flash: &mut F) -> Result<(), RecordError> {
        for addr in self.slots {
            flash.erase_sector(sector_of(addr))?;
        }
        Ok(())
    }
}
