// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Flash geometry and the fixed address map of the migration.
//!
//! ```text
//! 0x000000 +---------------------------+
//!          | boot region (8 sectors)   |  overwritten last, by the installer
//! 0x008000 +---------------------------+
//!          | partition table           |
//! 0x020000 +---------------------------+
//!          | OTA slot A: finisher      |  stage 2 runs from here
//! 0x100000 +- - - - - - - - - - - - - -+
//!          | staged bootloader         |
//! 0x110000 | staged partition table    |
//! 0x120000 | staged application        |
//! 0x1B0000 +---------------------------+
//!          | OTA slot B                |  final application destination
//! 0x340000 +---------------------------+
//!          | ...                       |
//! 0x3F0000 | migration record slot 0   |
//! 0x3F1000 | migration record slot 1   |
//! 0x400000 +---------------------------+
//! ```

use serde::{Deserialize, Serialize};

/// Smallest erasable unit of the NOR flash.
pub const SECTOR_SIZE: u32 = 4096;
/// Program address and length granularity.
pub const PROGRAM_ALIGN: usize = 4;
/// Value every byte of a sector holds after erase.
pub const ERASED_BYTE: u8 = 0xFF;

/// Round `len` up to the next multiple of `align` (a power of two).
#[inline(always)]
pub const fn align_up(len: usize, align: usize) -> usize {
    (len + align - 1) & !(align - 1)
}

/// Index of the sector containing `addr`.
#[inline(always)]
pub const fn sector_of(addr: u32) -> u32 {
    addr / SECTOR_SIZE
}

pub const fn is_sector_aligned(addr: u32) -> bool {
    addr % SECTOR_SIZE == 0
}

/// The images moved by the migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageKind {
    /// Second-stage bootloader that ends up at the start of flash.
    Bootloader,
    /// Partition table read by that bootloader.
    PartitionTable,
    /// Application image for the alternate OTA slot.
    App,
    /// Small stage 2 finisher written straight into OTA slot A.
    Finisher,
}

impl ImageKind {
    /// Images downloaded by stage 1, in download order.
    pub const STAGE1_ORDER: [ImageKind; 4] = [
        ImageKind::Bootloader,
        ImageKind::PartitionTable,
        ImageKind::App,
        ImageKind::Finisher,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ImageKind::Bootloader => "bootloader",
            ImageKind::PartitionTable => "partition table",
            ImageKind::App => "application",
            ImageKind::Finisher => "stage 2 finisher",
        }
    }
}

/// A contiguous byte range of flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Region {
    pub start: u32,
    pub len: u32,
}

impl Region {
    pub const fn new(start: u32, len: u32) -> Self {
        Self { start, len }
    }

    pub const fn end(&self) -> u32 {
        self.start + self.len
    }

    pub const fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub const fn overlaps(&self, other: &Region) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Number of sectors this region touches.
    pub const fn sector_count(&self) -> u32 {
        if self.len == 0 {
            return 0;
        }
        sector_of(self.end() - 1) - sector_of(self.start) + 1
    }
}

/// Every address the migration touches, as one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashLayout {
    /// Flash capacity the migration is built for.
    pub expected_capacity: u32,
    /// Region holding the first-stage boot code, overwritten last.
    pub boot_region: Region,
    /// Final partition table location.
    pub partition_table: Region,
    pub ota_a: Region,
    pub ota_b: Region,
    /// Head of OTA slot A that the finisher may occupy; the staging area
    /// starts right after it.
    pub finisher: Region,
    /// Scratch area stage 1 downloads into.
    pub staging_base: u32,
    pub staging_bootloader: Region,
    pub staging_partition_table: Region,
    pub staging_app: Region,
    /// Two alternating sectors for the migration record.
    pub record_slots: [u32; 2],
}

impl FlashLayout {
    /// 4 MiB ESP8266 moving to the IDF OTA layout.
    pub const ESP8266_4M: FlashLayout = FlashLayout {
        expected_capacity: 4 * 1024 * 1024,
        boot_region: Region::new(0x0000, 8 * SECTOR_SIZE),
        partition_table: Region::new(0x8000, SECTOR_SIZE),
        ota_a: Region::new(0x2_0000, 0x19_0000),
        ota_b: Region::new(0x1B_0000, 0x19_0000),
        finisher: Region::new(0x2_0000, 0x10_0000 - 0x2_0000),
        staging_base: 0x10_0000,
        staging_bootloader: Region::new(0x10_0000, 32 * 1024),
        staging_partition_table: Region::new(0x11_0000, SECTOR_SIZE),
        staging_app: Region::new(0x12_0000, 0x1B_0000 - 0x12_0000),
        record_slots: [0x3F_0000, 0x3F_1000],
    };

    /// Where stage 1 puts an image, and how large it may be.
    pub fn stage1_target(&self, kind: ImageKind) -> Region {
        match kind {
            ImageKind::Bootloader => self.staging_bootloader,
            ImageKind::PartitionTable => self.staging_partition_table,
            ImageKind::App => self.staging_app,
            ImageKind::Finisher => self.finisher,
        }
    }

    /// The OTA slot stage 2 installs the application into: whichever slot
    /// does not contain `running_addr`.
    pub fn other_ota_slot(&self, running_addr: u32) -> Option<Region> {
        if self.ota_a.contains(running_addr) {
            Some(self.ota_b)
        } else if self.ota_b.contains(running_addr) {
            Some(self.ota_a)
        } else {
            None
        }
    }
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self::ESP8266_4M
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_matches_address_map() {
        let l = FlashLayout::ESP8266_4M;
        assert_eq!(l.boot_region.sector_count(), 8);
        assert_eq!(l.partition_table.start, 0x8000);
        assert_eq!(l.ota_a.start, 0x20000);
        assert_eq!(l.ota_b.start, 0x1B0000);
        assert_eq!(l.staging_partition_table.start, l.staging_base + 0x10000);
        assert_eq!(l.staging_app.start, l.staging_base + 0x20000);
        assert_eq!(l.staging_app.end(), l.ota_b.start);
        assert_eq!(l.finisher.end(), l.staging_base);
    }

    #[test]
    fn test_staging_is_clear_of_live_regions() {
        let l = FlashLayout::ESP8266_4M;
        for staged in [l.staging_bootloader, l.staging_partition_table, l.staging_app] {
            assert!(!staged.overlaps(&l.boot_region));
            assert!(!staged.overlaps(&l.partition_table));
            assert!(!staged.overlaps(&l.ota_b));
            assert!(!staged.overlaps(&l.finisher));
        }
    }

    #[test]
    fn test_other_ota_slot() {
        let l = FlashLayout::ESP8266_4M;
        assert_eq!(l.other_ota_slot(0x20000), Some(l.ota_b));
        assert_eq!(l.other_ota_slot(0x1B1000), Some(l.ota_a));
        assert_eq!(l.other_ota_slot(0x0), None);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(4097, 4), 4100);
    }
}
