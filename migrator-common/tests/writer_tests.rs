// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Tests for the sector-aligned flash writer against simulated flash.

use migrator_common::sim::{FlashOp, SimFlash};
use migrator_common::writer::{erase_region, SectorWriter, StagingPool, WriterError, STAGING_BUFFER_SIZE};
use migrator_common::{FlashDriver, SECTOR_SIZE};

const CAPACITY: u32 = 16 * SECTOR_SIZE;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

fn write_all(flash: &mut SimFlash, start: u32, data: &[u8], chunk: usize) {
    let pool = StagingPool::new();
    let mut writer = SectorWriter::begin(flash, &pool, data.len(), start).unwrap();
    for piece in data.chunks(chunk) {
        assert_eq!(writer.write(piece), piece.len());
    }
    writer.end().unwrap();
}

#[test]
fn test_readback_for_assorted_lengths_and_offsets() {
    for &start in &[0u32, 4, 0x1000, 0x1FFC, 0x2200] {
        for &len in &[1usize, 3, 4, 511, 512, 513, 4095, 4096, 4097, 9000] {
            let mut flash = SimFlash::new(CAPACITY);
            let data = pattern(len);
            write_all(&mut flash, start, &data, 300);

            assert_eq!(flash.slice(start, len), &data[..], "start {start:#x} len {len}");

            // Padding up to the next word is erased-value; nothing else is touched.
            let padded = (len + 3) & !3;
            assert!(flash.slice(start + len as u32, padded - len).iter().all(|&b| b == 0xFF));
        }
    }
}

#[test]
fn test_4100_bytes_from_zero_erase_two_sectors() {
    let mut flash = SimFlash::new(CAPACITY);
    let data = pattern(4100);
    write_all(&mut flash, 0, &data, 512);

    assert_eq!(flash.erased_sectors(), vec![0, 1]);
    assert_eq!(flash.slice(0, 4100), &data[..]);

    // No program straddles the sector boundary.
    for op in flash.mutations() {
        if let FlashOp::Program { addr, len } = op {
            let last = addr + len as u32 - 1;
            assert_eq!(addr / SECTOR_SIZE, last / SECTOR_SIZE, "program {addr:#x}+{len}");
        }
    }
    assert!(flash
        .mutations()
        .contains(&FlashOp::Program { addr: 0x1000, len: 4 }));
}

#[test]
fn test_each_sector_erased_once_right_before_first_program() {
    let mut flash = SimFlash::new(CAPACITY);
    let data = pattern(3 * SECTOR_SIZE as usize + 100);
    write_all(&mut flash, 0, &data, 97);

    let mut seen_erase = Vec::new();
    let mut last_erase: Option<u32> = None;
    for op in flash.mutations() {
        match op {
            FlashOp::Erase { sector } => {
                assert!(!seen_erase.contains(&sector), "sector {sector} erased twice");
                seen_erase.push(sector);
                last_erase = Some(sector);
            }
            FlashOp::Program { addr, .. } => {
                let sector = addr / SECTOR_SIZE;
                assert!(seen_erase.contains(&sector), "program before erase of {sector}");
                if addr % SECTOR_SIZE == 0 {
                    assert_eq!(last_erase, Some(sector));
                }
            }
            _ => {}
        }
    }
    assert_eq!(seen_erase, vec![0, 1, 2, 3]);
    for sector in 0..4 {
        assert_eq!(flash.erase_count(sector), 1);
    }
}

#[test]
fn test_begin_does_not_erase() {
    let mut flash = SimFlash::new(CAPACITY);
    let pool = StagingPool::new();
    let writer = SectorWriter::begin(&mut flash, &pool, 8192, 0).unwrap();
    drop(writer);
    assert!(flash.mutations().is_empty());
}

#[test]
fn test_end_on_empty_buffer_is_noop() {
    let mut flash = SimFlash::new(CAPACITY);
    let pool = StagingPool::new();
    let mut writer = SectorWriter::begin(&mut flash, &pool, 0, 0).unwrap();
    assert_eq!(writer.end(), Ok(()));
    assert_eq!(writer.end(), Ok(()));
    drop(writer);
    assert!(flash.mutations().is_empty());
}

#[test]
fn test_full_buffer_at_sector_boundary_flushes_once() {
    let mut flash = SimFlash::new(CAPACITY);
    let pool = StagingPool::new();
    let start = SECTOR_SIZE - STAGING_BUFFER_SIZE as u32;
    let data = pattern(STAGING_BUFFER_SIZE);

    let mut writer = SectorWriter::begin(&mut flash, &pool, data.len(), start).unwrap();
    assert_eq!(writer.write(&data), data.len());
    writer.end().unwrap();
    drop(writer);

    assert_eq!(
        flash.mutations(),
        vec![FlashOp::Program {
            addr: start,
            len: STAGING_BUFFER_SIZE
        }]
    );
}

#[test]
fn test_second_write_after_full_buffer_flushes_first() {
    let mut flash = SimFlash::new(CAPACITY);
    let pool = StagingPool::new();
    let data = pattern(STAGING_BUFFER_SIZE + 8);

    let mut writer = SectorWriter::begin(&mut flash, &pool, data.len(), 0).unwrap();
    writer.write(&data[..STAGING_BUFFER_SIZE]);
    assert_eq!(writer.pending(), STAGING_BUFFER_SIZE);
    writer.write(&data[STAGING_BUFFER_SIZE..]);
    assert_eq!(writer.pending(), 8);
    writer.end().unwrap();
    drop(writer);

    assert_eq!(
        flash.mutations(),
        vec![
            FlashOp::Erase { sector: 0 },
            FlashOp::Program { addr: 0, len: STAGING_BUFFER_SIZE },
            FlashOp::Program {
                addr: STAGING_BUFFER_SIZE as u32,
                len: 8
            },
        ]
    );
}

#[test]
fn test_erase_failure_poisons_writer() {
    let mut flash = SimFlash::new(CAPACITY);
    flash.fail_erase_at(1);
    let pool = StagingPool::new();
    let data = pattern(3 * SECTOR_SIZE as usize);

    let mut writer = SectorWriter::begin(&mut flash, &pool, data.len(), 0).unwrap();
    let consumed = writer.write(&data);
    assert!(consumed < data.len());
    // Sector 0 plus the buffer that was waiting for sector 1.
    assert_eq!(consumed, SECTOR_SIZE as usize + STAGING_BUFFER_SIZE);
    assert_eq!(writer.error(), Some(WriterError::Erase { sector: 1 }));
    assert_eq!(writer.error().map(|e| e.code()), Some(2));

    assert_eq!(writer.write(&data[consumed..]), 0);
    assert_eq!(writer.write(&[1, 2, 3]), 0);
    assert_eq!(writer.end(), Err(WriterError::Erase { sector: 1 }));
    assert_eq!(writer.error(), Some(WriterError::Erase { sector: 1 }));
    drop(writer);

    assert_eq!(flash.erased_sectors(), vec![0, 1]);
}

#[test]
fn test_program_failure_is_sticky() {
    let mut flash = SimFlash::new(CAPACITY);
    flash.fail_program_at(0x10);
    let pool = StagingPool::new();

    let mut writer = SectorWriter::begin(&mut flash, &pool, 100, 0).unwrap();
    assert_eq!(writer.write(&pattern(100)), 100);
    assert_eq!(writer.end(), Err(WriterError::Program { addr: 0 }));
    assert_eq!(writer.write(&[0]), 0);
}

#[test]
fn test_second_claim_fails_with_alloc() {
    let mut a = SimFlash::new(CAPACITY);
    let mut b = SimFlash::new(CAPACITY);
    let pool = StagingPool::new();

    let first = SectorWriter::begin(&mut a, &pool, 10, 0).unwrap();
    assert!(pool.is_claimed());
    assert_eq!(
        SectorWriter::begin(&mut b, &pool, 10, 0).err(),
        Some(WriterError::Alloc)
    );
    drop(first);
    assert!(!pool.is_claimed());
    assert!(SectorWriter::begin(&mut b, &pool, 10, 0).is_ok());
}

#[test]
fn test_misaligned_start_rejected() {
    let mut flash = SimFlash::new(CAPACITY);
    let pool = StagingPool::new();
    assert_eq!(
        SectorWriter::begin(&mut flash, &pool, 10, 2).err(),
        Some(WriterError::Misaligned { addr: 2 })
    );
    assert!(!pool.is_claimed());
}

#[test]
fn test_transfer_past_end_of_flash_rejected() {
    let mut flash = SimFlash::new(CAPACITY);
    let pool = StagingPool::new();
    assert_eq!(
        SectorWriter::begin(&mut flash, &pool, 16, u32::MAX - 3).err(),
        Some(WriterError::OutOfBounds { addr: u32::MAX - 3 })
    );
    assert_eq!(
        SectorWriter::begin(&mut flash, &pool, 5, CAPACITY - 4).err(),
        Some(WriterError::OutOfBounds { addr: CAPACITY - 4 })
    );
    assert!(!pool.is_claimed());

    // Exactly up to the last byte is fine.
    let mut writer = SectorWriter::begin(&mut flash, &pool, 4, CAPACITY - 4).unwrap();
    assert_eq!(writer.write(&[1, 2, 3, 4]), 4);
    writer.end().unwrap();
    drop(writer);
    assert_eq!(flash.slice(CAPACITY - 4, 4), &[1, 2, 3, 4]);
}

#[test]
fn test_position_tracks_unpadded_length() {
    let mut flash = SimFlash::new(CAPACITY);
    let pool = StagingPool::new();
    let mut writer = SectorWriter::begin(&mut flash, &pool, 7, 0x100).unwrap();
    writer.write(&[1, 2, 3]);
    writer.write(&[4, 5, 6, 7]);
    assert_eq!(writer.position(), 0x107);
    assert_eq!(writer.accepted(), 7);
    assert_eq!(writer.expected_len(), 7);
    writer.end().unwrap();
    assert_eq!(writer.position(), 0x107);
}

#[test]
fn test_watchdog_fed_around_flash_operations() {
    let mut flash = SimFlash::new(CAPACITY);
    write_all(&mut flash, 0, &pattern(1000), 1000);
    // One erase (before and after) plus two programs.
    assert_eq!(flash.watchdog_feeds(), 4);
}

#[test]
fn test_erase_region_erases_each_sector_once() {
    let mut flash = SimFlash::new(CAPACITY);
    flash.preload(0x2000, &[0u8; 3 * SECTOR_SIZE as usize]);
    let pool = StagingPool::new();

    erase_region(&mut flash, &pool, 0x2000, 3 * SECTOR_SIZE as usize).unwrap();

    assert_eq!(flash.erased_sectors(), vec![2, 3, 4]);
    assert!(flash
        .slice(0x2000, 3 * SECTOR_SIZE as usize)
        .iter()
        .all(|&b| b == 0xFF));
    assert_eq!(FlashDriver::capacity(&flash), CAPACITY);
}
