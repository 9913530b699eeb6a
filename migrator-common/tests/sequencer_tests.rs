// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Two-stage migration against simulated flash.

use std::panic::{catch_unwind, AssertUnwindSafe};

use migrator_common::image::ImageHeader;
use migrator_common::sim::{FlashOp, SimFlash};
use migrator_common::source::{AlwaysConnected, SliceSource};
use migrator_common::{
    copy_region, ErrorClass, FlashLayout, ImageError, ImageKind, ImageSource, MigrationError, Migrator, Milestone,
    Network, ProgressSink, Region, Stage, StagingPool, Step, TransportError, IMAGE_MAGIC,
};

const STAGE1_RUNNING: Region = Region::new(0x1000, 0x1_E000);
const STAGE2_RUNNING_ADDR: u32 = 0x2_0010;

struct Images {
    bootloader: Vec<u8>,
    partition_table: Vec<u8>,
    app: Vec<u8>,
    finisher: Vec<u8>,
}

impl Images {
    fn new() -> Self {
        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            segment_count: 1,
            spi_mode: 0,
            spi_speed_size: 0x40,
            entry_addr: 0x4010_0000,
        };
        let mut bootloader = header.to_bytes().to_vec();
        bootloader.extend_from_slice(&0x4010_0000u32.to_le_bytes());
        bootloader.extend_from_slice(&4000u32.to_le_bytes());
        bootloader.extend((0..4000u32).map(|i| (i % 251) as u8));

        Self {
            bootloader,
            partition_table: vec![0xAA; 0xC00],
            app: (0..70_000u32).map(|i| (i * 13) as u8).collect(),
            finisher: (0..9_000u32).map(|i| (i * 5 + 1) as u8).collect(),
        }
    }

    fn source(&self) -> SliceSource<'_> {
        SliceSource::new()
            .with(ImageKind::Bootloader, &self.bootloader)
            .with(ImageKind::PartitionTable, &self.partition_table)
            .with(ImageKind::App, &self.app)
            .with(ImageKind::Finisher, &self.finisher)
            .chunked(300)
    }
}

/// Counts `open` calls per image.
struct CountingSource<S> {
    inner: S,
    opened: Vec<ImageKind>,
}

impl<S: ImageSource> ImageSource for CountingSource<S> {
    fn open(&mut self, kind: ImageKind) -> Result<u32, TransportError> {
        self.opened.push(kind);
        self.inner.open(kind)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.inner.read(buf)
    }
}

/// Declares more bytes than it delivers.
struct ShortSource;

impl ImageSource for ShortSource {
    fn open(&mut self, _kind: ImageKind) -> Result<u32, TransportError> {
        Ok(2000)
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(0)
    }
}

struct NoNetwork;

impl Network for NoNetwork {
    fn connect(&mut self) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }
}

#[derive(Default)]
struct Recorder {
    milestones: Vec<Milestone>,
    bytes: Vec<(ImageKind, u32, u32)>,
}

impl ProgressSink for Recorder {
    fn milestone(&mut self, milestone: Milestone) {
        self.milestones.push(milestone);
    }

    fn bytes(&mut self, kind: ImageKind, done: u32, total: u32) {
        self.bytes.push((kind, done, total));
    }
}

fn layout() -> FlashLayout {
    FlashLayout::ESP8266_4M
}

fn blank_flash() -> SimFlash {
    SimFlash::new(4 * 1024 * 1024)
}

fn run_stage1(flash: &mut SimFlash, images: &Images) -> Result<migrator_common::MigrationRecord, MigrationError> {
    let layout = layout();
    let pool = StagingPool::new();
    let mut source = images.source();
    let mut migrator = Migrator::new(flash, &pool, &layout);
    migrator.run_stage1(STAGE1_RUNNING, &mut AlwaysConnected, &mut source, &mut ())
}

#[test]
fn test_stage1_stages_every_image() {
    let images = Images::new();
    let mut flash = blank_flash();
    let layout = layout();

    let record = run_stage1(&mut flash, &images).unwrap();

    assert_eq!(record.last_completed, Step::FinisherWritten);
    assert_eq!(record.stage, Stage::Staging);
    assert_eq!(record.bootloader_len as usize, images.bootloader.len());
    assert_eq!(record.partition_len as usize, images.partition_table.len());
    assert_eq!(record.app_len as usize, images.app.len());
    assert_eq!(record.finisher_len as usize, images.finisher.len());

    assert_eq!(
        flash.slice(layout.staging_bootloader.start, images.bootloader.len()),
        &images.bootloader[..]
    );
    assert_eq!(
        flash.slice(layout.staging_partition_table.start, images.partition_table.len()),
        &images.partition_table[..]
    );
    assert_eq!(flash.slice(layout.staging_app.start, images.app.len()), &images.app[..]);
    assert_eq!(flash.slice(layout.finisher.start, images.finisher.len()), &images.finisher[..]);

    // The running image and the live boot chain are untouched.
    assert!(flash.slice(0, 0x2_0000).iter().all(|&b| b == 0xFF));
    for op in flash.mutations() {
        if let FlashOp::Program { addr, .. } = op {
            assert!(!STAGE1_RUNNING.contains(addr));
        }
    }
}

#[test]
fn test_stage1_reports_milestones_and_progress() {
    let images = Images::new();
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();
    let mut progress = Recorder::default();

    Migrator::new(&mut flash, &pool, &layout)
        .run_stage1(STAGE1_RUNNING, &mut AlwaysConnected, &mut images.source(), &mut progress)
        .unwrap();

    assert_eq!(
        progress.milestones,
        vec![
            Milestone::FlashChecked,
            Milestone::NetworkUp,
            Milestone::DataPartitionsSkipped,
            Milestone::ImageStaged(ImageKind::Bootloader),
            Milestone::ImageStaged(ImageKind::PartitionTable),
            Milestone::ImageStaged(ImageKind::App),
            Milestone::ImageStaged(ImageKind::Finisher),
        ]
    );
    let app_total = images.app.len() as u32;
    assert!(progress.bytes.contains(&(ImageKind::App, app_total, app_total)));
    assert!(progress
        .bytes
        .iter()
        .filter(|(kind, _, _)| *kind == ImageKind::App)
        .all(|&(_, done, total)| done <= total));
}

#[test]
fn test_stage1_rejects_wrong_flash_size() {
    let images = Images::new();
    let mut flash = SimFlash::new(1024 * 1024);

    let err = run_stage1(&mut flash, &images).unwrap_err();

    assert_eq!(
        err,
        MigrationError::FlashSize {
            detected: 1024 * 1024,
            expected: 4 * 1024 * 1024
        }
    );
    assert_eq!(err.class(), ErrorClass::Validation);
    assert!(flash.mutations().is_empty());
}

#[test]
fn test_stage1_refuses_to_write_over_running_code() {
    let images = Images::new();
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();

    let err = Migrator::new(&mut flash, &pool, &layout)
        .run_stage1(
            Region::new(0x1000, 0x4_0000),
            &mut AlwaysConnected,
            &mut images.source(),
            &mut (),
        )
        .unwrap_err();

    assert_eq!(
        err,
        MigrationError::RunningImageOverlap {
            kind: ImageKind::Finisher
        }
    );
    assert!(flash.mutations().is_empty());
}

#[test]
fn test_stage1_network_failure_touches_nothing() {
    let images = Images::new();
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();

    let err = Migrator::new(&mut flash, &pool, &layout)
        .run_stage1(STAGE1_RUNNING, &mut NoNetwork, &mut images.source(), &mut ())
        .unwrap_err();

    assert_eq!(
        err,
        MigrationError::Transport {
            kind: None,
            error: TransportError::NotConnected
        }
    );
    assert_eq!(err.class(), ErrorClass::Transport);
    assert!(err.is_retry_safe());
    assert!(flash.mutations().is_empty());
}

#[test]
fn test_stage1_incomplete_download() {
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();

    let err = Migrator::new(&mut flash, &pool, &layout)
        .run_stage1(STAGE1_RUNNING, &mut AlwaysConnected, &mut ShortSource, &mut ())
        .unwrap_err();

    assert_eq!(
        err,
        MigrationError::Transport {
            kind: Some(ImageKind::Bootloader),
            error: TransportError::Incomplete {
                received: 0,
                expected: 2000
            }
        }
    );
    assert!(err.is_retry_safe());
}

#[test]
fn test_stage1_rejects_oversized_app() {
    let mut images = Images::new();
    let layout = layout();
    images.app = vec![0x42; layout.staging_app.len as usize + 1];
    let mut flash = blank_flash();

    let err = run_stage1(&mut flash, &images).unwrap_err();

    assert_eq!(
        err,
        MigrationError::ImageTooLarge {
            kind: ImageKind::App,
            len: layout.staging_app.len + 1,
            max: layout.staging_app.len
        }
    );
    // Nothing was written into the alternate OTA slot.
    assert!(flash.slice(layout.ota_b.start, 0x1000).iter().all(|&b| b == 0xFF));
}

#[test]
fn test_stage1_rejects_bootloader_without_magic() {
    let mut images = Images::new();
    images.bootloader[0] = 0x00;
    let mut flash = blank_flash();

    let err = run_stage1(&mut flash, &images).unwrap_err();

    assert!(matches!(err, MigrationError::Image(_)));
    assert_eq!(err.class(), ErrorClass::Validation);
}

#[test]
fn test_stage1_resumes_after_last_committed_step() {
    let images = Images::new();
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();

    // First attempt: the server has no application yet.
    let mut partial = SliceSource::new()
        .with(ImageKind::Bootloader, &images.bootloader)
        .with(ImageKind::PartitionTable, &images.partition_table);
    let err = Migrator::new(&mut flash, &pool, &layout)
        .run_stage1(STAGE1_RUNNING, &mut AlwaysConnected, &mut partial, &mut ())
        .unwrap_err();
    assert_eq!(
        err,
        MigrationError::Transport {
            kind: Some(ImageKind::App),
            error: TransportError::Status(404)
        }
    );

    let mut counting = CountingSource {
        inner: images.source(),
        opened: Vec::new(),
    };
    let record = Migrator::new(&mut flash, &pool, &layout)
        .run_stage1(STAGE1_RUNNING, &mut AlwaysConnected, &mut counting, &mut ())
        .unwrap();

    assert_eq!(counting.opened, vec![ImageKind::App, ImageKind::Finisher]);
    assert_eq!(record.last_completed, Step::FinisherWritten);
    assert_eq!(record.bootloader_len as usize, images.bootloader.len());

    // A third run has nothing left to do.
    let mut counting = CountingSource {
        inner: images.source(),
        opened: Vec::new(),
    };
    Migrator::new(&mut flash, &pool, &layout)
        .run_stage1(STAGE1_RUNNING, &mut NoNetwork, &mut counting, &mut ())
        .unwrap();
    assert!(counting.opened.is_empty());
}

#[test]
fn test_stage2_copies_then_installs_boot_region() {
    let images = Images::new();
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();
    run_stage1(&mut flash, &images).unwrap();

    let mut progress = Recorder::default();
    let mut ram = vec![0u8; 32 * 1024];
    let armed = Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(STAGE2_RUNNING_ADDR, &mut ram, &mut progress)
        .unwrap();

    assert_eq!(
        flash.slice(layout.partition_table.start, images.partition_table.len()),
        &images.partition_table[..]
    );
    assert_eq!(flash.slice(layout.ota_b.start, images.app.len()), &images.app[..]);
    // Boot region not yet touched.
    assert!(flash.slice(0, 0x8000).iter().all(|&b| b == 0xFF));
    assert_eq!(
        progress.milestones,
        vec![
            Milestone::RegionCopied(ImageKind::PartitionTable),
            Milestone::RegionCopied(ImageKind::App),
            Milestone::InstallerArmed,
        ]
    );

    let record = Migrator::new(&mut flash, &pool, &layout).record().unwrap().unwrap();
    assert_eq!(record.last_completed, Step::BootRegionInstalling);
    assert_eq!(record.stage, Stage::Finishing);

    assert_eq!(armed.regions().len(), 1);
    assert_eq!(armed.regions()[0].target, 0);
    let restarted = catch_unwind(AssertUnwindSafe(|| armed.run(&mut flash)));
    assert!(restarted.is_err());
    assert_eq!(
        flash.slice(0, images.bootloader.len()),
        &images.bootloader[..]
    );
}

#[test]
fn test_stage2_without_stage1_refuses() {
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();
    let mut ram = vec![0u8; 32 * 1024];

    let err = Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(STAGE2_RUNNING_ADDR, &mut ram, &mut ())
        .unwrap_err();

    assert_eq!(err, MigrationError::NotStaged { last_completed: None });
    assert!(flash.mutations().is_empty());
}

#[test]
fn test_stage2_outside_ota_slot_refuses() {
    let images = Images::new();
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();
    run_stage1(&mut flash, &images).unwrap();
    flash.clear_log();

    let mut ram = vec![0u8; 32 * 1024];
    let err = Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(0x1000, &mut ram, &mut ())
        .unwrap_err();

    assert_eq!(err, MigrationError::WrongSlot { running_addr: 0x1000 });
    assert!(flash.mutations().is_empty());
}

fn counting_source(images: &Images) -> CountingSource<SliceSource<'_>> {
    CountingSource {
        inner: images.source(),
        opened: Vec::new(),
    }
}

#[test]
fn test_stage1_after_stage2_started_stages_again() {
    let images = Images::new();
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();
    run_stage1(&mut flash, &images).unwrap();

    let mut ram = vec![0u8; 32 * 1024];
    Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(STAGE2_RUNNING_ADDR, &mut ram, &mut ())
        .unwrap();

    let mut counting = counting_source(&images);
    let record = Migrator::new(&mut flash, &pool, &layout)
        .run_stage1(STAGE1_RUNNING, &mut AlwaysConnected, &mut counting, &mut ())
        .unwrap();

    assert_eq!(counting.opened, ImageKind::STAGE1_ORDER.to_vec());
    assert_eq!(record.stage, Stage::Staging);
    assert_eq!(record.last_completed, Step::FinisherWritten);
}

#[test]
fn test_stage2_invalid_bootloader_touches_nothing() {
    let images = Images::new();
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();
    run_stage1(&mut flash, &images).unwrap();
    flash.preload(layout.staging_bootloader.start, &[0x00]);
    flash.clear_log();

    let mut ram = vec![0u8; 32 * 1024];
    let err = Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(STAGE2_RUNNING_ADDR, &mut ram, &mut ())
        .unwrap_err();

    assert_eq!(err, MigrationError::StagedBootloaderInvalid(ImageError::BadMagic { found: 0 }));
    assert_eq!(err.class(), ErrorClass::Validation);
    assert!(!err.is_retry_safe());
    assert!(flash.mutations().is_empty());
    assert!(flash
        .slice(layout.partition_table.start, 0x1000)
        .iter()
        .all(|&b| b == 0xFF));

    let record = Migrator::new(&mut flash, &pool, &layout).record().unwrap().unwrap();
    assert_eq!(record.last_completed, Step::FinisherWritten);
}

#[test]
fn test_stage1_restages_after_stage2_rejects_bootloader() {
    let images = Images::new();
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();
    run_stage1(&mut flash, &images).unwrap();

    flash.preload(layout.staging_bootloader.start, &[0x00]);
    // Leftovers past the image end must not survive restaging.
    flash.preload(layout.staging_bootloader.start + 0x7000, &[0x55; 16]);
    let mut ram = vec![0u8; 32 * 1024];
    Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(STAGE2_RUNNING_ADDR, &mut ram, &mut ())
        .unwrap_err();

    let mut counting = counting_source(&images);
    let record = Migrator::new(&mut flash, &pool, &layout)
        .run_stage1(STAGE1_RUNNING, &mut AlwaysConnected, &mut counting, &mut ())
        .unwrap();

    assert_eq!(counting.opened, ImageKind::STAGE1_ORDER.to_vec());
    assert_eq!(record.last_completed, Step::FinisherWritten);
    assert_eq!(
        flash.slice(layout.staging_bootloader.start, images.bootloader.len()),
        &images.bootloader[..]
    );
    assert!(flash
        .slice(layout.staging_bootloader.start + 0x7000, 16)
        .iter()
        .all(|&b| b == 0xFF));

    let mut ram = vec![0u8; 32 * 1024];
    let armed = Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(STAGE2_RUNNING_ADDR, &mut ram, &mut ())
        .unwrap();
    assert_eq!(armed.regions()[0].data, &images.bootloader[..]);
}

#[test]
fn test_stage1_restages_when_staged_segment_is_truncated() {
    let images = Images::new();
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();
    run_stage1(&mut flash, &images).unwrap();

    // First segment now claims more bytes than were staged.
    flash.preload(layout.staging_bootloader.start + 12, &0x00FF_0000u32.to_le_bytes());

    let mut ram = vec![0u8; 32 * 1024];
    let err = Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(STAGE2_RUNNING_ADDR, &mut ram, &mut ())
        .unwrap_err();
    assert_eq!(err, MigrationError::StagedBootloaderInvalid(ImageError::Truncated { offset: 16 }));

    let mut counting = counting_source(&images);
    Migrator::new(&mut flash, &pool, &layout)
        .run_stage1(STAGE1_RUNNING, &mut AlwaysConnected, &mut counting, &mut ())
        .unwrap();
    assert_eq!(counting.opened, ImageKind::STAGE1_ORDER.to_vec());
}

#[test]
fn test_stage2_rerun_skips_finished_copies() {
    let images = Images::new();
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();
    run_stage1(&mut flash, &images).unwrap();

    let mut ram = vec![0u8; 32 * 1024];
    Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(STAGE2_RUNNING_ADDR, &mut ram, &mut ())
        .unwrap();

    // Reset before the installer ran: the next boot arms it again without
    // copying anything.
    flash.clear_log();
    let mut ram = vec![0u8; 32 * 1024];
    let armed = Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(STAGE2_RUNNING_ADDR, &mut ram, &mut ())
        .unwrap();

    assert!(flash.mutations().is_empty());
    assert_eq!(armed.regions()[0].data.len(), images.bootloader.len());
}

#[test]
fn test_stage2_cannot_reinstall_from_corrupt_staging() {
    let images = Images::new();
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();
    run_stage1(&mut flash, &images).unwrap();

    let mut ram = vec![0u8; 32 * 1024];
    Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(STAGE2_RUNNING_ADDR, &mut ram, &mut ())
        .unwrap();

    flash.preload(layout.staging_bootloader.start, &[0x00]);
    let mut ram = vec![0u8; 32 * 1024];
    let err = Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(STAGE2_RUNNING_ADDR, &mut ram, &mut ())
        .unwrap_err();

    assert!(matches!(err, MigrationError::BootRegionUnrecoverable(_)));
    assert_eq!(err.class(), ErrorClass::Flash);
    assert!(!err.is_retry_safe());
}

#[test]
fn test_stage2_flash_failure_is_retry_safe() {
    let images = Images::new();
    let mut flash = blank_flash();
    let layout = layout();
    let pool = StagingPool::new();
    run_stage1(&mut flash, &images).unwrap();

    flash.fail_erase_at(layout.ota_b.start / 4096);
    let mut ram = vec![0u8; 32 * 1024];
    let err = Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(STAGE2_RUNNING_ADDR, &mut ram, &mut ())
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Flash);
    assert!(err.is_retry_safe());

    // The partition table step was committed; the retry only redoes the app.
    flash.clear_failures();
    let record = Migrator::new(&mut flash, &pool, &layout).record().unwrap().unwrap();
    assert_eq!(record.last_completed, Step::PartitionTableInstalled);

    let mut progress = Recorder::default();
    let mut ram = vec![0u8; 32 * 1024];
    Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(STAGE2_RUNNING_ADDR, &mut ram, &mut progress)
        .unwrap();
    assert_eq!(
        progress.milestones,
        vec![
            Milestone::RegionCopied(ImageKind::App),
            Milestone::InstallerArmed
        ]
    );
    assert_eq!(flash.slice(layout.ota_b.start, images.app.len()), &images.app[..]);
}

#[test]
fn test_copy_region_rejects_overlap() {
    let mut flash = blank_flash();
    let pool = StagingPool::new();
    let err = copy_region(&mut flash, &pool, ImageKind::App, 0x10_0000, 0x10_0800, 0x1000, &mut ()).unwrap_err();
    assert_eq!(
        err,
        MigrationError::CopyOverlap {
            src: 0x10_0000,
            dst: 0x10_0800
        }
    );
}

#[test]
fn test_milestone_blink_counts() {
    assert_eq!(Milestone::FlashChecked.blinks(), 2);
    assert_eq!(Milestone::NetworkUp.blinks(), 2);
    assert_eq!(Milestone::DataPartitionsSkipped.blinks(), 3);
    assert_eq!(Milestone::RegionCopied(ImageKind::App).blinks(), 1);
}
