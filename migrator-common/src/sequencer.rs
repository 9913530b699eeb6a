// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Two-stage migration sequencer.
//!
//! Stage 1 runs from the currently installed firmware. It checks the flash
//! size, brings the network up, downloads every image into the staging area,
//! writes the stage 2 finisher into OTA slot A, and returns so the caller can reboot.
//!
//! Stage 2 runs from OTA slot A. It loads and validates the staged bootloader
//! in RAM, copies the staged partition table and application to their final
//! locations, and hands back an armed installer. Running that installer is
//! the point of no return.
//!
//! Progress is committed to the [`RecordStore`] after every completed step,
//! so a reset anywhere resumes after the last step that finished. Running
//! stage 1 again after stage 2 has started, or over a staged bootloader that
//! no longer validates, discards the staged images and stages from scratch.

use core::fmt;

use crate::flash::{FlashDriver, FlashError};
use crate::image::{BootImage, ImageError, ImageHeader, HEADER_SIZE, SEGMENT_HEADER_SIZE};
use crate::installer::{ArmedInstaller, InstallerError, InstallerPayload};
use crate::layout::{FlashLayout, ImageKind, Region, SECTOR_SIZE};
use crate::record::{MigrationRecord, RecordError, RecordStore, Stage, Step};
use crate::source::{ImageSource, Network, TransportError};
use crate::writer::{erase_region, SectorWriter, StagingPool, WriterError, STAGING_BUFFER_SIZE};

/// How bad a failure is, and what the operator can do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorClass {
    /// Input rejected before anything was written where it matters.
    Validation,
    /// Network or download failure. Nothing outside the staging area changed.
    Transport,
    /// Erase, program, or read failure.
    Flash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MigrationError {
    /// Detected flash capacity differs from the layout's.
    FlashSize { detected: u32, expected: u32 },
    /// A stage 1 write target overlaps the running firmware.
    RunningImageOverlap { kind: ImageKind },
    /// Declared or recorded image length exceeds its region.
    ImageTooLarge { kind: ImageKind, len: u32, max: u32 },
    /// Copy source and destination overlap.
    CopyOverlap { src: u32, dst: u32 },
    /// Stage 2 started without a record of a finished stage 1.
    NotStaged { last_completed: Option<Step> },
    /// Stage 2 is not running from an OTA slot.
    WrongSlot { running_addr: u32 },
    Transport {
        kind: Option<ImageKind>,
        error: TransportError,
    },
    Image(ImageError),
    Writer(WriterError),
    Flash(FlashError),
    Record(RecordError),
    Installer(InstallerError),
    /// Stage 2 found the staged bootloader invalid. Nothing was written; the
    /// images have to be staged again by stage 1.
    StagedBootloaderInvalid(ImageError),
    /// The installer was interrupted earlier and the staged bootloader is no
    /// longer valid, so the boot region cannot be rewritten again.
    BootRegionUnrecoverable(ImageError),
}

impl MigrationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MigrationError::FlashSize { .. }
            | MigrationError::RunningImageOverlap { .. }
            | MigrationError::ImageTooLarge { .. }
            | MigrationError::CopyOverlap { .. }
            | MigrationError::NotStaged { .. }
            | MigrationError::WrongSlot { .. }
            | MigrationError::Image(_)
            | MigrationError::Installer(_)
            | MigrationError::StagedBootloaderInvalid(_) => ErrorClass::Validation,
            MigrationError::Transport { .. } => ErrorClass::Transport,
            MigrationError::Writer(_)
            | MigrationError::Flash(_)
            | MigrationError::Record(_)
            | MigrationError::BootRegionUnrecoverable(_) => ErrorClass::Flash,
        }
    }

    /// Whether running the same stage again can succeed.
    ///
    /// `false` when stage 2 has nothing valid to work from, so stage 1 has to
    /// stage the images again, and when the boot region is in an unknown
    /// state after an interrupted installer.
    pub fn is_retry_safe(&self) -> bool {
        !matches!(
            self,
            MigrationError::NotStaged { .. }
                | MigrationError::StagedBootloaderInvalid(_)
                | MigrationError::BootRegionUnrecoverable(_)
        )
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::FlashSize { detected, expected } => write!(
                f,
                "flash size {} bytes does not match the expected {} bytes",
                detected, expected
            ),
            MigrationError::RunningImageOverlap { kind } => {
                write!(f, "{} target overlaps the running firmware", kind.name())
            }
            MigrationError::ImageTooLarge { kind, len, max } => {
                write!(f, "{} is {} bytes, at most {} fit", kind.name(), len, max)
            }
            MigrationError::CopyOverlap { src, dst } => {
                write!(f, "copy 0x{:06x} -> 0x{:06x} overlaps", src, dst)
            }
            MigrationError::NotStaged { last_completed } => match last_completed {
                Some(step) => write!(f, "stage 1 incomplete, last step {:?}", step),
                None => write!(f, "no migration record, stage 1 never ran"),
            },
            MigrationError::WrongSlot { running_addr } => {
                write!(f, "running at 0x{:06x}, outside both OTA slots", running_addr)
            }
            MigrationError::Transport { kind: Some(kind), error } => {
                write!(f, "{} download: {}", kind.name(), error)
            }
            MigrationError::Transport { kind: None, error } => write!(f, "network: {}", error),
            MigrationError::Image(e) => write!(f, "{}", e),
            MigrationError::Writer(e) => write!(f, "{}", e),
            MigrationError::Flash(e) => write!(f, "{}", e),
            MigrationError::Record(e) => write!(f, "{}", e),
            MigrationError::Installer(e) => write!(f, "{}", e),
            MigrationError::StagedBootloaderInvalid(e) => {
                write!(f, "staged bootloader invalid, stage 1 must run again: {}", e)
            }
            MigrationError::BootRegionUnrecoverable(e) => {
                write!(f, "boot region state unknown and staged bootloader invalid: {}", e)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for MigrationError {}

impl From<ImageError> for MigrationError {
    fn from(e: ImageError) -> Self {
        MigrationError::Image(e)
    }
}

impl From<WriterError> for MigrationError {
    fn from(e: WriterError) -> Self {
        MigrationError::Writer(e)
    }
}

impl From<FlashError> for MigrationError {
    fn from(e: FlashError) -> Self {
        MigrationError::Flash(e)
    }
}

impl From<RecordError> for MigrationError {
    fn from(e: RecordError) -> Self {
        match e {
            RecordError::Flash(e) => MigrationError::Flash(e),
            e => MigrationError::Record(e),
        }
    }
}

impl From<InstallerError> for MigrationError {
    fn from(e: InstallerError) -> Self {
        MigrationError::Installer(e)
    }
}

pub type Result<T> = core::result::Result<T, MigrationError>;

/// Externally visible checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Milestone {
    FlashChecked,
    NetworkUp,
    DataPartitionsSkipped,
    ImageStaged(ImageKind),
    RegionCopied(ImageKind),
    InstallerArmed,
}

impl Milestone {
    /// LED blinks shown for this milestone.
    pub fn blinks(self) -> u32 {
        match self {
            Milestone::FlashChecked | Milestone::NetworkUp => 2,
            Milestone::DataPartitionsSkipped => 3,
            Milestone::RegionCopied(_) => 1,
            Milestone::ImageStaged(_) | Milestone::InstallerArmed => 0,
        }
    }
}

/// Advisory progress output. Correctness never depends on it.
pub trait ProgressSink {
    fn milestone(&mut self, _milestone: Milestone) {}

    /// Called whenever a transfer crosses a 4 KiB boundary and when it ends.
    fn bytes(&mut self, _kind: ImageKind, _done: u32, _total: u32) {}
}

impl ProgressSink for () {}

fn report_bytes<P: ProgressSink + ?Sized>(progress: &mut P, kind: ImageKind, before: u32, after: u32, total: u32) {
    if after / SECTOR_SIZE != before / SECTOR_SIZE || after == total {
        progress.bytes(kind, after, total);
    }
}

/// Stream one image from `source` into `target` and return its length.
pub fn download_to_flash<F, S, P>(
    flash: &mut F,
    pool: &StagingPool,
    source: &mut S,
    kind: ImageKind,
    target: Region,
    progress: &mut P,
) -> Result<u32>
where
    F: FlashDriver,
    S: ImageSource + ?Sized,
    P: ProgressSink + ?Sized,
{
    let transport = |error| MigrationError::Transport {
        kind: Some(kind),
        error,
    };

    let total = source.open(kind).map_err(transport)?;
    if total == 0 {
        source.close();
        return Err(transport(TransportError::InvalidLength));
    }
    if total > target.len {
        source.close();
        return Err(MigrationError::ImageTooLarge {
            kind,
            len: total,
            max: target.len,
        });
    }

    info!(
        "Downloading {} ({} bytes) to 0x{:06x}",
        kind.name(),
        total,
        target.start
    );

    let mut writer = match SectorWriter::begin(flash, pool, total as usize, target.start) {
        Ok(w) => w,
        Err(e) => {
            source.close();
            return Err(e.into());
        }
    };

    let mut chunk = [0u8; STAGING_BUFFER_SIZE];
    let mut received = 0u32;
    while received < total {
        let want = ((total - received) as usize).min(chunk.len());
        let n = match source.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                source.close();
                return Err(transport(e));
            }
        };

        if writer.write(&chunk[..n]) != n {
            source.close();
            let e = writer.error().unwrap_or(WriterError::Program {
                addr: writer.position(),
            });
            error!("Write failed at offset {}: {}", received, e);
            return Err(e.into());
        }

        let before = received;
        received += n as u32;
        report_bytes(progress, kind, before, received, total);
    }
    source.close();

    if received != total {
        error!("Incomplete download: got {} of {} bytes", received, total);
        return Err(transport(TransportError::Incomplete {
            received,
            expected: total,
        }));
    }

    writer.end()?;
    info!("Wrote {} bytes to 0x{:06x}", received, target.start);
    Ok(received)
}

/// Copy `len` bytes of flash from `src` to `dst` through a writer. The two
/// ranges must not overlap.
pub fn copy_region<F, P>(
    flash: &mut F,
    pool: &StagingPool,
    kind: ImageKind,
    src: u32,
    dst: u32,
    len: u32,
    progress: &mut P,
) -> Result<()>
where
    F: FlashDriver,
    P: ProgressSink + ?Sized,
{
    if Region::new(src, len).overlaps(&Region::new(dst, len)) {
        return Err(MigrationError::CopyOverlap { src, dst });
    }

    info!("Copying {} bytes 0x{:06x} -> 0x{:06x}", len, src, dst);

    let mut writer = SectorWriter::begin(flash, pool, len as usize, dst)?;
    let mut chunk = [0u8; STAGING_BUFFER_SIZE];
    let mut copied = 0u32;
    while copied < len {
        let n = ((len - copied) as usize).min(chunk.len());
        writer.flash_mut().read(src + copied, &mut chunk[..n])?;
        if writer.write(&chunk[..n]) != n {
            let e = writer.error().unwrap_or(WriterError::Program {
                addr: writer.position(),
            });
            return Err(e.into());
        }
        let before = copied;
        copied += n as u32;
        report_bytes(progress, kind, before, copied, len);
    }
    writer.end()?;
    Ok(())
}

/// Everything both stages share: the flash, its staging buffer, the layout,
/// and the record store.
pub struct Migrator<'a, F: FlashDriver> {
    flash: &'a mut F,
    pool: &'a StagingPool,
    layout: &'a FlashLayout,
    records: RecordStore,
}

impl<'a, F: FlashDriver> Migrator<'a, F> {
    pub fn new(flash: &'a mut F, pool: &'a StagingPool, layout: &'a FlashLayout) -> Self {
        Self {
            flash,
            pool,
            layout,
            records: RecordStore::new(layout),
        }
    }

    pub fn flash(&mut self) -> &mut F {
        &mut *self.flash
    }

    pub fn record(&mut self) -> Result<Option<MigrationRecord>> {
        Ok(self.records.load(&mut *self.flash)?)
    }

    fn commit(&mut self, record: &mut MigrationRecord, step: Step) -> Result<()> {
        record.complete(step);
        self.records.commit(&mut *self.flash, record)?;
        Ok(())
    }

    /// Stage 1. `running` is the flash range the calling firmware executes
    /// from; nothing inside it is written.
    ///
    /// Returns the record once the finisher is in place. The caller then
    /// reboots into OTA slot A.
    pub fn run_stage1<N, S, P>(
        &mut self,
        running: Region,
        net: &mut N,
        source: &mut S,
        progress: &mut P,
    ) -> Result<MigrationRecord>
    where
        N: Network + ?Sized,
        S: ImageSource + ?Sized,
        P: ProgressSink + ?Sized,
    {
        let layout = self.layout;

        let detected = self.flash.capacity();
        info!("Detected flash size: {} bytes", detected);
        if detected != layout.expected_capacity {
            error!("Expected {} bytes of flash", layout.expected_capacity);
            return Err(MigrationError::FlashSize {
                detected,
                expected: layout.expected_capacity,
            });
        }
        progress.milestone(Milestone::FlashChecked);

        for kind in ImageKind::STAGE1_ORDER {
            if layout.stage1_target(kind).overlaps(&running) {
                error!("{} target overlaps running firmware", kind.name());
                return Err(MigrationError::RunningImageOverlap { kind });
            }
        }

        let mut record = match self.records.load(&mut *self.flash)? {
            Some(mut r) if r.stage == Stage::Finishing => {
                warn!("Stage 2 started after step {}, staging again", r.last_completed as u8);
                self.restage(&mut r)?;
                r
            }
            Some(r) => {
                warn!("Resuming migration after step {}", r.last_completed as u8);
                r
            }
            None => MigrationRecord::new(),
        };
        if record.is_done(Step::BootloaderStaged) {
            match self.check_staged_bootloader(layout.staging_bootloader.start, record.bootloader_len) {
                Ok(()) => {}
                Err(MigrationError::Image(e)) => {
                    warn!("Staged bootloader no longer valid ({}), staging again", e);
                    self.restage(&mut record)?;
                }
                Err(e) => return Err(e),
            }
        }
        if record.is_done(Step::FinisherWritten) {
            warn!("Stage 1 already complete");
            return Ok(record);
        }

        net.connect().map_err(|error| MigrationError::Transport { kind: None, error })?;
        info!("Network connected");
        progress.milestone(Milestone::NetworkUp);

        // Data partitions are left for the new firmware to initialise; some
        // of them sit inside the flash this stage executes from.
        info!("Skipping data partition erase");
        progress.milestone(Milestone::DataPartitionsSkipped);

        for kind in ImageKind::STAGE1_ORDER {
            let step = Step::staged(kind);
            if record.is_done(step) {
                info!("{} already staged", kind.name());
                continue;
            }

            let target = layout.stage1_target(kind);
            let len = download_to_flash(
                &mut *self.flash,
                self.pool,
                &mut *source,
                kind,
                target,
                &mut *progress,
            )?;
            if kind == ImageKind::Bootloader {
                self.check_staged_bootloader(target.start, len)?;
            }

            record.set_staged_len(kind, len);
            self.commit(&mut record, step)?;
            progress.milestone(Milestone::ImageStaged(kind));
        }

        info!("Stage 1 complete");
        Ok(record)
    }

    /// Forget all progress and erase the staged bootloader.
    ///
    /// The reset record is committed first, so stage 2 refuses to run until
    /// everything is staged again.
    fn restage(&mut self, record: &mut MigrationRecord) -> Result<()> {
        record.restart();
        self.records.commit(&mut *self.flash, record)?;

        let staged = self.layout.staging_bootloader;
        erase_region(&mut *self.flash, self.pool, staged.start, staged.len as usize)?;
        Ok(())
    }

    /// Walk the header and segment records of the `len`-byte image at `addr`
    /// in flash. Accepts exactly what [`BootImage::validate`] accepts on the
    /// same bytes in RAM.
    fn check_staged_bootloader(&mut self, addr: u32, len: u32) -> Result<()> {
        let len = len as usize;
        let mut header = [0u8; HEADER_SIZE];
        if len < HEADER_SIZE {
            return Err(ImageError::Truncated { offset: len }.into());
        }
        self.flash.read(addr, &mut header)?;
        let header = ImageHeader::parse(&header)?;
        if !header.is_valid() {
            error!("Staged bootloader has bad magic 0x{:02x}", header.magic);
            return Err(ImageError::BadMagic { found: header.magic }.into());
        }

        let mut offset = HEADER_SIZE;
        for _ in 0..header.segment_count {
            let hdr_end = offset + SEGMENT_HEADER_SIZE;
            if hdr_end > len {
                return Err(ImageError::Truncated { offset }.into());
            }
            let mut seg = [0u8; SEGMENT_HEADER_SIZE];
            self.flash.read(addr + offset as u32, &mut seg)?;
            let data_len = u32::from_le_bytes([seg[4], seg[5], seg[6], seg[7]]) as usize;
            offset = hdr_end
                .checked_add(data_len)
                .filter(|&end| end <= len)
                .ok_or(ImageError::Truncated { offset: hdr_end })?;
        }
        Ok(())
    }

    /// Stage 2. `running_addr` is any address inside the OTA slot this binary
    /// executes from; `bootloader_ram` receives the staged bootloader and must
    /// be at least as large as the boot region.
    ///
    /// On success nothing irreversible has happened yet: the caller runs the
    /// returned installer from IRAM.
    pub fn run_stage2<'b, P>(
        &mut self,
        running_addr: u32,
        bootloader_ram: &'b mut [u8],
        progress: &mut P,
    ) -> Result<ArmedInstaller<'b>>
    where
        P: ProgressSink + ?Sized,
    {
        let layout = self.layout;

        let mut record = match self.records.load(&mut *self.flash)? {
            Some(r) if r.is_done(Step::FinisherWritten) => r,
            Some(r) => {
                return Err(MigrationError::NotStaged {
                    last_completed: Some(r.last_completed),
                })
            }
            None => return Err(MigrationError::NotStaged { last_completed: None }),
        };

        let app_slot = layout
            .other_ota_slot(running_addr)
            .ok_or(MigrationError::WrongSlot { running_addr })?;

        let reinstall = record.is_done(Step::BootRegionInstalling);
        if reinstall {
            warn!("Boot region install was interrupted, installing again");
        }

        // Everything is checked before the first write.
        check_fits(ImageKind::PartitionTable, record.partition_len, layout.partition_table.len)?;
        check_fits(ImageKind::App, record.app_len, layout.staging_app.len.min(app_slot.len))?;
        let len = record.bootloader_len;
        check_fits(ImageKind::Bootloader, len, layout.boot_region.len)?;
        check_fits(ImageKind::Bootloader, len, bootloader_ram.len() as u32)?;
        let len = len as usize;

        self.flash
            .read(layout.staging_bootloader.start, &mut bootloader_ram[..len])?;
        let ram: &'b [u8] = bootloader_ram;
        let bootloader = &ram[..len];

        let validated = BootImage::parse(bootloader).and_then(|image| image.validate());
        match validated {
            Ok(end) => info!("Bootloader valid, {} of {} bytes used", end, len),
            Err(e) if reinstall => {
                error!("Cannot reinstall boot region: {}", e);
                return Err(MigrationError::BootRegionUnrecoverable(e));
            }
            Err(e) => {
                error!("Staged bootloader invalid: {}", e);
                return Err(MigrationError::StagedBootloaderInvalid(e));
            }
        }

        let armed = InstallerPayload::new(layout, bootloader, None).arm()?;

        if !record.is_done(Step::PartitionTableInstalled) {
            copy_region(
                &mut *self.flash,
                self.pool,
                ImageKind::PartitionTable,
                layout.staging_partition_table.start,
                layout.partition_table.start,
                record.partition_len,
                &mut *progress,
            )?;
            self.commit(&mut record, Step::PartitionTableInstalled)?;
            progress.milestone(Milestone::RegionCopied(ImageKind::PartitionTable));
        }

        if !record.is_done(Step::AppInstalled) {
            copy_region(
                &mut *self.flash,
                self.pool,
                ImageKind::App,
                layout.staging_app.start,
                app_slot.start,
                record.app_len,
                &mut *progress,
            )?;
            self.commit(&mut record, Step::AppInstalled)?;
            progress.milestone(Milestone::RegionCopied(ImageKind::App));
        }

        if !reinstall {
            self.commit(&mut record, Step::BootRegionInstalling)?;
        }
        progress.milestone(Milestone::InstallerArmed);
        Ok(armed)
    }
}

fn check_fits(kind: ImageKind, len: u32, max: u32) -> Result<()> {
    if len > max {
        return Err(MigrationError::ImageTooLarge { kind, len, max });
    }
    Ok(())
}
