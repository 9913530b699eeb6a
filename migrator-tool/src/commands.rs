// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command implementations for dump inspection and the dry run.

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use crc::{Crc, CRC_32_ISO_HDLC};
use indicatif::{ProgressBar, ProgressStyle};

use migrator_common::sim::{FlashOp, SimFlash, RESTART_MESSAGE};
use migrator_common::source::{AlwaysConnected, SliceSource};
use migrator_common::{
    BootImage, FlashLayout, ImageKind, MigrationError, MigrationRecord, Migrator, Milestone,
    ProgressSink, RecordError, RecordStore, Region, StagingPool, SECTOR_SIZE,
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Flash the stage-1 binary is assumed to execute from during a dry run.
const STAGE1_RUNNING: Region = Region::new(0x1000, 0x1_F000);

const BAR_TEMPLATE: &str =
    "{spinner:.green} {msg:>16} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})";

fn new_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)?
        .progress_chars("#>-"))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn read_dump(path: &Path, layout: &FlashLayout) -> Result<Vec<u8>> {
    let data = read_file(path)?;
    if data.len() != layout.expected_capacity as usize {
        bail!(
            "{} is {} bytes, expected a {} byte flash dump",
            path.display(),
            data.len(),
            layout.expected_capacity
        );
    }
    Ok(data)
}

fn hexdump(data: &[u8], base: u32) {
    for (i, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        println!(
            "    {:06x}  {:<47}  |{}|",
            base as usize + i * 16,
            hex.join(" "),
            ascii
        );
    }
}

/// Differences between two equally long byte ranges, compared a sector at a
/// time behind a progress bar.
struct Comparison {
    differing: usize,
    first: Option<usize>,
}

fn compare(a: &[u8], b: &[u8], label: &str) -> Result<Comparison> {
    let pb = ProgressBar::new(a.len() as u64);
    pb.set_style(new_style()?);
    pb.set_message(label.to_string());

    let mut result = Comparison {
        differing: 0,
        first: None,
    };
    let step = SECTOR_SIZE as usize;
    for (i, (x, y)) in a.chunks(step).zip(b.chunks(step)).enumerate() {
        for (j, (p, q)) in x.iter().zip(y).enumerate() {
            if p != q {
                result.differing += 1;
                result.first.get_or_insert(i * step + j);
            }
        }
        pb.set_position(((i + 1) * step).min(a.len()) as u64);
    }
    pb.finish_and_clear();
    Ok(result)
}

/// Hexdump and compare each staged image against its final location.
pub fn check(dump: &Path, hexdump_len: usize) -> Result<()> {
    let layout = FlashLayout::ESP8266_4M;
    let data = read_dump(dump, &layout)?;

    let mut flash = SimFlash::from_image(&data);
    let record = RecordStore::new(&layout).load(&mut flash)?;
    match &record {
        Some(r) => println!(
            "Migration record: sequence {}, {:?}, last step {:?}",
            r.sequence, r.stage, r.last_completed
        ),
        None => println!("Migration record: none (comparing full staging regions)"),
    }
    println!();

    let app_slot = layout.ota_b;
    let pairs = [
        (
            ImageKind::Bootloader,
            layout.staging_bootloader,
            layout.boot_region,
        ),
        (
            ImageKind::PartitionTable,
            layout.staging_partition_table,
            layout.partition_table,
        ),
        (ImageKind::App, layout.staging_app, app_slot),
    ];

    let mut mismatched = 0;
    for (kind, staged, live) in pairs {
        let room = staged.len.min(live.len);
        let len = match &record {
            Some(r) if r.staged_len(kind) > 0 => r.staged_len(kind).min(room),
            _ => room,
        } as usize;

        let staged_bytes = &data[staged.start as usize..staged.start as usize + len];
        let live_bytes = &data[live.start as usize..live.start as usize + len];

        println!(
            "{} ({} bytes): staged 0x{:06x}, live 0x{:06x}",
            kind.name(),
            len,
            staged.start,
            live.start
        );
        println!("  staged:");
        hexdump(&staged_bytes[..hexdump_len.min(len)], staged.start);
        println!("  live:");
        hexdump(&live_bytes[..hexdump_len.min(len)], live.start);

        let diff = compare(staged_bytes, live_bytes, kind.name())?;
        println!("  CRC32 staged: 0x{:08x}", CRC32.checksum(staged_bytes));
        println!("  CRC32 live:   0x{:08x}", CRC32.checksum(live_bytes));
        match diff.first {
            None => println!("  Result:       identical"),
            Some(offset) => {
                mismatched += 1;
                println!(
                    "  Result:       {} bytes differ, first at +0x{:x}",
                    diff.differing, offset
                );
            }
        }
        println!();
    }

    if mismatched > 0 {
        bail!("{} of {} regions differ", mismatched, pairs.len());
    }
    println!("All staged images match their final locations.");
    Ok(())
}

/// Compare a binary with the dump contents at `addr`.
pub fn verify(dump: &Path, bin: &Path, addr: u32, max_mismatches: usize) -> Result<()> {
    let data = read_file(dump)?;
    let expected = read_file(bin)?;

    let start = addr as usize;
    let end = start
        .checked_add(expected.len())
        .filter(|&end| end <= data.len())
        .ok_or_else(|| {
            anyhow!(
                "{} ({} bytes) at 0x{:06x} runs past the end of the {} byte dump",
                bin.display(),
                expected.len(),
                addr,
                data.len()
            )
        })?;
    let actual = &data[start..end];

    println!(
        "Verifying {} ({} bytes) at 0x{:06x}...",
        bin.display(),
        expected.len(),
        addr
    );
    let diff = compare(&expected, actual, "verify")?;

    if diff.differing == 0 {
        println!(
            "OK: all bytes match (CRC32 0x{:08x})",
            CRC32.checksum(&expected)
        );
        return Ok(());
    }

    let mismatches = expected
        .iter()
        .zip(actual)
        .enumerate()
        .filter(|(_, (e, a))| e != a)
        .take(max_mismatches);
    for (offset, (e, a)) in mismatches {
        println!(
            "  0x{:06x}: expected 0x{:02x}, found 0x{:02x}",
            start + offset,
            e,
            a
        );
    }
    if diff.differing > max_mismatches {
        println!("  ... {} more", diff.differing - max_mismatches);
    }
    bail!("{} of {} bytes differ", diff.differing, expected.len())
}

/// Parse a boot image and print its layout.
pub fn image(file: &Path) -> Result<()> {
    let data = read_file(file)?;
    let image = BootImage::parse(&data)
        .with_context(|| format!("{} is not a boot image", file.display()))?;

    let header = image.header();
    println!("Boot image: {}", file.display());
    println!("  Magic:       0x{:02x}", header.magic);
    println!("  Segments:    {}", header.segment_count);
    println!("  SPI mode:    {}", header.spi_mode);
    println!(
        "  SPI speed:   {} (size {})",
        header.spi_speed_size & 0x0F,
        header.spi_speed_size >> 4
    );
    println!("  Entry:       0x{:08x}", header.entry_addr);
    println!();

    for segment in image.segments() {
        let segment = segment.with_context(|| format!("{} is truncated", file.display()))?;
        println!(
            "  [{}] load 0x{:08x}  len {:6}  file offset 0x{:05x}",
            segment.index,
            segment.load_addr,
            segment.data.len(),
            segment.offset
        );
    }

    let end = image.validate()?;
    println!();
    println!("  Image end:   {} of {} bytes", end, data.len());
    println!("  CRC32:       0x{:08x}", CRC32.checksum(&data[..end]));
    Ok(())
}

fn print_record(r: &MigrationRecord) {
    println!("    Sequence:       {}", r.sequence);
    println!("    Stage:          {:?}", r.stage);
    println!("    Last completed: {:?}", r.last_completed);
    println!("    Bootloader:     {} bytes", r.bootloader_len);
    println!("    Partition:      {} bytes", r.partition_len);
    println!("    App:            {} bytes", r.app_len);
    println!("    Finisher:       {} bytes", r.finisher_len);
}

/// Decode both record slots and report which one is current.
pub fn record(dump: &Path) -> Result<()> {
    let layout = FlashLayout::ESP8266_4M;
    let mut flash = SimFlash::from_image(&read_dump(dump, &layout)?);
    let store = RecordStore::new(&layout);

    for (slot, addr) in store.slots().iter().enumerate() {
        println!("Slot {} at 0x{:06x}:", slot, addr);
        match store.read_slot(&mut flash, slot) {
            Ok(r) => print_record(&r),
            Err(RecordError::BadMagic) => println!("    empty"),
            Err(e) => println!("    invalid: {}", e),
        }
    }

    println!();
    match store.load(&mut flash)? {
        Some(r) => println!(
            "Current: sequence {} ({:?}, last step {:?})",
            r.sequence, r.stage, r.last_completed
        ),
        None => println!("Current: no migration in progress"),
    }
    Ok(())
}

/// Progress bars for the dry run, one per transfer.
struct BarProgress {
    style: ProgressStyle,
    current: Option<(ImageKind, ProgressBar)>,
}

impl BarProgress {
    fn new() -> Result<Self> {
        Ok(Self {
            style: new_style()?,
            current: None,
        })
    }

    fn finish(&mut self) {
        if let Some((_, pb)) = self.current.take() {
            pb.finish();
        }
    }
}

impl ProgressSink for BarProgress {
    fn milestone(&mut self, milestone: Milestone) {
        self.finish();
        let text = match milestone {
            Milestone::FlashChecked => "flash size checked".to_string(),
            Milestone::NetworkUp => "network up".to_string(),
            Milestone::DataPartitionsSkipped => "data partitions left in place".to_string(),
            Milestone::ImageStaged(kind) => format!("{} staged", kind.name()),
            Milestone::RegionCopied(kind) => format!("{} copied", kind.name()),
            Milestone::InstallerArmed => "installer armed".to_string(),
        };
        println!("  -> {} ({} blinks)", text, milestone.blinks());
    }

    fn bytes(&mut self, kind: ImageKind, done: u32, total: u32) {
        let pb = match &self.current {
            Some((k, pb)) if *k == kind => pb.clone(),
            _ => {
                self.finish();
                let pb = ProgressBar::new(total as u64);
                pb.set_style(self.style.clone());
                pb.set_message(kind.name());
                self.current = Some((kind, pb.clone()));
                pb
            }
        };
        pb.set_position(done as u64);
    }
}

fn stage_failed(stage: &str, e: MigrationError) -> anyhow::Error {
    let advice = match e {
        _ if e.is_retry_safe() => "safe to retry",
        MigrationError::BootRegionUnrecoverable(_) => "boot region may be corrupt",
        _ => "run stage 1 again",
    };
    let context = format!("{} failed ({:?} error, {})", stage, e.class(), advice);
    anyhow::Error::new(e).context(context)
}

/// Inputs of [`simulate`].
pub struct SimulateArgs<'a> {
    pub bootloader: &'a Path,
    pub partition_table: &'a Path,
    pub app: &'a Path,
    pub finisher: &'a Path,
    pub base: Option<&'a Path>,
    pub output: &'a Path,
    pub fail_erase: Option<u32>,
    pub fail_program: Option<u32>,
}

/// Run both stages and the installer against simulated flash.
pub fn simulate(args: &SimulateArgs<'_>) -> Result<()> {
    let layout = FlashLayout::ESP8266_4M;

    let bootloader = read_file(args.bootloader)?;
    let partition_table = read_file(args.partition_table)?;
    let app = read_file(args.app)?;
    let finisher = read_file(args.finisher)?;

    let mut flash = match args.base {
        Some(base) => SimFlash::from_image(&read_dump(base, &layout)?),
        None => SimFlash::new(layout.expected_capacity),
    };
    if let Some(sector) = args.fail_erase {
        flash.fail_erase_at(sector);
    }
    if let Some(addr) = args.fail_program {
        flash.fail_program_at(addr);
    }

    let pool = StagingPool::new();
    let mut progress = BarProgress::new()?;
    let mut source = SliceSource::new()
        .with(ImageKind::Bootloader, &bootloader)
        .with(ImageKind::PartitionTable, &partition_table)
        .with(ImageKind::App, &app)
        .with(ImageKind::Finisher, &finisher);

    println!(
        "Stage 1 (running from 0x{:06x}..0x{:06x})",
        STAGE1_RUNNING.start,
        STAGE1_RUNNING.end()
    );
    let record = Migrator::new(&mut flash, &pool, &layout)
        .run_stage1(STAGE1_RUNNING, &mut AlwaysConnected, &mut source, &mut progress)
        .map_err(|e| stage_failed("Stage 1", e))?;
    progress.finish();
    println!("  Record sequence {}, last step {:?}", record.sequence, record.last_completed);
    println!();

    // Stage 2 boots from the OTA slot the finisher was written to.
    let stage2_addr = layout.finisher.start;
    println!("Stage 2 (running from 0x{:06x})", stage2_addr);
    let mut bootloader_ram = vec![0u8; layout.boot_region.len as usize];
    let armed = Migrator::new(&mut flash, &pool, &layout)
        .run_stage2(stage2_addr, &mut bootloader_ram, &mut progress)
        .map_err(|e| stage_failed("Stage 2", e))?;
    progress.finish();
    println!();

    println!("Installing {} region(s):", armed.regions().len());
    for region in armed.regions() {
        println!(
            "  0x{:06x}: erase {} sectors, write {} bytes",
            region.target,
            region.erase_sectors,
            region.data.len()
        );
    }

    flash.clear_log();
    let previous_hook = panic::take_hook();
    panic::set_hook(Box::new(|_| {}));
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        armed.run(&mut flash);
    }));
    panic::set_hook(previous_hook);

    match outcome {
        Ok(()) => bail!("installer returned without restarting"),
        Err(payload) => {
            let restarted = payload
                .downcast_ref::<&str>()
                .map(|s| *s == RESTART_MESSAGE)
                .or_else(|| payload.downcast_ref::<String>().map(|s| s == RESTART_MESSAGE))
                .unwrap_or(false);
            if !restarted {
                panic::resume_unwind(payload);
            }
        }
    }

    let erases = flash
        .ops()
        .iter()
        .filter(|op| matches!(op, FlashOp::Erase { .. }))
        .count();
    let programs = flash
        .ops()
        .iter()
        .filter(|op| matches!(op, FlashOp::Program { .. }))
        .count();
    println!("  {} erases, {} program chunks, then restart", erases, programs);

    let installed = flash.slice(layout.boot_region.start, bootloader.len());
    if installed != &bootloader[..] {
        let diff = compare(installed, &bootloader, "boot region")?;
        bail!(
            "boot region differs from the new bootloader in {} bytes",
            diff.differing
        );
    }
    println!("  Boot region holds the new bootloader.");

    fs::write(args.output, flash.contents())
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    println!();
    println!("Flash image written to {}", args.output.display());
    Ok(())
}
