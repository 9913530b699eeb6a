// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Common types and utilities for the ESP8266 boot-chain migrator.
//!
//! This crate supports both `no_std` (firmware) and `std` (host) environments:
//! - Default: `std`, which also enables the simulated flash used by tests and
//!   by `migrator-tool`
//! - `default-features = false`: `no_std` for the firmware images
//! - `defmt` feature: log through `defmt`

#![cfg_attr(not(feature = "std"), no_std)]

// Must come first so the log macros are visible in every module below.
#[macro_use]
mod log;

pub mod flash;
pub mod image;
pub mod indicator;
pub mod installer;
pub mod layout;
pub mod record;
pub mod sequencer;
pub mod source;
pub mod writer;

#[cfg(feature = "std")]
pub mod sim;

// Re-export commonly used types
pub use flash::{FlashDriver, FlashError};
pub use image::{BootImage, ImageError, ImageHeader, LoadTarget, RawMemory, Segment, IMAGE_MAGIC};
pub use indicator::{blink, error_loop, ActiveLow};
pub use installer::{
    ArmedInstaller, FlashCriticalSection, InstallRegion, InstallerError, InstallerPayload, RomFlash,
};
pub use layout::{FlashLayout, ImageKind, Region, ERASED_BYTE, PROGRAM_ALIGN, SECTOR_SIZE};
pub use record::{MigrationRecord, RecordError, RecordStore, Stage, Step};
pub use sequencer::{
    copy_region, download_to_flash, ErrorClass, MigrationError, Migrator, Milestone, ProgressSink,
};
pub use source::{ImageSource, Network, TransportError};
pub use writer::{erase_region, SectorWriter, StagingPool, WriterError, STAGING_BUFFER_SIZE};
