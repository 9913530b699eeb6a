// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command-line interface definitions.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands;

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "migrator-tool")]
#[command(version = env!("MIGRATOR_VERSION"))]
#[command(about = "Inspect flash dumps and dry-run the ESP8266 boot-chain migration")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Compare the staged images of a flash dump with their final locations
    Check {
        /// Full flash dump (4 MiB)
        #[arg(value_name = "DUMP")]
        dump: PathBuf,

        /// Bytes of hexdump shown per region
        #[arg(long, default_value = "64")]
        hexdump: usize,
    },

    /// Compare a binary with the contents of a flash dump at an address
    Verify {
        /// Full flash dump
        #[arg(value_name = "DUMP")]
        dump: PathBuf,

        /// Expected contents
        #[arg(value_name = "BIN")]
        bin: PathBuf,

        /// Flash address of BIN in hex
        #[arg(short, long, value_parser = parse_hex_u32)]
        addr: u32,

        /// Stop listing after this many mismatches
        #[arg(short, long, default_value = "16")]
        max_mismatches: usize,
    },

    /// Parse a boot image and print its header and segments
    Image {
        /// Boot image file
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Decode both migration record slots of a flash dump
    Record {
        /// Full flash dump (4 MiB)
        #[arg(value_name = "DUMP")]
        dump: PathBuf,
    },

    /// Run stage 1, stage 2 and the installer against simulated flash
    Simulate {
        /// New bootloader image
        #[arg(long, value_name = "FILE")]
        bootloader: PathBuf,

        /// New partition table
        #[arg(long, value_name = "FILE")]
        partition_table: PathBuf,

        /// New application image
        #[arg(long, value_name = "FILE")]
        app: PathBuf,

        /// Stage-2 finisher image
        #[arg(long, value_name = "FILE")]
        finisher: PathBuf,

        /// Start from this flash dump instead of blank flash
        #[arg(long, value_name = "DUMP")]
        base: Option<PathBuf>,

        /// Where to write the resulting flash image
        #[arg(short, long, value_name = "OUTPUT")]
        output: PathBuf,

        /// Make the erase of this sector fail
        #[arg(long, value_name = "SECTOR")]
        fail_erase: Option<u32>,

        /// Make the program at this address (hex) fail
        #[arg(long, value_name = "ADDR", value_parser = parse_hex_u32)]
        fail_program: Option<u32>,
    },
}

/// Parse a hex string (with or without 0x prefix) into a u32.
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(s, 16).map_err(|e| format!("invalid hex value: {e}"))
}

/// Execute the parsed CLI command.
pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Check { dump, hexdump } => commands::check(&dump, hexdump),
        Commands::Verify {
            dump,
            bin,
            addr,
            max_mismatches,
        } => commands::verify(&dump, &bin, addr, max_mismatches),
        Commands::Image { file } => commands::image(&file),
        Commands::Record { dump } => commands::record(&dump),
        Commands::Simulate {
            bootloader,
            partition_table,
            app,
            finisher,
            base,
            output,
            fail_erase,
            fail_program,
        } => commands::simulate(&commands::SimulateArgs {
            bootloader: &bootloader,
            partition_table: &partition_table,
            app: &app,
            finisher: &finisher,
            base: base.as_deref(),
            output: &output,
            fail_erase,
            fail_program,
        }),
    }
}
