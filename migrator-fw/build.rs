// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

use std::env;
use std::fs;
use std::path::PathBuf;

/// Binaries and the linker script holding each one's memory map.
const BINS: [(&str, &str); 3] = [
    ("boot-stub", "boot_stub.x"),
    ("stage1", "stage1.x"),
    ("stage2", "stage2.x"),
];

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let linker_dir = manifest_dir.join("linker_scripts");

    // ROM symbols are shared; memory.x differs per binary, so each one gets
    // its own search directory.
    fs::copy(linker_dir.join("rom_functions.x"), out_dir.join("rom_functions.x"))
        .expect("Failed to copy rom_functions.x");
    println!("cargo:rustc-link-search={}", out_dir.display());

    for (bin, script) in BINS {
        let bin_dir = out_dir.join(bin);
        fs::create_dir_all(&bin_dir).expect("Failed to create linker directory");
        let memory = fs::read_to_string(linker_dir.join(script))
            .unwrap_or_else(|_| panic!("Failed to read {}", script));
        fs::write(bin_dir.join("memory.x"), memory).expect("Failed to write memory.x");
        println!("cargo:rustc-link-arg-bin={}=-L{}", bin, bin_dir.display());
        println!(
            "cargo:rerun-if-changed={}",
            linker_dir.join(script).display()
        );
    }

    println!("cargo:rustc-link-arg=-Tlink.x");
    println!("cargo:rustc-link-arg=-Tdefmt.x");
    println!(
        "cargo:rerun-if-changed={}",
        linker_dir.join("rom_functions.x").display()
    );
    println!("cargo:rerun-if-changed=build.rs");

    // Read version from project-root VERSION file
    let version_file = manifest_dir.parent().unwrap().join("VERSION");
    let version = fs::read_to_string(&version_file)
        .expect("Failed to read VERSION file")
        .trim()
        .to_string();
    println!("cargo:rustc-env=MIGRATOR_VERSION={}", version);
    println!("cargo:rerun-if-changed={}", version_file.display());

    for var in [
        "MIGRATOR_SERVER_URL",
        "MIGRATOR_WIFI_SSID",
        "MIGRATOR_WIFI_PASSWORD",
    ] {
        println!("cargo:rerun-if-env-changed={}", var);
    }
}
