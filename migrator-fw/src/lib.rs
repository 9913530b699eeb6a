// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Board support shared by the boot stub and both migrator stages.

#![no_std]

pub mod board;
pub mod boot;
pub mod config;
pub mod flash;
pub mod install;
pub mod logger;
pub mod net;
pub mod progress;
pub mod rom;

unsafe extern "C" {
    static _image_flash_start: u32;
    static _image_flash_len: u32;
}

/// Value of a linker-script symbol.
macro_rules! linker_addr {
    ($sym:ident) => {
        unsafe { &$sym as *const u32 as u32 }
    };
}

/// Flash range the running binary executes from.
pub fn running_image() -> migrator_common::Region {
    migrator_common::Region::new(
        linker_addr!(_image_flash_start),
        linker_addr!(_image_flash_len),
    )
}
