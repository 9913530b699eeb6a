// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Build-time settings. Override with environment variables at build time.

pub const VERSION: &str = env!("MIGRATOR_VERSION");

/// Base URL the images are fetched from, without a trailing slash.
pub const SERVER_URL: &str = match option_env!("MIGRATOR_SERVER_URL") {
    Some(url) => url,
    None => "http://192.168.1.10:8700/migration",
};

pub const WIFI_SSID: &str = match option_env!("MIGRATOR_WIFI_SSID") {
    Some(ssid) => ssid,
    None => "migration",
};

pub const WIFI_PASSWORD: &str = match option_env!("MIGRATOR_WIFI_PASSWORD") {
    Some(password) => password,
    None => "",
};

pub const WIFI_TIMEOUT_MS: u32 = 30_000;

/// Pause before rebooting into stage 2.
pub const REBOOT_DELAY_MS: u32 = 5_000;
