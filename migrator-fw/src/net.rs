// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Network access through the C shim linked next to stage 1.
//!
//! The Wi-Fi stack and the HTTP client live in the shim. It offers a blocking
//! interface with at most one open response.

use core::fmt::Write;

use heapless::String;
use migrator_common::{ImageKind, ImageSource, Network, TransportError};

const URL_CAPACITY: usize = 160;
const HTTP_OK: i32 = 200;

unsafe extern "C" {
    /// Associate and obtain an address. 0 on success.
    fn migrator_net_connect(
        ssid: *const u8,
        ssid_len: usize,
        password: *const u8,
        password_len: usize,
        timeout_ms: u32,
    ) -> i32;

    /// Send a GET request. Returns the HTTP status, or a negative value when
    /// no response arrived. `content_length` receives the declared body size.
    fn migrator_http_open(url: *const u8, url_len: usize, content_length: *mut u32) -> i32;

    /// Read body bytes. Returns the count, 0 at the end of the body, or a
    /// negative value on error.
    fn migrator_http_read(buf: *mut u8, len: usize) -> i32;

    fn migrator_http_close();
}

/// File served for each image under the server base URL.
pub fn file_name(kind: ImageKind) -> &'static str {
    match kind {
        ImageKind::Bootloader => "bootloader.bin",
        ImageKind::PartitionTable => "partitions.bin",
        ImageKind::App => "app.bin",
        ImageKind::Finisher => "stage2.bin",
    }
}

pub struct ShimNetwork {
    ssid: &'static str,
    password: &'static str,
    timeout_ms: u32,
}

impl ShimNetwork {
    pub fn new(ssid: &'static str, password: &'static str, timeout_ms: u32) -> Self {
        Self {
            ssid,
            password,
            timeout_ms,
        }
    }
}

impl Network for ShimNetwork {
    fn connect(&mut self) -> Result<(), TransportError> {
        defmt::info!("Connecting to {}", self.ssid);
        let rc = unsafe {
            migrator_net_connect(
                self.ssid.as_ptr(),
                self.ssid.len(),
                self.password.as_ptr(),
                self.password.len(),
                self.timeout_ms,
            )
        };
        if rc != 0 {
            defmt::error!("Wi-Fi connection failed ({})", rc);
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }
}

/// Images fetched over HTTP from `<base>/<file>`.
pub struct HttpSource {
    base: &'static str,
    open: bool,
}

impl HttpSource {
    pub fn new(base: &'static str) -> Self {
        Self { base, open: false }
    }
}

impl ImageSource for HttpSource {
    fn open(&mut self, kind: ImageKind) -> Result<u32, TransportError> {
        let mut url: String<URL_CAPACITY> = String::new();
        write!(url, "{}/{}", self.base, file_name(kind)).map_err(|_| TransportError::Io)?;
        defmt::info!("GET {}", url.as_str());

        let mut content_length = 0u32;
        let status = unsafe { migrator_http_open(url.as_ptr(), url.len(), &mut content_length) };
        if status < 0 {
            return Err(TransportError::NotConnected);
        }
        self.open = true;
        if status != HTTP_OK {
            defmt::error!("HTTP status {}", status);
            self.close();
            return Err(TransportError::Status(status as u16));
        }
        Ok(content_length)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = unsafe { migrator_http_read(buf.as_mut_ptr(), buf.len()) };
        if n < 0 {
            return Err(TransportError::Io);
        }
        Ok(n as usize)
    }

    fn close(&mut self) {
        if self.open {
            unsafe { migrator_http_close() };
            self.open = false;
        }
    }
}
