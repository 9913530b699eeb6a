// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Network collaborators consumed by stage 1.
//!
//! Wi-Fi association and HTTP live outside this crate; stage 1 only needs a
//! connectivity check and a byte stream per image with its declared length.

use core::fmt;

use crate::layout::ImageKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Association with the access point failed or timed out.
    NotConnected,
    /// The server answered with something other than success.
    Status(u16),
    /// No usable content length.
    InvalidLength,
    /// The stream ended before the declared length.
    Incomplete { received: u32, expected: u32 },
    /// Read failed mid-stream.
    Io,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotConnected => write!(f, "network not connected"),
            TransportError::Status(code) => write!(f, "request failed with status {}", code),
            TransportError::InvalidLength => write!(f, "invalid content length"),
            TransportError::Incomplete { received, expected } => {
                write!(f, "incomplete download: got {} of {} bytes", received, expected)
            }
            TransportError::Io => write!(f, "stream read failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TransportError {}

/// Network presence.
pub trait Network {
    /// Bring the link up. Blocks until connected or timed out.
    fn connect(&mut self) -> Result<(), TransportError>;
}

/// Streams one image at a time.
pub trait ImageSource {
    /// Start fetching `kind` and return its declared length in bytes.
    fn open(&mut self, kind: ImageKind) -> Result<u32, TransportError>;

    /// Read up to `buf.len()` bytes of the open image. `Ok(0)` means the
    /// stream ended.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Finish the current image, successful or not.
    fn close(&mut self) {}
}

/// Any byte slices, served in order of [`ImageKind`].
///
/// Used by the host tool's dry run and by tests.
pub struct SliceSource<'a> {
    images: [Option<&'a [u8]>; 4],
    current: &'a [u8],
    chunk: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new() -> Self {
        Self {
            images: [None; 4],
            current: &[],
            chunk: usize::MAX,
        }
    }

    pub fn with(mut self, kind: ImageKind, bytes: &'a [u8]) -> Self {
        self.images[kind as usize] = Some(bytes);
        self
    }

    /// Cap every read at `chunk` bytes.
    pub fn chunked(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }
}

impl Default for SliceSource<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageSource for SliceSource<'_> {
    fn open(&mut self, kind: ImageKind) -> Result<u32, TransportError> {
        let bytes = self.images[kind as usize].ok_or(TransportError::Status(404))?;
        if bytes.is_empty() {
            return Err(TransportError::InvalidLength);
        }
        self.current = bytes;
        Ok(bytes.len() as u32)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = buf.len().min(self.current.len()).min(self.chunk);
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current = &self.current[n..];
        Ok(n)
    }

    fn close(&mut self) {
        self.current = &[];
    }
}

/// A network that is always up.
pub struct AlwaysConnected;

impl Network for AlwaysConnected {
    fn connect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
