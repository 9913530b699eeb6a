// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Boot image format.
//!
//! ```text
//! offset  size  field
//! 0       1     magic (0xE9)
//! 1       1     segment count
//! 2       1     SPI mode
//! 3       1     SPI speed / size
//! 4       4     entry address
//! 8       ...   segment_count x { load_addr: u32, data_len: u32, data }
//! ```
//!
//! All multi-byte fields are little-endian. The image is parsed from a buffer
//! that already holds it in full.

use core::fmt;

/// First byte of every bootable image.
pub const IMAGE_MAGIC: u8 = 0xE9;
/// Size of the image header.
pub const HEADER_SIZE: usize = 8;
/// Size of a segment record header.
pub const SEGMENT_HEADER_SIZE: usize = 8;
/// The boot stub reads this much of the staged bootloader before parsing.
pub const MAX_BOOTLOADER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageError {
    /// The first byte is not [`IMAGE_MAGIC`].
    BadMagic { found: u8 },
    /// The buffer ends inside the header, a segment record, or its payload.
    Truncated { offset: usize },
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::BadMagic { found } => {
                write!(f, "bad image magic 0x{:02x} (expected 0x{:02x})", found, IMAGE_MAGIC)
            }
            ImageError::Truncated { offset } => write!(f, "image truncated at offset {}", offset),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ImageError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageHeader {
    pub magic: u8,
    pub segment_count: u8,
    pub spi_mode: u8,
    pub spi_speed_size: u8,
    pub entry_addr: u32,
}

impl ImageHeader {
    /// Decode the header. The magic is not checked here.
    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        let h = bytes
            .get(..HEADER_SIZE)
            .ok_or(ImageError::Truncated { offset: bytes.len() })?;
        Ok(Self {
            magic: h[0],
            segment_count: h[1],
            spi_mode: h[2],
            spi_speed_size: h[3],
            entry_addr: u32::from_le_bytes([h[4], h[5], h[6], h[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let e = self.entry_addr.to_le_bytes();
        [
            self.magic,
            self.segment_count,
            self.spi_mode,
            self.spi_speed_size,
            e[0],
            e[1],
            e[2],
            e[3],
        ]
    }

    pub fn is_valid(&self) -> bool {
        self.magic == IMAGE_MAGIC
    }
}

/// One segment of a parsed image, borrowing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub index: u8,
    pub load_addr: u32,
    pub data: &'a [u8],
    /// Offset of the payload inside the image buffer.
    pub offset: usize,
}

/// Destination of segment payloads.
///
/// On the device this is raw memory; tests record the stores.
pub trait LoadTarget {
    /// Store `bytes` at `addr` as 32-bit words. `bytes.len()` is always a
    /// multiple of four.
    fn store_words(&mut self, addr: u32, bytes: &[u8]);
}

/// A validated boot image over a borrowed buffer.
#[derive(Debug, Clone, Copy)]
pub struct BootImage<'a> {
    header: ImageHeader,
    bytes: &'a [u8],
}

impl<'a> BootImage<'a> {
    /// Check the header magic. Segment records are checked lazily by
    /// [`segments`](Self::segments) and [`relocate`](Self::relocate).
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ImageError> {
        let header = ImageHeader::parse(bytes)?;
        if !header.is_valid() {
            return Err(ImageError::BadMagic { found: header.magic });
        }
        Ok(Self { header, bytes })
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn entry_addr(&self) -> u32 {
        self.header.entry_addr
    }

    pub fn segments(&self) -> Segments<'a> {
        Segments {
            bytes: self.bytes,
            offset: HEADER_SIZE,
            index: 0,
            count: self.header.segment_count,
            failed: false,
        }
    }

    /// Walk every segment record and return the offset just past the last
    /// payload.
    pub fn validate(&self) -> Result<usize, ImageError> {
        let mut end = HEADER_SIZE;
        for seg in self.segments() {
            let seg = seg?;
            end = seg.offset + seg.data.len();
        }
        Ok(end)
    }

    /// Copy every segment payload, rounded up to whole words, to its load
    /// address and return the entry address.
    ///
    /// Destinations are not checked. The round-up reads the bytes that follow
    /// the payload in the image, or the erased value past the end of the buffer.
    pub fn relocate<T: LoadTarget + ?Sized>(&self, target: &mut T) -> Result<u32, ImageError> {
        for seg in self.segments() {
            let seg = seg?;
            debug!(
                "Segment {}: 0x{:08x} len {}",
                seg.index,
                seg.load_addr,
                seg.data.len()
            );
            self.store_segment(target, &seg);
        }
        Ok(self.header.entry_addr)
    }

    fn store_segment<T: LoadTarget + ?Sized>(&self, target: &mut T, seg: &Segment<'_>) {
        let whole = seg.data.len() & !3;
        if whole > 0 {
            target.store_words(seg.load_addr, &seg.data[..whole]);
        }
        if whole < seg.data.len() {
            let mut word = [crate::layout::ERASED_BYTE; 4];
            let tail_start = seg.offset + whole;
            for (i, b) in word.iter_mut().enumerate() {
                if let Some(&v) = self.bytes.get(tail_start + i) {
                    *b = v;
                }
            }
            target.store_words(seg.load_addr + whole as u32, &word);
        }
    }
}

/// Iterator over the segment records of a [`BootImage`].
pub struct Segments<'a> {
    bytes: &'a [u8],
    offset: usize,
    index: u8,
    count: u8,
    failed: bool,
}

impl<'a> Iterator for Segments<'a> {
    type Item = Result<Segment<'a>, ImageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.index >= self.count {
            return None;
        }

        let item = self.read_one();
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

impl<'a> Segments<'a> {
    fn read_one(&mut self) -> Result<Segment<'a>, ImageError> {
        let hdr_end = self.offset + SEGMENT_HEADER_SIZE;
        let h = self
            .bytes
            .get(self.offset..hdr_end)
            .ok_or(ImageError::Truncated { offset: self.offset })?;
        let load_addr = u32::from_le_bytes([h[0], h[1], h[2], h[3]]);
        let len = u32::from_le_bytes([h[4], h[5], h[6], h[7]]) as usize;

        let data = hdr_end
            .checked_add(len)
            .and_then(|end| self.bytes.get(hdr_end..end))
            .ok_or(ImageError::Truncated { offset: hdr_end })?;

        let seg = Segment {
            index: self.index,
            load_addr,
            data,
            offset: hdr_end,
        };
        self.offset = hdr_end + len;
        self.index += 1;
        Ok(seg)
    }
}

/// Execution memory written through raw volatile word stores.
pub struct RawMemory;

impl LoadTarget for RawMemory {
    fn store_words(&mut self, addr: u32, bytes: &[u8]) {
        for (i, w) in bytes.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
            // SAFETY: the image names its own load addresses; the caller chose
            // to trust it by relocating into raw memory.
            unsafe { ((addr + 4 * i as u32) as *mut u32).write_volatile(value) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let h = ImageHeader {
            magic: IMAGE_MAGIC,
            segment_count: 3,
            spi_mode: 2,
            spi_speed_size: 0x40,
            entry_addr: 0x4010_0004,
        };
        assert_eq!(h.to_bytes(), [0xE9, 3, 2, 0x40, 0x04, 0x00, 0x10, 0x40]);
        assert_eq!(ImageHeader::parse(&h.to_bytes()), Ok(h));
    }

    #[test]
    fn test_short_header_is_truncated() {
        assert_eq!(
            BootImage::parse(&[0xE9, 0, 0]).err(),
            Some(ImageError::Truncated { offset: 3 })
        );
    }
}
