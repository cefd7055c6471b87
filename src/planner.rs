//! Flash geometry and bootloader address encodings.
//!
//! The bootloader erases 4 KiB sectors and programs 256 byte pages, both
//! addressed with 3-byte big-endian-ish encodings derived from the linear
//! image offset.

/// Erase granularity
pub const SECTOR_SIZE: usize = 4096;

/// Write / program granularity
pub const PAGE_SIZE: usize = 256;

pub const PAGES_PER_SECTOR: usize = SECTOR_SIZE / PAGE_SIZE;

/// Offsets below this fit the 3-byte encodings, the high byte is `addr / 65535`
pub const ADDRESSABLE: usize = 0x100 * 65535;

/// Number of sectors covering `len` bytes
pub fn sector_count(len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    (len - 1) / SECTOR_SIZE + 1
}

/// Number of pages covering `len` bytes
pub fn page_count(len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    (len - 1) / PAGE_SIZE + 1
}

/// Pages of `sector` that hold image data, the last sector may be partial
pub fn live_pages(sector: usize, page_count: usize) -> usize {
    if (sector + 1) * PAGES_PER_SECTOR >= page_count {
        page_count.saturating_sub(sector * PAGES_PER_SECTOR).min(PAGES_PER_SECTOR)
    } else {
        PAGES_PER_SECTOR
    }
}

/// Address argument of the erase command.
///
/// The bootloader decodes the high byte as `addr / 65535` and only looks at the
/// sector nibble of the middle byte, keep this exact.
pub fn sector_address(addr: usize) -> [u8; 3] {
    [((addr / 65535) & 0xFF) as u8, ((addr / 256) & 0xF0) as u8, 0x00]
}

/// Address argument of the program command
pub fn page_address(addr: usize) -> [u8; 3] {
    [
        ((addr / 65535) & 0xFF) as u8,
        ((addr / 256) & 0xFF) as u8,
        (addr & 0xFF) as u8,
    ]
}

/// 8-bit modular sum the bootloader echoes after a write frame
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Sector and page counts of an image
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Layout {
    pub len: usize,
    pub sectors: usize,
    pub pages: usize,
}

impl Layout {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            sectors: sector_count(len),
            pages: page_count(len),
        }
    }

    /// Live pages of a sector in this layout
    pub fn pages_in(&self, sector: usize) -> usize {
        live_pages(sector, self.pages)
    }

    /// Payload length of the page starting at `addr`
    pub fn chunk_len(&self, addr: usize) -> usize {
        PAGE_SIZE.min(self.len.saturating_sub(addr))
    }
}
