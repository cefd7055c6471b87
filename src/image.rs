//! Verilog hex memory images, as produced by `objcopy -O verilog`.
//!
//! ```text
//! @00000000
//! 13 05 00 00 ...
//! @01000000
//! 6F 00 40 00 13 00 00 00 ...
//! ```
//!
//! Only the flash resident region (records at or above the flash base) is
//! kept, earlier RAM records are skipped.

use std::path::Path;

use crate::planner;

/// Start of flash in the image address space
pub const FLASH_BASE: u32 = 0x0100_0000;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("no address record at or above flash base 0x{flash_base:08x}")]
    MissingFlashBase { flash_base: u32 },

    #[error("line {line}: invalid address record '{record}'")]
    InvalidAddress { line: usize, record: String },

    #[error("line {line}: invalid data token '{token}'")]
    InvalidToken { line: usize, token: String },

    #[error("line {line}: offset 0x{offset:x} is beyond the addressable flash range")]
    TooLarge { line: usize, offset: usize },

    #[error("flash region contains no data")]
    Empty,

    #[error("reading image: {0}")]
    Io(#[from] std::io::Error),
}

/// Linear flash contents, offset 0 is the flash base
#[derive(Clone, PartialEq, Debug)]
pub struct ProgramImage {
    data: Vec<u8>,
}

impl ProgramImage {
    /// Load an image file from disk
    pub fn from_file<P: AsRef<Path>>(path: P, flash_base: u32) -> Result<Self, ImageError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, flash_base)
    }

    /// Parse image text, retaining records at or above `flash_base`
    pub fn parse(text: &str, flash_base: u32) -> Result<Self, ImageError> {
        let mut data = Vec::new();
        let mut retained = false;
        let mut based = false;
        let mut wp = 0usize;

        for (n, line) in text.lines().enumerate() {
            let line_no = n + 1;
            let mut tokens = line.split_whitespace().peekable();

            if let Some(record) = tokens.peek().copied().and_then(|t| t.strip_prefix('@')) {
                let addr = parse_hex(record).ok_or_else(|| ImageError::InvalidAddress {
                    line: line_no,
                    record: line.trim().to_string(),
                })?;

                retained = addr >= flash_base;
                if retained {
                    based = true;
                    wp = (addr - flash_base) as usize;
                    trace!("line {}: flash record 0x{:08x}, offset {}", line_no, addr, wp);
                } else {
                    trace!("line {}: skipping record 0x{:08x}", line_no, addr);
                }

                tokens.next();
            }

            if !retained {
                continue;
            }

            for token in tokens {
                let value = parse_byte(token).ok_or_else(|| ImageError::InvalidToken {
                    line: line_no,
                    token: token.to_string(),
                })?;

                if wp >= planner::ADDRESSABLE {
                    return Err(ImageError::TooLarge { line: line_no, offset: wp });
                }

                if wp >= data.len() {
                    data.resize(wp + 1, 0);
                }
                data[wp] = value;
                wp += 1;
            }
        }

        if !based {
            return Err(ImageError::MissingFlashBase { flash_base });
        }
        if data.is_empty() {
            return Err(ImageError::Empty);
        }

        debug!("Loaded {} byte flash image", data.len());

        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Up to `len` bytes starting at `offset`
    pub fn chunk(&self, offset: usize, len: usize) -> &[u8] {
        let start = offset.min(self.data.len());
        let end = offset.saturating_add(len).min(self.data.len());
        &self.data[start..end]
    }
}

fn parse_hex(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

fn parse_byte(token: &str) -> Option<u8> {
    if token.len() > 2 {
        return None;
    }
    parse_hex(token).map(|v| v as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize, last: usize) -> String {
        let mut s = String::new();
        for r in 0..n {
            let count = if r == n - 1 { last } else { 16 };
            for c in 0..count {
                s.push_str(&format!("{:02X} ", (r * 16 + c) & 0xFF));
            }
            s.push('\n');
        }
        s
    }

    #[test]
    fn skips_ram_region() {
        let text = format!(
            "@00000000\nAA BB CC DD \nEE FF \n@01000000\n{}",
            rows(3, 5)
        );
        let image = ProgramImage::parse(&text, FLASH_BASE).unwrap();

        assert_eq!(image.len(), 16 * 2 + 5);
        for (i, b) in image.as_bytes().iter().enumerate() {
            assert_eq!(*b as usize, i & 0xFF);
        }
    }

    #[test]
    fn honours_record_offsets() {
        let text = "@01000000\n01 02\n@01000010\n03 04 \n";
        let image = ProgramImage::parse(text, FLASH_BASE).unwrap();

        assert_eq!(image.len(), 0x12);
        assert_eq!(&image.as_bytes()[..2], &[1, 2]);
        assert!(image.as_bytes()[2..0x10].iter().all(|b| *b == 0));
        assert_eq!(&image.as_bytes()[0x10..], &[3, 4]);
    }

    #[test]
    fn data_on_record_line() {
        let image = ProgramImage::parse("@1000000 de ad\nbe ef\n", FLASH_BASE).unwrap();
        assert_eq!(image.as_bytes(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn missing_flash_base() {
        let err = ProgramImage::parse("@00000000\n01 02 \n", FLASH_BASE).unwrap_err();
        assert!(matches!(err, ImageError::MissingFlashBase { flash_base: FLASH_BASE }));
    }

    #[test]
    fn rejects_bad_tokens() {
        let err = ProgramImage::parse("@01000000\n01 zz\n", FLASH_BASE).unwrap_err();
        assert!(matches!(err, ImageError::InvalidToken { line: 2, .. }));

        let err = ProgramImage::parse("@01000000\n0102\n", FLASH_BASE).unwrap_err();
        assert!(matches!(err, ImageError::InvalidToken { line: 2, .. }));

        let err = ProgramImage::parse("@010g0000\n", FLASH_BASE).unwrap_err();
        assert!(matches!(err, ImageError::InvalidAddress { line: 1, .. }));
    }

    #[test]
    fn bad_tokens_in_ram_are_ignored() {
        let image = ProgramImage::parse("@0\nnot hex\n@01000000\n42\n", FLASH_BASE).unwrap();
        assert_eq!(image.as_bytes(), &[0x42]);
    }

    #[test]
    fn rejects_unaddressable_offsets() {
        let err = ProgramImage::parse("@01000000\n01\n@02000000\nAB\n", FLASH_BASE).unwrap_err();
        assert!(matches!(err, ImageError::TooLarge { line: 4, offset: 0x100_0000 }));

        let err = ProgramImage::parse("@FFFFFFFF 00\n", FLASH_BASE).unwrap_err();
        assert!(matches!(err, ImageError::TooLarge { line: 1, .. }));

        // a record alone past the range carries no data
        let image = ProgramImage::parse("@01000000\n01\n@02000000\n", FLASH_BASE).unwrap();
        assert_eq!(image.as_bytes(), &[0x01]);
    }

    #[test]
    fn empty_flash_region() {
        let err = ProgramImage::parse("@01000000\n\n", FLASH_BASE).unwrap_err();
        assert!(matches!(err, ImageError::Empty));
    }

    #[test]
    fn deterministic() {
        let text = format!("@01000000\n{}", rows(20, 16));
        let a = ProgramImage::parse(&text, FLASH_BASE).unwrap();
        let b = ProgramImage::parse(&text, FLASH_BASE).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn chunks() {
        let image = ProgramImage::parse(&format!("@01000000\n{}", rows(19, 12)), FLASH_BASE).unwrap();
        assert_eq!(image.len(), 300);
        assert_eq!(image.chunk(0, 256).len(), 256);
        assert_eq!(image.chunk(256, 256).len(), 44);
        assert!(image.chunk(512, 256).is_empty());
    }
}
