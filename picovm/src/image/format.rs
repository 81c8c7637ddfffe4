//! Image layout constants and header parsing.
//!
//! ```text
//! 0   u8  bytecode version
//! 1   u8  header size
//! 2   u8  required engine version
//! 3   u8  reserved
//! 4   u16 bytecode size
//! 6   u16 CRC-16/CCITT-FALSE of bytes 8..size
//! 8   u32 required feature flags
//! 12  u16 section offsets[8]
//! ```
use crate::error::Error;
use crate::header::Header;

pub const BYTECODE_VERSION: u8 = 1;
pub const ENGINE_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 28;
pub const CRC_START: usize = 8;

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct FeatureFlags: u32 {
        const FLOAT_SUPPORT = 1 << 0;
    }
}

pub const SUPPORTED_FEATURES: FeatureFlags = FeatureFlags::FLOAT_SUPPORT;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Section {
    Import = 0,
    Export,
    ShortCallTable,
    Builtins,
    StringTable,
    Rom,
    Globals,
    Heap,
}

pub const SECTION_COUNT: usize = 8;

impl Section {
    pub const ALL: [Section; SECTION_COUNT] = [
        Section::Import,
        Section::Export,
        Section::ShortCallTable,
        Section::Builtins,
        Section::StringTable,
        Section::Rom,
        Section::Globals,
        Section::Heap,
    ];

    /// Size of one table entry, for sections that are tables.
    fn entry_size(self) -> Option<usize> {
        match self {
            Section::Import | Section::StringTable | Section::Globals => Some(2),
            Section::Export | Section::ShortCallTable => Some(4),
            Section::Builtins => Some(2 * BUILTIN_COUNT),
            Section::Rom | Section::Heap => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Builtin {
    /// Handle to the global holding the runtime intern list head.
    InternedStrings = 0,
    ArrayProto,
    StrProto,
    PromiseProto,
    /// Function run by job closures to call a subscriber.
    AsyncContinue,
    /// Function wrapped by host completion callbacks.
    AsyncHostCallback,
}

pub const BUILTIN_COUNT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub bytecode_version: u8,
    pub header_size: u8,
    pub required_engine_version: u8,
    pub bytecode_size: u16,
    pub crc: u16,
    pub required_features: u32,
    pub section_offsets: [u16; SECTION_COUNT],
}

impl ImageHeader {
    /// Parse and validate the header of `image`, including its CRC and the
    /// layout of its sections.
    pub fn parse(image: &[u8]) -> Result<Self, Error> {
        if image.len() < HEADER_SIZE {
            return Err(Error::InvalidBytecode("image shorter than its header"));
        }
        let bytecode_version = image[0];
        if bytecode_version != BYTECODE_VERSION {
            return Err(Error::VersionMismatch {
                found: bytecode_version,
                supported: BYTECODE_VERSION,
            });
        }
        let header_size = image[1];
        if header_size as usize != HEADER_SIZE {
            return Err(Error::InvalidBytecode("unexpected header size"));
        }
        let required_engine_version = image[2];
        if required_engine_version > ENGINE_VERSION {
            return Err(Error::VersionMismatch {
                found: required_engine_version,
                supported: ENGINE_VERSION,
            });
        }
        if image[3] != 0 {
            return Err(Error::InvalidBytecode("reserved header byte is set"));
        }
        let bytecode_size = read_u16(image, 4);
        if bytecode_size as usize != image.len() {
            return Err(Error::BytecodeSizeMismatch {
                expected: bytecode_size as usize,
                actual: image.len(),
            });
        }
        let crc = read_u16(image, 6);
        let actual = crc16_ccitt(&image[CRC_START..]);
        if crc != actual {
            return Err(Error::CrcMismatch {
                expected: crc,
                actual,
            });
        }
        let required_features = read_u32(image, 8);
        if FeatureFlags::from_bits(required_features)
            .is_none_or(|flags| !SUPPORTED_FEATURES.contains(flags))
        {
            return Err(Error::FeatureMismatch {
                required: required_features,
                supported: SUPPORTED_FEATURES.bits(),
            });
        }

        let mut section_offsets = [0u16; SECTION_COUNT];
        for (i, offset) in section_offsets.iter_mut().enumerate() {
            *offset = read_u16(image, 12 + i * 2);
        }
        let header = Self {
            bytecode_version,
            header_size,
            required_engine_version,
            bytecode_size,
            crc,
            required_features,
            section_offsets,
        };
        header.validate_sections()?;
        Ok(header)
    }

    fn validate_sections(&self) -> Result<(), Error> {
        let mut previous = HEADER_SIZE;
        for section in Section::ALL {
            let start = self.section_offsets[section as usize] as usize;
            if start < previous {
                return Err(Error::InvalidBytecode("section offsets out of order"));
            }
            previous = start;
        }
        if previous > self.bytecode_size as usize {
            return Err(Error::InvalidBytecode("section beyond end of image"));
        }
        for section in Section::ALL {
            let range = self.section_range(section);
            if let Some(entry) = section.entry_size() {
                let len = range.len();
                let ok = match section {
                    Section::Builtins => len == entry,
                    _ => len % entry == 0,
                };
                if !ok {
                    return Err(Error::InvalidBytecode("section size not a whole number of entries"));
                }
            }
        }
        if self.section_offsets[Section::Globals as usize] % 4 != 0 {
            return Err(Error::InvalidBytecode("globals section must be 4-byte aligned"));
        }
        if self.section_offsets[Section::Heap as usize] % 2 != 0 {
            return Err(Error::InvalidBytecode("heap section must be 2-byte aligned"));
        }
        Ok(())
    }

    /// Byte range of `section`. The last section runs to the image end.
    pub fn section_range(&self, section: Section) -> std::ops::Range<usize> {
        let start = self.section_offsets[section as usize] as usize;
        let end = match Section::ALL.get(section as usize + 1) {
            Some(next) => self.section_offsets[*next as usize] as usize,
            None => self.bytecode_size as usize,
        };
        start..end
    }
}

/// CRC-16/CCITT-FALSE: polynomial 0x1021, initial value 0xFFFF, no
/// reflection, no final xor.
pub fn crc16_ccitt(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in bytes {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[inline]
pub fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
pub fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
pub fn write_u16(bytes: &mut [u8], at: usize, value: u16) {
    bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

/// Recompute and store the size and CRC fields of a finished image.
pub fn seal(image: &mut [u8]) {
    let size = image.len() as u16;
    write_u16(image, 4, size);
    let crc = crc16_ccitt(&image[CRC_START..]);
    write_u16(image, 6, crc);
}

/// Iterator over the items of the ROM section as `(body offset, header)`.
///
/// Item bodies start 4-aligned; the bytes in between are padding.
pub struct RomItems<'a> {
    image: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> RomItems<'a> {
    pub fn new(image: &'a [u8], header: &ImageHeader) -> Self {
        let rom = header.section_range(Section::Rom);
        Self {
            image,
            pos: rom.start,
            end: rom.end,
        }
    }
}

impl Iterator for RomItems<'_> {
    type Item = (usize, Header);

    fn next(&mut self) -> Option<Self::Item> {
        let at = (self.pos + 2).next_multiple_of(4) - 2;
        if at + 2 > self.end {
            return None;
        }
        let header = Header(read_u16(self.image, at));
        let body = at + 2;
        self.pos = body + header.size();
        Some((body, header))
    }
}
