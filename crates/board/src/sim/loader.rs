//! Firmware Loader.
//!
//! This module turns a firmware file into a flash image. It performs:
//! 1. **Format detection:** ELF by magic number, Intel HEX by a leading `:` record, raw binary otherwise.
//! 2. **ELF loading:** Copies `.text` then `.data` (its load image follows `.text` in flash) and
//!    reads the optional `.mmcu` section for the declared target model and clock.
//! 3. **Intel HEX loading:** Parses data, EOF and extended segment/linear address records,
//!    verifying every record checksum.

use std::fs;
use std::path::Path;

use object::read::elf::ElfFile32;
use object::{Endianness, Object, ObjectSection};
use tracing::{debug, info};

use crate::common::LoadError;

/// ELF magic number.
const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// Fill value for flash bytes no HEX record covers (erased flash).
const ERASED: u8 = 0xFF;

/// Largest address span a HEX image may cover; far larger than any AVR flash.
const MAX_HEX_SPAN: u64 = 16 * 1024 * 1024;

/// Name of the ELF section carrying target metadata.
const MMCU_SECTION: &str = ".mmcu";

/// `.mmcu` record tags.
mod mmcu_tag {
    /// End of the record list.
    pub const END: u8 = 0;
    /// NUL-terminated target model name.
    pub const NAME: u8 = 1;
    /// Clock frequency in Hz, 32-bit little-endian.
    pub const FREQUENCY: u8 = 2;
}

/// A program image ready to be copied into flash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Image bytes, starting at `base`.
    pub data: Vec<u8>,
    /// Flash address of the first byte; also the initial program counter.
    pub base: u32,
    /// Target model declared by the firmware, if any.
    pub model: Option<String>,
    /// Clock frequency declared by the firmware, if any.
    pub frequency: Option<u32>,
}

impl FirmwareImage {
    /// Wraps raw bytes loaded at flash address 0 with no declared target.
    pub const fn raw(data: Vec<u8>) -> Self {
        Self {
            data,
            base: 0,
            model: None,
            frequency: None,
        }
    }
}

/// Loads a firmware file, detecting its format.
///
/// # Arguments
///
/// * `path` - ELF, Intel HEX or raw binary file.
///
/// # Returns
///
/// The program image plus any declared target model and clock frequency.
pub fn load_firmware(path: &Path) -> Result<FirmwareImage, LoadError> {
    let bytes = fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(LoadError::UnsupportedFormat(path.to_path_buf()));
    }

    let image = if bytes.starts_with(ELF_MAGIC) {
        parse_elf(&bytes)?
    } else if looks_like_hex(&bytes) {
        let text = std::str::from_utf8(&bytes)
            .map_err(|_| LoadError::UnsupportedFormat(path.to_path_buf()))?;
        parse_ihex(text)?
    } else {
        FirmwareImage::raw(bytes)
    };

    info!(
        path = %path.display(),
        base = image.base,
        bytes = image.data.len(),
        model = image.model.as_deref().unwrap_or("-"),
        frequency = image.frequency.unwrap_or(0),
        "firmware loaded"
    );
    Ok(image)
}

fn looks_like_hex(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|&b| b == b':')
}

/// Parses an ELF32 image.
pub fn parse_elf(bytes: &[u8]) -> Result<FirmwareImage, LoadError> {
    let elf = ElfFile32::<Endianness>::parse(bytes).map_err(|e| LoadError::Elf(e.to_string()))?;

    let (text_addr, text) =
        section_data(&elf, ".text")?.ok_or_else(|| LoadError::Elf("no .text section".to_string()))?;
    let base = u32::try_from(text_addr)
        .map_err(|_| LoadError::Elf(format!(".text address {text_addr:#x} out of range")))?;

    let mut data = text.to_vec();
    if let Some((_, init)) = section_data(&elf, ".data")? {
        data.extend_from_slice(init);
    }

    let mut image = FirmwareImage {
        data,
        base,
        model: None,
        frequency: None,
    };
    if let Some((_, mmcu)) = section_data(&elf, MMCU_SECTION)? {
        apply_mmcu(&mut image, mmcu);
    }
    debug!(base, bytes = image.data.len(), "parsed ELF firmware");
    Ok(image)
}

/// Address and contents of a named section, if present.
fn section_data<'d>(
    elf: &ElfFile32<'d, Endianness>,
    name: &str,
) -> Result<Option<(u64, &'d [u8])>, LoadError> {
    elf.section_by_name(name)
        .map(|s| {
            s.data()
                .map(|d| (s.address(), d))
                .map_err(|e| LoadError::Elf(e.to_string()))
        })
        .transpose()
}

/// Reads `.mmcu` tag/length/payload records into the image metadata.
///
/// Unknown tags are skipped; a truncated record ends the list.
fn apply_mmcu(image: &mut FirmwareImage, mut records: &[u8]) {
    while let [tag, len, rest @ ..] = records {
        let len = usize::from(*len);
        if *tag == mmcu_tag::END || rest.len() < len {
            break;
        }
        let (payload, tail) = rest.split_at(len);
        match *tag {
            mmcu_tag::NAME => {
                let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                let name = String::from_utf8_lossy(&payload[..end]).into_owned();
                if !name.is_empty() {
                    image.model = Some(name);
                }
            }
            mmcu_tag::FREQUENCY => {
                if let Some(bytes) = payload.get(..4).and_then(|b| <[u8; 4]>::try_from(b).ok()) {
                    image.frequency = Some(u32::from_le_bytes(bytes));
                }
            }
            _ => {}
        }
        records = tail;
    }
}

/// Intel HEX record types.
mod record {
    pub const DATA: u8 = 0x00;
    pub const EOF: u8 = 0x01;
    pub const EXT_SEGMENT: u8 = 0x02;
    pub const START_SEGMENT: u8 = 0x03;
    pub const EXT_LINEAR: u8 = 0x04;
    pub const START_LINEAR: u8 = 0x05;
}

/// Parses Intel HEX text into one contiguous image.
///
/// Gaps between records are filled with erased-flash bytes (`0xFF`).
pub fn parse_ihex(text: &str) -> Result<FirmwareImage, LoadError> {
    let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();
    let mut upper: u32 = 0;
    let mut span: Option<(u32, u64)> = None;
    let mut saw_eof = false;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let malformed = |reason: &str| LoadError::MalformedHex {
            line: line_no,
            reason: reason.to_string(),
        };

        let body = line
            .strip_prefix(':')
            .ok_or_else(|| malformed("missing ':' start code"))?;
        let bytes = decode_hex(body).ok_or_else(|| malformed("invalid hex digits"))?;
        if bytes.len() < 5 {
            return Err(malformed("record too short"));
        }
        let count = usize::from(bytes[0]);
        if bytes.len() != count + 5 {
            return Err(malformed("byte count does not match record length"));
        }
        let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        if sum != 0 {
            return Err(malformed("checksum mismatch"));
        }

        let offset = u32::from(u16::from_be_bytes([bytes[1], bytes[2]]));
        let kind = bytes[3];
        let payload = &bytes[4..4 + count];

        match kind {
            record::DATA => {
                let addr = upper
                    .checked_add(offset)
                    .ok_or_else(|| malformed("address overflows 32 bits"))?;
                let end = u64::from(addr) + count as u64;
                if end > u64::from(u32::MAX) + 1 {
                    return Err(malformed("record runs past the 32-bit address space"));
                }
                let (low, high) = span.map_or((addr, end), |(low, high)| (low.min(addr), high.max(end)));
                if high - u64::from(low) > MAX_HEX_SPAN {
                    return Err(malformed("records span more than 16 MiB"));
                }
                span = Some((low, high));

                match chunks.last_mut() {
                    Some((start, data)) if u64::from(*start) + data.len() as u64 == u64::from(addr) => {
                        data.extend_from_slice(payload);
                    }
                    _ => chunks.push((addr, payload.to_vec())),
                }
            }
            record::EOF => {
                saw_eof = true;
                break;
            }
            record::EXT_SEGMENT | record::EXT_LINEAR => {
                let [hi, lo] = payload else {
                    return Err(malformed("address record needs two data bytes"));
                };
                let value = u32::from(u16::from_be_bytes([*hi, *lo]));
                upper = if kind == record::EXT_SEGMENT {
                    value << 4
                } else {
                    value << 16
                };
            }
            record::START_SEGMENT | record::START_LINEAR => {}
            _ => return Err(malformed("unknown record type")),
        }
    }

    if !saw_eof {
        debug!("HEX file has no EOF record");
    }

    let Some((base, end)) = span else {
        return Ok(FirmwareImage::default());
    };

    let mut data = vec![ERASED; (end - u64::from(base)) as usize];
    for (addr, bytes) in &chunks {
        let start = (*addr - base) as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }
    Ok(FirmwareImage {
        data,
        base,
        model: None,
        frequency: None,
    })
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
