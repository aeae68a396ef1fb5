//! Firmware file formats
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str;

use anyhow::{Context, Result};
use ihex::Record;

use crate::flashing::InputLength;

/// Path standing for stdin or stdout.
pub const STDIO_PATH: &str = "-";

const IHEX_EXTENSIONS: &[&str] = &["ihex", "ihe", "h86", "hex", "a43", "a90"];

/// Bytes per Intel HEX data record when writing.
const IHEX_RECORD_LEN: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    PlainHex,
    IntelHex,
    Binary,
}

/// Data source for a write, with how much of it there is.
pub struct FirmwareInput {
    pub reader: Box<dyn Read>,
    pub length: InputLength,
}

/// Opens `path` for writing to the device. `-` streams stdin as raw
/// binary; files are decoded up front so their size is known.
pub fn open_input(path: &str, force_binary: bool) -> Result<FirmwareInput> {
    if path == STDIO_PATH {
        log::info!("Reading raw binary from stdin");
        return Ok(FirmwareInput {
            reader: Box::new(io::stdin()),
            length: InputLength::Streamed,
        });
    }
    let p = Path::new(path);
    let raw = std::fs::read(p).with_context(|| format!("failed to open {}", p.display()))?;
    let data = decode_firmware(p, raw, force_binary)
        .with_context(|| format!("failed to decode {}", p.display()))?;
    let length = u32::try_from(data.len())
        .map(InputLength::Known)
        .context("firmware larger than the address space")?;
    log::info!("Firmware size: {} bytes", data.len());
    Ok(FirmwareInput {
        reader: Box::new(io::Cursor::new(data)),
        length,
    })
}

pub fn decode_firmware(path: &Path, raw: Vec<u8>, force_binary: bool) -> Result<Vec<u8>> {
    let format = if force_binary {
        FirmwareFormat::Binary
    } else {
        guess_format(path, &raw)
    };
    log::info!("Read {} as {:?} format", path.display(), format);
    match format {
        FirmwareFormat::PlainHex => read_hex(str::from_utf8(&raw)?),
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        FirmwareFormat::Binary => Ok(raw),
    }
}

fn has_ihex_extension(path: &Path) -> bool {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    IHEX_EXTENSIONS.contains(&&*ext)
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    if has_ihex_extension(path) {
        return FirmwareFormat::IntelHex;
    }
    if raw.is_empty() {
        return FirmwareFormat::Binary;
    }

    if raw[0] == b':'
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else if raw
        .iter()
        .all(|&c| c.is_ascii_hexdigit() || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

pub fn read_hex(data: &str) -> Result<Vec<u8>> {
    let digits: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(hex::decode(digits)?)
}

pub fn read_ihex(data: &str) -> Result<Vec<u8>> {
    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;
                records.push((offset, value));
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    if let Some((start, _)) = records.iter().min_by_key(|(addr, _)| *addr) {
        log::debug!("Intel HEX image starts at 0x{:08x}", start);
    }
    merge_sections(records)
}

/// Flattens address-tagged sections into one image starting at the lowest
/// address. Gaps read as erased flash (0xFF).
fn merge_sections(mut sections: Vec<(u32, Vec<u8>)>) -> Result<Vec<u8>> {
    sections.sort_by_key(|(addr, _)| *addr);

    let Some(start_address) = sections.first().map(|(addr, _)| *addr) else {
        return Ok(Vec::new());
    };
    let end_address = sections
        .iter()
        .map(|(addr, data)| *addr as u64 + data.len() as u64)
        .max()
        .unwrap_or(start_address as u64);

    let total_size = end_address - start_address as u64;

    let mut binary = vec![0xFFu8; total_size as usize];
    let mut covered = start_address as u64;
    for (addr, sect) in sections {
        if (addr as u64) < covered {
            log::warn!("Overlapping data at 0x{:08x}, later record wins", addr);
        }
        let sect_start = (addr - start_address) as usize;
        binary[sect_start..sect_start + sect.len()].copy_from_slice(&sect);
        covered = covered.max(addr as u64 + sect.len() as u64);
    }
    Ok(binary)
}

/// Destination for data read from the device.
pub enum FirmwareOutput {
    Binary(Box<dyn Write>),
    /// Buffered until [`FirmwareOutput::finish`], then encoded in one go
    IntelHex {
        path: PathBuf,
        base_address: u32,
        data: Vec<u8>,
    },
}

/// Opens the sink for a read. `-` streams raw binary to stdout; paths with
/// an Intel HEX extension get Intel HEX with records placed at
/// `base_address`.
pub fn open_output(path: &str, force_binary: bool, base_address: u32) -> Result<FirmwareOutput> {
    if path == STDIO_PATH {
        return Ok(FirmwareOutput::Binary(Box::new(io::stdout())));
    }
    let p = Path::new(path);
    if !force_binary && has_ihex_extension(p) {
        log::info!("Writing {} as Intel HEX", p.display());
        return Ok(FirmwareOutput::IntelHex {
            path: p.to_path_buf(),
            base_address,
            data: Vec::new(),
        });
    }
    let file = File::create(p).with_context(|| format!("failed to create {}", p.display()))?;
    Ok(FirmwareOutput::Binary(Box::new(BufWriter::new(file))))
}

impl FirmwareOutput {
    /// Flushes everything written so far to its destination.
    pub fn finish(self) -> Result<()> {
        match self {
            FirmwareOutput::Binary(mut w) => Ok(w.flush()?),
            FirmwareOutput::IntelHex {
                path,
                base_address,
                data,
            } => {
                let text = write_ihex(base_address, &data)?;
                std::fs::write(&path, text)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                Ok(())
            }
        }
    }
}

impl Write for FirmwareOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FirmwareOutput::Binary(w) => w.write(buf),
            FirmwareOutput::IntelHex { data, .. } => {
                data.extend_from_slice(buf);
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FirmwareOutput::Binary(w) => w.flush(),
            FirmwareOutput::IntelHex { .. } => Ok(()),
        }
    }
}

/// Encodes `data` as Intel HEX located at `base_address`.
pub fn write_ihex(base_address: u32, data: &[u8]) -> Result<String> {
    let mut records = vec![];
    let mut upper = None;
    let mut address = base_address as u64;
    let mut rest = data;
    while !rest.is_empty() {
        if address > u32::MAX as u64 {
            anyhow::bail!("data runs past the end of the address space");
        }
        let high = (address >> 16) as u16;
        if upper != Some(high) {
            records.push(Record::ExtendedLinearAddress(high));
            upper = Some(high);
        }
        // records never straddle a 64 KiB segment
        let room = 0x1_0000 - (address & 0xFFFF);
        let len = (IHEX_RECORD_LEN as u64).min(room).min(rest.len() as u64) as usize;
        records.push(Record::Data {
            offset: (address & 0xFFFF) as u16,
            value: rest[..len].to_vec(),
        });
        rest = &rest[len..];
        address += len as u64;
    }
    records.push(Record::EndOfFile);
    Ok(ihex::create_object_file_representation(&records)?)
}
