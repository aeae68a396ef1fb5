//! Maps user region selectors onto absolute device ranges.

use std::fmt;
use std::str::FromStr;

use crate::constants::MASS_ERASE;
use crate::device::Device;
use crate::{Error, Result};

/// Memory area an operation works on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum MemoryType {
    #[default]
    Flash,
    Ram,
    Eeprom,
    /// The whole 32-bit address space, bootloader RAM included
    Any,
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryType::Flash => "Flash",
            MemoryType::Ram => "RAM",
            MemoryType::Eeprom => "EEPROM",
            MemoryType::Any => "entire memory space",
        };
        f.write_str(name)
    }
}

/// `[+]address[:length]`, a leading `+` or `:` makes the address relative
/// to the start of the memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSelector {
    pub address: u32,
    pub relative: bool,
    pub length: Option<u32>,
}

/// `start_page[:n_pages]`, flash only. `n_pages` of 0xFFFF means all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSelector {
    pub start_page: u16,
    pub page_count: Option<u16>,
}

impl PageSelector {
    /// Every page of the flash, starting at page 0.
    pub fn full() -> Self {
        PageSelector {
            start_page: 0,
            page_count: Some(MASS_ERASE),
        }
    }
}

/// `[+]address` to jump to once the operation is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecAddress {
    pub address: u32,
    pub relative: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Pages(PageSelector),
    Address(AddressSelector),
}

/// What the user asked to work on, before the device is known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkspaceSpec {
    pub memory_type: MemoryType,
    pub selector: Option<Selector>,
    /// Bytes the operation will move, used when the selector leaves the
    /// length open (e.g. the size of the file being written)
    pub data_length: Option<u32>,
    pub execute: Option<ExecAddress>,
}

/// Absolute range an operation acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedWorkspace {
    pub memory_type: MemoryType,
    pub start: u32,
    /// Exclusive
    pub end: u32,
    /// First flash page touched, 0 outside flash
    pub start_page: u16,
    /// Flash pages touched, [`MASS_ERASE`] for the whole flash, 0 outside flash
    pub page_count: u16,
    pub execute: Option<u32>,
}

impl ResolvedWorkspace {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_full_flash(&self) -> bool {
        self.page_count == MASS_ERASE
    }
}

impl WorkspaceSpec {
    /// Resolves the selectors against `device`. Pure; no device I/O.
    pub fn resolve(&self, device: &Device) -> Result<ResolvedWorkspace> {
        if matches!(self.selector, Some(Selector::Pages(_))) && self.memory_type != MemoryType::Flash
        {
            return Err(Error::InvalidSelector(
                "page-based addressing is available only for flash".into(),
            ));
        }

        let (allowed_start, allowed_end) = match self.memory_type {
            MemoryType::Flash => (device.flash.start, device.flash.end),
            MemoryType::Ram => (device.ram.reserved, device.ram.end),
            MemoryType::Eeprom if !device.has_eeprom() => return Err(Error::NoEeprom),
            MemoryType::Eeprom => (device.eeprom.start, device.eeprom.end),
            MemoryType::Any => (0, u32::MAX),
        };
        if self.execute.is_some() && !matches!(self.memory_type, MemoryType::Flash | MemoryType::Ram)
        {
            return Err(Error::InvalidSelector(
                "execution is only possible from flash or RAM".into(),
            ));
        }
        log::debug!("Working with {}", self.memory_type);
        let page_size = device.flash.page_size as u64;
        let (allowed_start_64, allowed_end_64) = (allowed_start as u64, allowed_end as u64);

        let (start, explicit_page, page_count, length) = match self.selector {
            Some(Selector::Pages(p)) => (
                allowed_start_64 + p.start_page as u64 * page_size,
                Some(p.start_page as u64),
                p.page_count,
                None,
            ),
            Some(Selector::Address(a)) if a.relative => {
                (allowed_start_64 + a.address as u64, None, None, a.length)
            }
            Some(Selector::Address(a)) => (a.address as u64, None, None, a.length),
            None => (allowed_start_64, None, None, None),
        };

        let length = match (length.or(self.data_length), page_count) {
            (Some(len), _) => len as u64,
            (None, Some(MASS_ERASE)) => allowed_end_64 - allowed_start_64,
            (None, Some(n)) => n as u64 * page_size,
            (None, None) => allowed_end_64.saturating_sub(start),
        };
        let end = start + length;

        if start % 4 != 0 {
            return Err(Error::InvalidSelector(format!(
                "start address 0x{:08x} is not 32-bit aligned",
                start
            )));
        }
        if start < allowed_start_64 || end > allowed_end_64 {
            return Err(Error::RegionOutOfBounds {
                start,
                end,
                allowed_start,
                allowed_end,
            });
        }

        let (start_page, page_count) = if self.memory_type == MemoryType::Flash {
            let flash_start = device.flash.start as u64;
            let start_page = explicit_page.unwrap_or((start - flash_start) / page_size);
            let mut count = match page_count {
                Some(n) => n as u64,
                None => {
                    let offset = start - (start_page * page_size + flash_start);
                    (offset + length).div_ceil(page_size)
                }
            };
            if start_page == 0 && count * page_size >= device.flash_size() as u64 {
                count = MASS_ERASE as u64;
            }
            let start_page = u16::try_from(start_page)
                .map_err(|_| Error::InvalidSelector(format!("page {} out of range", start_page)))?;
            let count = u16::try_from(count)
                .map_err(|_| Error::InvalidSelector(format!("{} pages out of range", count)))?;
            (start_page, count)
        } else {
            (0, 0)
        };

        let execute = match self.execute {
            None => None,
            Some(exec) => {
                // an absolute 0 stands for the start of flash
                let address = match (exec.relative, exec.address) {
                    (true, offset) => allowed_start
                        .checked_add(offset)
                        .ok_or(Error::BadExecuteAddress(offset))?,
                    (false, 0) => device.flash.start,
                    (false, address) => address,
                };
                let flash = device.flash.start..device.flash.end;
                if !flash.contains(&address) && !device.usable_ram().contains(&address) {
                    return Err(Error::BadExecuteAddress(address));
                }
                Some(address)
            }
        };

        let ws = ResolvedWorkspace {
            memory_type: self.memory_type,
            start: start as u32,
            end: end as u32,
            start_page,
            page_count,
            execute,
        };
        log::debug!(
            "Starting at 0x{:08x} stopping at 0x{:08x}, length is {} bytes",
            ws.start,
            ws.end,
            ws.len()
        );
        if self.memory_type == MemoryType::Flash {
            if ws.is_full_flash() {
                log::debug!("Affected entire flash memory");
            } else {
                log::debug!("Affected {} pages from page {}", ws.page_count, ws.start_page);
            }
        }
        Ok(ws)
    }
}

/// Parses a C-style integer: `0x` hex, leading `0` octal, else decimal.
pub fn parse_int(s: &str) -> Result<u32> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        u32::from_str_radix(&s[1..], 8)
    } else {
        s.parse()
    };
    parsed.map_err(|_| Error::InvalidSelector(format!("invalid number {:?}", s)))
}

impl FromStr for AddressSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let relative = s.starts_with('+') || s.starts_with(':');
        let s = s.strip_prefix('+').unwrap_or(s);
        // a zero length leaves the length open
        let (address, length) = match s.split_once(':') {
            Some((a, l)) => (a, Some(parse_int(l)?).filter(|&n| n != 0)),
            None => (s, None),
        };
        let address = if address.is_empty() {
            0
        } else {
            parse_int(address)?
        };
        Ok(AddressSelector {
            address,
            relative,
            length,
        })
    }
}

impl FromStr for PageSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (start, count) = match s.split_once(':') {
            Some((a, n)) => (a, Some(parse_int(n)?)),
            None => (s, None),
        };
        let start_page = u16::try_from(parse_int(start)?)
            .map_err(|_| Error::InvalidSelector(format!("start page {:?} out of range", start)))?;
        let page_count = match count {
            None | Some(0) => None,
            Some(n) => Some(u16::try_from(n).map_err(|_| {
                Error::InvalidSelector("page count must be between 0 and 65535".into())
            })?),
        };
        Ok(PageSelector {
            start_page,
            page_count,
        })
    }
}

impl FromStr for ExecAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let relative = s.starts_with('+');
        let address = parse_int(s.strip_prefix('+').unwrap_or(s))?;
        if address % 4 != 0 {
            return Err(Error::InvalidSelector(
                "execution address must be word-aligned".into(),
            ));
        }
        Ok(ExecAddress { address, relative })
    }
}
