//! STM32 device catalog, with the memory geography the bootloader exposes
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RamRegion {
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub start: u32,
    /// First byte not used by the bootloader itself
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub reserved: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashRegion {
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub start: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub end: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub pages_per_sector: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub page_size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub start: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub end: u32,
}

impl Region {
    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Represents one STM32 product, as identified by the bootloader GET-ID reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(deserialize_with = "parse_product_id")]
    pub product_id: u16,
    pub ram: RamRegion,
    pub flash: FlashRegion,
    pub system_memory: Region,
    pub option_bytes: Region,
    /// Zero-width when the part has no data EEPROM
    #[serde(default)]
    pub eeprom: Region,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:04x})", self.name, self.product_id)
    }
}

impl Device {
    pub fn flash_size(&self) -> u32 {
        self.flash.end - self.flash.start
    }

    /// Number of pages covering the whole flash.
    pub fn flash_pages(&self) -> u32 {
        self.flash_size() / self.flash.page_size
    }

    pub fn flash_sectors(&self) -> u32 {
        self.flash_size() / (self.flash.page_size * self.flash.pages_per_sector)
    }

    pub fn has_eeprom(&self) -> bool {
        !self.eeprom.is_empty()
    }

    /// RAM left to the user once the bootloader's working area is excluded.
    pub fn usable_ram(&self) -> Range<u32> {
        self.ram.reserved..self.ram.end
    }
}

#[derive(Debug, Deserialize)]
struct Catalog {
    devices: Vec<Device>,
}

/// Known devices keyed by product ID.
pub struct DeviceDB {
    devices: BTreeMap<u16, Device>,
}

impl DeviceDB {
    pub fn load() -> Result<Self> {
        Self::from_yaml(include_str!("../devices/stm32.yaml"))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let catalog: Catalog = serde_yaml::from_str(raw)?;
        let devices = catalog
            .devices
            .into_iter()
            .map(|d| (d.product_id, d))
            .collect();
        Ok(DeviceDB { devices })
    }

    pub fn find(&self, product_id: u16) -> Option<&Device> {
        self.devices.get(&product_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

fn parse_number(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(kib) = s
        .strip_suffix("KiB")
        .or_else(|| s.strip_suffix("KB"))
        .or_else(|| s.strip_suffix('K'))
    {
        kib.parse::<u32>().ok()?.checked_mul(1024)
    } else {
        s.parse().ok()
    }
}

fn parse_address_and_offset<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    parse_number(&s)
        .ok_or_else(|| serde::de::Error::custom(format!("error while parsing {:?}", s)))
}

fn parse_product_id<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = parse_address_and_offset(deserializer)?;
    u16::try_from(v).map_err(|_| serde::de::Error::custom(format!("product id 0x{:x} too large", v)))
}
