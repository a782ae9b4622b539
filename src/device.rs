//! Device registry: per-family tables mapping a device id read from silicon
//! to memory geometry and a human name.

use anyhow::Result;
use serde::Deserialize;

use crate::error::Error;

/// Supported ICSP protocol families. The operator picks the family up
/// front; the registry only disambiguates variants within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// Enhanced mid-range PIC16F183xx, low-voltage ICSP
    Pic16,
    /// PIC24FJxxxxGX6xx, enhanced ICSP
    Pic24,
    /// dsPIC33EPxxGS50x, enhanced ICSP
    Dspic33,
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::Pic16 => write!(f, "pic16"),
            Family::Pic24 => write!(f, "pic24"),
            Family::Dspic33 => write!(f, "dspic33"),
        }
    }
}

/// One family table, as embedded in the YAML registry.
#[derive(Debug, Clone, Deserialize)]
pub struct FamilyTable {
    pub name: String,
    pub family: Family,
    pub description: String,
    #[serde(deserialize_with = "parse_hex_u32")]
    pub program_memory_size: u32,
    pub variants: Vec<Chip>,
}

/// One supported chip variant.
#[derive(Debug, Clone, Deserialize)]
pub struct Chip {
    pub name: String,
    #[serde(deserialize_with = "parse_hex_u16")]
    pub device_id: u16,
    #[serde(deserialize_with = "parse_hex_u32")]
    pub code_memory_size: u32,
    /// Patched in from the family table on lookup.
    #[serde(default)]
    pub program_memory_size: u32,
}

impl std::fmt::Display for Chip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(0x{:04x})", self.name, self.device_id)
    }
}

pub struct ChipDB {
    families: Vec<FamilyTable>,
}

impl ChipDB {
    pub fn load() -> Result<Self> {
        Ok(ChipDB {
            families: vec![
                serde_yaml::from_str(include_str!("../devices/pic16f183xx.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/pic24fjxxxxgx6xx.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/dspic33epxxgs50x.yaml"))?,
            ],
        })
    }

    /// Linear scan of the selected family's table; first match wins.
    pub fn find_chip(family: Family, device_id: u16) -> Result<Chip> {
        let db = ChipDB::load()?;

        let table = db
            .families
            .iter()
            .find(|t| t.family == family)
            .ok_or_else(|| anyhow::format_err!("no registry table for family {}", family))?;

        log::debug!("searching family table: {}", table.name);
        let mut chip = table
            .variants
            .iter()
            .find(|c| c.device_id == device_id)
            .cloned()
            .ok_or(Error::UnknownDevice { device_id })?;
        chip.program_memory_size = table.program_memory_size;
        Ok(chip)
    }
}

fn parse_hex_u32<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(serde::de::Error::custom)
    } else {
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn parse_hex_u16<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = parse_hex_u32(deserializer)?;
    u16::try_from(value).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_loads() {
        let db = ChipDB::load().unwrap();
        assert_eq!(db.families.len(), 3);
        assert!(db.families.iter().all(|t| !t.variants.is_empty()));
    }

    #[test]
    fn pic16f18326_resolves() {
        let chip = ChipDB::find_chip(Family::Pic16, 0x30A4).unwrap();
        assert_eq!(chip.name, "PIC16F18326");
        assert_eq!(chip.code_memory_size, 0x3FFF);
        assert_ne!(chip.program_memory_size, 0);
    }

    #[test]
    fn unknown_id_is_typed_error() {
        let err = ChipDB::find_chip(Family::Pic16, 0xFFFF).unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::UnknownDevice { device_id }) => assert_eq!(*device_id, 0xFFFF),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn pic24_table_has_1024k_parts() {
        let chip = ChipDB::find_chip(Family::Pic24, 0x6018).unwrap();
        assert_eq!(chip.name, "PIC24FJ1024GA606");
        assert_eq!(chip.code_memory_size, 0x0ABFFE);
    }
}
