// Partition table discovery and root filesystem selection
// Reads MBR and GPT layouts from a payload and picks the region that holds
// the root filesystem.

pub mod gpt;
pub mod mbr;

#[cfg(test)]
mod mbr_tests;

use crate::families::FamilyRegistry;
use firmctl_core::{ByteRange, Config, FirmctlError};
use log::{debug, info};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

pub const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TableKind {
    Mbr,
    Gpt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PartitionType {
    Mbr(u8),
    Gpt(Uuid),
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionType::Mbr(t) => write!(f, "0x{:02X} ({})", t, mbr::type_name(*t)),
            PartitionType::Gpt(guid) => write!(f, "{}", guid.hyphenated()),
        }
    }
}

/// One used slot of a partition table. Offsets are bytes within the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionEntry {
    /// 1-based position in the table.
    pub number: usize,
    pub start: u64,
    pub length: u64,
    pub partition_type: PartitionType,
    /// MBR active flag, GPT legacy-bootable attribute or Linux root type.
    pub bootable: bool,
    pub name: Option<String>,
}

impl PartitionEntry {
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionTable {
    pub kind: TableKind,
    pub entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// Entries must fit the payload and must not overlap each other.
    fn validate(&self, payload_len: u64) -> Result<(), FirmctlError> {
        for entry in &self.entries {
            if entry.start.checked_add(entry.length).map_or(true, |end| end > payload_len) {
                return Err(FirmctlError::out_of_bounds(
                    format!("partition {}", entry.number),
                    entry.start,
                    entry.length,
                    payload_len,
                ));
            }
        }

        let mut sorted: Vec<&PartitionEntry> = self.entries.iter().collect();
        sorted.sort_by_key(|e| e.start);
        for pair in sorted.windows(2) {
            if pair[1].start < pair[0].end() {
                return Err(FirmctlError::corrupt(
                    pair[1].start,
                    format!(
                        "partitions {} and {} overlap",
                        pair[0].number, pair[1].number
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RegionSource {
    Partition { table: TableKind, number: usize },
    /// No partition table; the filesystem starts at payload offset 0.
    WholePayload,
}

impl fmt::Display for RegionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionSource::Partition { table, number } => {
                write!(f, "{:?} partition {}", table, number)
            }
            RegionSource::WholePayload => write!(f, "whole payload"),
        }
    }
}

/// The byte range holding the root filesystem.
#[derive(Debug, Clone)]
pub struct RootRegion {
    pub region: ByteRange,
    pub source: RegionSource,
}

pub struct PartitionLocator {
    families: FamilyRegistry,
    preferred: Option<usize>,
}

impl PartitionLocator {
    pub fn new(families: FamilyRegistry) -> Self {
        Self {
            families,
            preferred: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(FamilyRegistry::with_builtin()).with_partition(config.partition)
    }

    /// Force a 1-based partition number instead of automatic selection.
    pub fn with_partition(mut self, number: Option<usize>) -> Self {
        self.preferred = number;
        self
    }

    /// Parse the partition table at the start of the payload, if there is one.
    pub fn read_table(&self, payload: &ByteRange) -> Result<Option<PartitionTable>, FirmctlError> {
        if !payload.contains(0, SECTOR_SIZE) {
            return Ok(None);
        }
        let sector = payload.read_vec(0, SECTOR_SIZE as usize)?;
        let Some(slots) = mbr::read_slots(&sector) else {
            return Ok(None);
        };

        let table = if mbr::is_protective(&slots) {
            let header = gpt::read_header(payload)?;
            PartitionTable {
                kind: TableKind::Gpt,
                entries: gpt::read_entries(payload, &header)?,
            }
        } else {
            PartitionTable {
                kind: TableKind::Mbr,
                entries: mbr::entries(&slots),
            }
        };

        table.validate(payload.len())?;
        info!(
            "Found {:?} partition table with {} entries",
            table.kind,
            table.entries.len()
        );
        Ok(Some(table))
    }

    pub fn locate_root(&self, payload: &ByteRange) -> Result<RootRegion, FirmctlError> {
        match self.read_table(payload)? {
            Some(table) => self.select_partition(payload, &table),
            None => {
                if self.preferred.is_some() {
                    return Err(FirmctlError::Configuration(
                        "a partition number was given but the payload has no partition table"
                            .to_string(),
                    ));
                }
                match self.families.detect(payload)? {
                    Some(family) => {
                        info!("No partition table; {} filesystem spans the payload", family.name());
                        Ok(RootRegion {
                            region: payload.clone(),
                            source: RegionSource::WholePayload,
                        })
                    }
                    None => Err(FirmctlError::format(
                        0,
                        "payload has neither a partition table nor a filesystem signature",
                    )),
                }
            }
        }
    }

    fn select_partition(
        &self,
        payload: &ByteRange,
        table: &PartitionTable,
    ) -> Result<RootRegion, FirmctlError> {
        let region_of = |entry: &PartitionEntry| -> Result<RootRegion, FirmctlError> {
            Ok(RootRegion {
                region: payload.slice(entry.start, entry.length)?,
                source: RegionSource::Partition {
                    table: table.kind,
                    number: entry.number,
                },
            })
        };

        if let Some(number) = self.preferred {
            let entry = table
                .entries
                .iter()
                .find(|e| e.number == number)
                .ok_or_else(|| {
                    FirmctlError::Configuration(format!(
                        "partition {} not present in {:?} table",
                        number, table.kind
                    ))
                })?;
            info!("Using configured partition {}", number);
            return region_of(entry);
        }

        let flagged: Vec<&PartitionEntry> = table.entries.iter().filter(|e| e.bootable).collect();
        match flagged.as_slice() {
            [only] => {
                info!("Root is flagged partition {}", only.number);
                return region_of(only);
            }
            [] => {}
            many => {
                return Err(FirmctlError::AmbiguousPartition(format!(
                    "partitions {} are all flagged bootable",
                    join_numbers(many)
                )));
            }
        }

        let mut with_signature = Vec::new();
        for entry in &table.entries {
            let region = payload.slice(entry.start, entry.length)?;
            if let Some(family) = self.families.detect(&region)? {
                debug!("Partition {} carries a {} signature", entry.number, family.name());
                with_signature.push(entry);
            }
        }
        match with_signature.as_slice() {
            [only] => {
                info!("Root is partition {}, the only one with a filesystem", only.number);
                region_of(only)
            }
            [] => Err(FirmctlError::format(
                0,
                "no partition carries a recognized filesystem",
            )),
            many => Err(FirmctlError::AmbiguousPartition(format!(
                "partitions {} all carry filesystems and none is flagged",
                join_numbers(many)
            ))),
        }
    }
}

impl Default for PartitionLocator {
    fn default() -> Self {
        Self::new(FamilyRegistry::with_builtin())
    }
}

fn join_numbers(entries: &[&PartitionEntry]) -> String {
    entries
        .iter()
        .map(|e| e.number.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
