// MBR partition table reader
use super::{PartitionEntry, PartitionType, SECTOR_SIZE};
use log::{debug, info};

pub const MBR_SIGNATURE_OFFSET: usize = 510;
pub const MBR_ENTRIES_OFFSET: usize = 446;
pub const MBR_ENTRY_SIZE: usize = 16;
pub const GPT_PROTECTIVE_TYPE: u8 = 0xEE;

/// Raw view of one of the four primary slots.
#[derive(Debug, Clone)]
pub struct MbrSlot {
    pub number: usize,
    pub status: u8,
    pub partition_type: u8,
    pub start_lba: u32,
    pub size_sectors: u32,
}

impl MbrSlot {
    fn parse(number: usize, entry: &[u8]) -> Self {
        MbrSlot {
            number,
            status: entry[0],
            partition_type: entry[4],
            start_lba: u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]),
            size_sectors: u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]]),
        }
    }

    pub fn is_used(&self) -> bool {
        self.partition_type != 0 && self.size_sectors != 0
    }

    pub fn is_extended(&self) -> bool {
        matches!(self.partition_type, 0x05 | 0x0F | 0x85)
    }
}

pub fn type_name(partition_type: u8) -> &'static str {
    match partition_type {
        0x00 => "Empty",
        0x01 => "FAT12",
        0x04 => "FAT16 (<32MB)",
        0x05 => "Extended",
        0x06 => "FAT16",
        0x07 => "NTFS/exFAT",
        0x0B => "FAT32 (CHS)",
        0x0C => "FAT32 (LBA)",
        0x0E => "FAT16 (LBA)",
        0x0F => "Extended (LBA)",
        0x82 => "Linux swap",
        0x83 => "Linux",
        0x85 => "Linux extended",
        0xEE => "GPT Protective",
        _ => "Unknown",
    }
}

/// The four primary slots, or `None` when the sector is not a plausible MBR.
///
/// A plausible MBR has the 0x55AA signature, status bytes of 0x00 or 0x80
/// only, and at least one used slot.
pub fn read_slots(sector: &[u8]) -> Option<Vec<MbrSlot>> {
    if sector.len() < SECTOR_SIZE as usize {
        return None;
    }
    if sector[MBR_SIGNATURE_OFFSET] != 0x55 || sector[MBR_SIGNATURE_OFFSET + 1] != 0xAA {
        return None;
    }

    let slots: Vec<MbrSlot> = (0..4)
        .map(|i| {
            let offset = MBR_ENTRIES_OFFSET + i * MBR_ENTRY_SIZE;
            MbrSlot::parse(i + 1, &sector[offset..offset + MBR_ENTRY_SIZE])
        })
        .collect();

    if let Some(bad) = slots.iter().find(|s| s.status != 0x00 && s.status != 0x80) {
        debug!(
            "Boot sector signature present but slot {} has status 0x{:02X}; not an MBR",
            bad.number, bad.status
        );
        return None;
    }
    if !slots.iter().any(MbrSlot::is_used) {
        return None;
    }
    Some(slots)
}

/// True when the MBR only protects a GPT.
pub fn is_protective(slots: &[MbrSlot]) -> bool {
    slots.iter().any(|s| s.partition_type == GPT_PROTECTIVE_TYPE)
}

/// Convert used primary slots to entries. Extended containers are skipped.
pub fn entries(slots: &[MbrSlot]) -> Vec<PartitionEntry> {
    let mut entries = Vec::new();
    for slot in slots.iter().filter(|s| s.is_used()) {
        if slot.is_extended() {
            info!(
                "Skipping extended partition {} (logical partitions are not followed)",
                slot.number
            );
            continue;
        }
        debug!(
            "MBR partition {}: type 0x{:02X} ({}), start LBA {}, {} sectors{}",
            slot.number,
            slot.partition_type,
            type_name(slot.partition_type),
            slot.start_lba,
            slot.size_sectors,
            if slot.status == 0x80 { ", active" } else { "" }
        );
        entries.push(PartitionEntry {
            number: slot.number,
            start: slot.start_lba as u64 * SECTOR_SIZE,
            length: slot.size_sectors as u64 * SECTOR_SIZE,
            partition_type: PartitionType::Mbr(slot.partition_type),
            bootable: slot.status == 0x80,
            name: None,
        });
    }
    entries
}
