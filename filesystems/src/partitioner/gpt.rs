// GPT partition table reader
use super::{PartitionEntry, PartitionType, SECTOR_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use firmctl_core::{ByteRange, FirmctlError};
use log::debug;
use uuid::Uuid;

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_HEADER_LBA: u64 = 1;
const MIN_HEADER_SIZE: usize = 92;
const MIN_ENTRY_SIZE: usize = 128;
const MAX_ENTRY_SIZE: usize = 512;
const MAX_ENTRIES: u32 = 4096;
/// Largest entry array read into memory.
const MAX_ARRAY_LEN: u64 = 1024 * 1024;

/// Legacy BIOS bootable attribute bit.
pub const ATTR_LEGACY_BIOS_BOOTABLE: u64 = 1 << 2;

/// Linux root partition type GUIDs (x86-64, ARM64, ARM32).
pub const LINUX_ROOT_TYPES: [&str; 3] = [
    "4f68bce3-e8cd-4db1-96e7-fbcaf984b709",
    "b921b045-1df0-41c3-af44-4c6f280d3fae",
    "69dad710-2ce4-4e3c-b16c-21a1d49abed3",
];

pub fn is_linux_root_type(type_guid: &Uuid) -> bool {
    let text = type_guid.hyphenated().to_string();
    LINUX_ROOT_TYPES.contains(&text.as_str())
}

#[derive(Debug, Clone)]
pub struct GptHeader {
    pub entries_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
    pub entries_crc32: u32,
}

/// Read and check the primary header at LBA 1.
pub fn read_header(payload: &ByteRange) -> Result<GptHeader, FirmctlError> {
    let header_offset = GPT_HEADER_LBA * SECTOR_SIZE;
    let sector = payload.read_vec(header_offset, SECTOR_SIZE as usize)?;

    if &sector[0..8] != GPT_SIGNATURE {
        return Err(FirmctlError::format(
            header_offset,
            "protective MBR present but no 'EFI PART' header at LBA 1",
        ));
    }

    let header_size = LittleEndian::read_u32(&sector[12..]) as usize;
    if header_size < MIN_HEADER_SIZE || header_size > sector.len() {
        return Err(FirmctlError::corrupt(
            header_offset + 12,
            format!("GPT header size {} invalid", header_size),
        ));
    }

    let stored_crc = LittleEndian::read_u32(&sector[16..]);
    let mut covered = sector[..header_size].to_vec();
    covered[16..20].fill(0);
    let actual_crc = crc32fast::hash(&covered);
    if stored_crc != actual_crc {
        return Err(FirmctlError::corrupt(
            header_offset + 16,
            format!(
                "GPT header CRC32 0x{:08X} does not match computed 0x{:08X}",
                stored_crc, actual_crc
            ),
        ));
    }

    let header = GptHeader {
        entries_lba: LittleEndian::read_u64(&sector[72..]),
        entry_count: LittleEndian::read_u32(&sector[80..]),
        entry_size: LittleEndian::read_u32(&sector[84..]),
        entries_crc32: LittleEndian::read_u32(&sector[88..]),
    };

    let entry_size = header.entry_size as usize;
    if !(MIN_ENTRY_SIZE..=MAX_ENTRY_SIZE).contains(&entry_size) || entry_size % 8 != 0 {
        return Err(FirmctlError::corrupt(
            header_offset + 84,
            format!("GPT entry size {} invalid", header.entry_size),
        ));
    }
    if header.entry_count > MAX_ENTRIES {
        return Err(FirmctlError::corrupt(
            header_offset + 80,
            format!("GPT declares {} entries", header.entry_count),
        ));
    }
    let array_len = header.entry_count as u64 * header.entry_size as u64;
    if array_len > MAX_ARRAY_LEN {
        return Err(FirmctlError::corrupt(
            header_offset + 80,
            format!("GPT entry array of {} bytes exceeds {}", array_len, MAX_ARRAY_LEN),
        ));
    }
    Ok(header)
}

/// Read, check and decode the partition entry array.
pub fn read_entries(payload: &ByteRange, header: &GptHeader) -> Result<Vec<PartitionEntry>, FirmctlError> {
    let array_offset = header.entries_lba.checked_mul(SECTOR_SIZE).ok_or_else(|| {
        FirmctlError::corrupt(GPT_HEADER_LBA * SECTOR_SIZE + 72, "GPT entry array LBA overflows")
    })?;
    let array_len = header.entry_count as u64 * header.entry_size as u64;
    if !payload.contains(array_offset, array_len) {
        return Err(FirmctlError::out_of_bounds(
            "GPT entry array",
            array_offset,
            array_len,
            payload.len(),
        ));
    }
    let array = payload.read_vec(array_offset, array_len as usize)?;

    let actual_crc = crc32fast::hash(&array);
    if actual_crc != header.entries_crc32 {
        return Err(FirmctlError::corrupt(
            array_offset,
            format!(
                "GPT entry array CRC32 0x{:08X} does not match computed 0x{:08X}",
                header.entries_crc32, actual_crc
            ),
        ));
    }

    let mut entries = Vec::new();
    for (index, raw) in array.chunks_exact(header.entry_size as usize).enumerate() {
        let mut type_bytes = [0u8; 16];
        type_bytes.copy_from_slice(&raw[0..16]);
        if type_bytes.iter().all(|&b| b == 0) {
            continue;
        }
        let type_guid = Uuid::from_bytes_le(type_bytes);
        let first_lba = LittleEndian::read_u64(&raw[32..]);
        let last_lba = LittleEndian::read_u64(&raw[40..]);
        let attributes = LittleEndian::read_u64(&raw[48..]);
        let at = array_offset + (index * header.entry_size as usize) as u64;

        if last_lba < first_lba {
            return Err(FirmctlError::corrupt(
                at + 32,
                format!("GPT entry {} ends before it starts", index + 1),
            ));
        }

        let name = decode_name(&raw[56..128]);
        debug!(
            "GPT partition {}: type {}, LBA {}..={}, name {:?}",
            index + 1,
            type_guid,
            first_lba,
            last_lba,
            name
        );

        let bootable = attributes & ATTR_LEGACY_BIOS_BOOTABLE != 0 || is_linux_root_type(&type_guid);
        entries.push(PartitionEntry {
            number: index + 1,
            start: first_lba.saturating_mul(SECTOR_SIZE),
            length: (last_lba - first_lba + 1).saturating_mul(SECTOR_SIZE),
            partition_type: PartitionType::Gpt(type_guid),
            bootable,
            name,
        });
    }
    Ok(entries)
}

/// UTF-16LE name, NUL terminated.
fn decode_name(raw: &[u8]) -> Option<String> {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    if units.is_empty() {
        None
    } else {
        Some(String::from_utf16_lossy(&units))
    }
}
