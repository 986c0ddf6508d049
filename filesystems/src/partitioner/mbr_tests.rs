// Partition table and root selection tests
use super::*;
use byteorder::{ByteOrder, LittleEndian};

const MIB: usize = 1024 * 1024;

fn set_slot(payload: &mut [u8], slot: usize, status: u8, ptype: u8, start_lba: u32, sectors: u32) {
    let offset = mbr::MBR_ENTRIES_OFFSET + slot * mbr::MBR_ENTRY_SIZE;
    payload[offset] = status;
    payload[offset + 4] = ptype;
    LittleEndian::write_u32(&mut payload[offset + 8..], start_lba);
    LittleEndian::write_u32(&mut payload[offset + 12..], sectors);
    payload[510] = 0x55;
    payload[511] = 0xAA;
}

fn mark_ext(payload: &mut [u8], start: usize) {
    payload[start + 1080] = 0x53;
    payload[start + 1081] = 0xEF;
}

fn gpt_payload(entries: &[(Uuid, u64, u64, u64)]) -> Vec<u8> {
    let mut payload = vec![0u8; 4 * MIB];
    set_slot(&mut payload, 0, 0x00, 0xEE, 1, (4 * MIB / 512 - 1) as u32);

    let mut array = vec![0u8; 128 * 128];
    for (i, (type_guid, first, last, attrs)) in entries.iter().enumerate() {
        let raw = &mut array[i * 128..(i + 1) * 128];
        raw[0..16].copy_from_slice(&type_guid.to_bytes_le());
        raw[16] = i as u8 + 1;
        LittleEndian::write_u64(&mut raw[32..], *first);
        LittleEndian::write_u64(&mut raw[40..], *last);
        LittleEndian::write_u64(&mut raw[48..], *attrs);
    }
    payload[1024..1024 + array.len()].copy_from_slice(&array);

    let header = &mut payload[512..1024];
    header[0..8].copy_from_slice(gpt::GPT_SIGNATURE);
    LittleEndian::write_u32(&mut header[8..], 0x0001_0000);
    LittleEndian::write_u32(&mut header[12..], 92);
    LittleEndian::write_u64(&mut header[24..], 1);
    LittleEndian::write_u64(&mut header[72..], 2);
    LittleEndian::write_u32(&mut header[80..], 128);
    LittleEndian::write_u32(&mut header[84..], 128);
    LittleEndian::write_u32(&mut header[88..], crc32fast::hash(&array));
    let crc = crc32fast::hash(&header[..92]);
    LittleEndian::write_u32(&mut header[16..], crc);
    payload
}

fn locate(payload: Vec<u8>) -> Result<RootRegion, FirmctlError> {
    PartitionLocator::default().locate_root(&ByteRange::from_vec(payload))
}

#[test]
fn test_active_mbr_partition_wins() {
    let mut payload = vec![0u8; 4 * MIB];
    set_slot(&mut payload, 0, 0x00, 0x83, 2048, 2048);
    set_slot(&mut payload, 1, 0x80, 0x83, 4096, 2048);
    mark_ext(&mut payload, MIB);
    mark_ext(&mut payload, 2 * MIB);

    let root = locate(payload).unwrap();
    assert_eq!(
        root.source,
        RegionSource::Partition { table: TableKind::Mbr, number: 2 }
    );
    assert_eq!(root.region.base_offset(), 2 * MIB as u64);
    assert_eq!(root.region.len(), MIB as u64);
}

#[test]
fn test_two_active_partitions_are_ambiguous() {
    let mut payload = vec![0u8; 4 * MIB];
    set_slot(&mut payload, 0, 0x80, 0x83, 2048, 2048);
    set_slot(&mut payload, 1, 0x80, 0x83, 4096, 2048);
    assert!(matches!(locate(payload), Err(FirmctlError::AmbiguousPartition(_))));
}

#[test]
fn test_unflagged_selection_by_signature() {
    let mut payload = vec![0u8; 4 * MIB];
    set_slot(&mut payload, 0, 0x00, 0x0C, 2048, 2048);
    set_slot(&mut payload, 1, 0x00, 0x83, 4096, 2048);
    mark_ext(&mut payload, 2 * MIB);

    let root = locate(payload).unwrap();
    assert_eq!(
        root.source,
        RegionSource::Partition { table: TableKind::Mbr, number: 2 }
    );
}

#[test]
fn test_unflagged_with_two_filesystems_is_ambiguous() {
    let mut payload = vec![0u8; 4 * MIB];
    set_slot(&mut payload, 0, 0x00, 0x83, 2048, 2048);
    set_slot(&mut payload, 1, 0x00, 0x83, 4096, 2048);
    mark_ext(&mut payload, MIB);
    mark_ext(&mut payload, 2 * MIB);
    assert!(matches!(locate(payload), Err(FirmctlError::AmbiguousPartition(_))));
}

#[test]
fn test_configured_partition_overrides_flag() {
    let mut payload = vec![0u8; 4 * MIB];
    set_slot(&mut payload, 0, 0x00, 0x83, 2048, 2048);
    set_slot(&mut payload, 1, 0x80, 0x83, 4096, 2048);

    let locator = PartitionLocator::default().with_partition(Some(1));
    let root = locator.locate_root(&ByteRange::from_vec(payload)).unwrap();
    assert_eq!(
        root.source,
        RegionSource::Partition { table: TableKind::Mbr, number: 1 }
    );

    let mut payload = vec![0u8; 4 * MIB];
    set_slot(&mut payload, 0, 0x00, 0x83, 2048, 2048);
    let locator = PartitionLocator::default().with_partition(Some(3));
    assert!(matches!(
        locator.locate_root(&ByteRange::from_vec(payload)),
        Err(FirmctlError::Configuration(_))
    ));
}

#[test]
fn test_partition_past_payload_is_out_of_bounds() {
    let mut payload = vec![0u8; 4 * MIB];
    set_slot(&mut payload, 0, 0x80, 0x83, 2048, 100_000);
    assert!(matches!(locate(payload), Err(FirmctlError::OutOfBounds { .. })));
}

#[test]
fn test_overlapping_partitions_are_corrupt() {
    let mut payload = vec![0u8; 4 * MIB];
    set_slot(&mut payload, 0, 0x80, 0x83, 2048, 4096);
    set_slot(&mut payload, 1, 0x00, 0x83, 4096, 2048);
    assert!(matches!(locate(payload), Err(FirmctlError::CorruptStructure { .. })));
}

#[test]
fn test_extended_partition_is_skipped() {
    let mut payload = vec![0u8; 4 * MIB];
    set_slot(&mut payload, 0, 0x00, 0x83, 2048, 2048);
    set_slot(&mut payload, 1, 0x00, 0x05, 4096, 2048);
    let table = PartitionLocator::default()
        .read_table(&ByteRange::from_vec(payload))
        .unwrap()
        .unwrap();
    assert_eq!(table.entries.len(), 1);
    assert_eq!(table.entries[0].partition_type, PartitionType::Mbr(0x83));
}

#[test]
fn test_invalid_status_byte_is_not_a_table() {
    let mut payload = vec![0u8; 4 * MIB];
    set_slot(&mut payload, 0, 0x12, 0x83, 2048, 2048);
    let table = PartitionLocator::default()
        .read_table(&ByteRange::from_vec(payload))
        .unwrap();
    assert!(table.is_none());
}

#[test]
fn test_bare_filesystem_is_whole_payload() {
    let mut payload = vec![0u8; MIB];
    mark_ext(&mut payload, 0);
    let root = locate(payload).unwrap();
    assert_eq!(root.source, RegionSource::WholePayload);
    assert_eq!(root.region.len(), MIB as u64);
}

#[test]
fn test_no_table_no_filesystem_is_format_error() {
    assert!(matches!(locate(vec![0u8; MIB]), Err(FirmctlError::Format { .. })));
}

#[test]
fn test_gpt_linux_root_type_selected() {
    let data = Uuid::parse_str("0FC63DAF-8483-4772-8E79-3D69D8477DE4").unwrap();
    let root = Uuid::parse_str(gpt::LINUX_ROOT_TYPES[1]).unwrap();
    let payload = gpt_payload(&[(data, 2048, 4095, 0), (root, 4096, 6143, 0)]);

    let located = locate(payload).unwrap();
    assert_eq!(
        located.source,
        RegionSource::Partition { table: TableKind::Gpt, number: 2 }
    );
    assert_eq!(located.region.base_offset(), 4096 * 512);
    assert_eq!(located.region.len(), 2048 * 512);
}

#[test]
fn test_gpt_legacy_bootable_attribute() {
    let data = Uuid::parse_str("0FC63DAF-8483-4772-8E79-3D69D8477DE4").unwrap();
    let payload = gpt_payload(&[
        (data, 2048, 4095, gpt::ATTR_LEGACY_BIOS_BOOTABLE),
        (data, 4096, 6143, 0),
    ]);
    let located = locate(payload).unwrap();
    assert_eq!(
        located.source,
        RegionSource::Partition { table: TableKind::Gpt, number: 1 }
    );
}

#[test]
fn test_gpt_header_crc_mismatch() {
    let data = Uuid::parse_str("0FC63DAF-8483-4772-8E79-3D69D8477DE4").unwrap();
    let mut payload = gpt_payload(&[(data, 2048, 4095, 0)]);
    payload[512 + 80] ^= 0x01;
    match locate(payload) {
        Err(FirmctlError::CorruptStructure { offset, .. }) => assert_eq!(offset, 512 + 16),
        other => panic!("expected corrupt structure, got {:?}", other),
    }
}

#[test]
fn test_gpt_entry_array_crc_mismatch() {
    let data = Uuid::parse_str("0FC63DAF-8483-4772-8E79-3D69D8477DE4").unwrap();
    let mut payload = gpt_payload(&[(data, 2048, 4095, 0)]);
    payload[1024 + 20] ^= 0xFF;
    match locate(payload) {
        Err(FirmctlError::CorruptStructure { offset, .. }) => assert_eq!(offset, 1024),
        other => panic!("expected corrupt structure, got {:?}", other),
    }
}

/// Rewrite one u32 header field and re-seal the header CRC.
fn patch_gpt_header(payload: &mut [u8], field: usize, value: u32) {
    let header = &mut payload[512..1024];
    LittleEndian::write_u32(&mut header[field..], value);
    header[16..20].fill(0);
    let crc = crc32fast::hash(&header[..92]);
    LittleEndian::write_u32(&mut header[16..], crc);
}

#[test]
fn test_gpt_oversized_entry_rejected() {
    let data = Uuid::parse_str("0FC63DAF-8483-4772-8E79-3D69D8477DE4").unwrap();
    let mut payload = gpt_payload(&[(data, 2048, 4095, 0)]);
    patch_gpt_header(&mut payload, 84, 1 << 20);
    match locate(payload) {
        Err(FirmctlError::CorruptStructure { offset, .. }) => assert_eq!(offset, 512 + 84),
        other => panic!("expected corrupt structure, got {:?}", other),
    }
}

#[test]
fn test_gpt_entry_array_size_is_capped() {
    let data = Uuid::parse_str("0FC63DAF-8483-4772-8E79-3D69D8477DE4").unwrap();
    let mut payload = gpt_payload(&[(data, 2048, 4095, 0)]);
    // 4096 entries of 512 bytes fit the payload but exceed the array limit
    patch_gpt_header(&mut payload, 84, 512);
    patch_gpt_header(&mut payload, 80, 4096);
    match locate(payload) {
        Err(FirmctlError::CorruptStructure { offset, .. }) => assert_eq!(offset, 512 + 80),
        other => panic!("expected corrupt structure, got {:?}", other),
    }
}
