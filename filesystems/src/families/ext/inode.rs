// ext inode decoding

use crate::families::{FileKind, Inode};
use byteorder::{ByteOrder, LittleEndian};
use firmctl_core::FirmctlError;

pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
pub const EXT4_INLINE_DATA_FL: u32 = 0x1000_0000;

/// Bytes of `i_block`, which holds block pointers, an extent root or inline data.
pub const BLOCK_MAP_SIZE: usize = 60;
const BLOCK_MAP_OFFSET: usize = 40;

/// Decode an on-disk inode record. `raw` covers at least the 128-byte base.
pub fn parse_inode(number: u64, raw: &[u8], disk_offset: u64) -> Result<Inode, FirmctlError> {
    if raw.len() < 128 {
        return Err(FirmctlError::corrupt(
            disk_offset,
            format!("inode {} record is only {} bytes", number, raw.len()),
        ));
    }

    let u16_at = |o: usize| LittleEndian::read_u16(&raw[o..]);
    let u32_at = |o: usize| LittleEndian::read_u32(&raw[o..]);

    let mode = u16_at(0);
    let mut block_map = [0u8; BLOCK_MAP_SIZE];
    block_map.copy_from_slice(&raw[BLOCK_MAP_OFFSET..BLOCK_MAP_OFFSET + BLOCK_MAP_SIZE]);

    // osd2 (linux2) carries the high halves of several fields
    let blocks_hi = u16_at(116) as u64;
    let file_acl_hi = u16_at(118) as u64;
    let uid_hi = u16_at(120) as u32;
    let gid_hi = u16_at(122) as u32;

    Ok(Inode {
        number,
        kind: FileKind::from_mode(mode),
        mode,
        uid: u16_at(2) as u32 | (uid_hi << 16),
        gid: u16_at(24) as u32 | (gid_hi << 16),
        size: u32_at(4) as u64 | ((u32_at(108) as u64) << 32),
        links: u16_at(26),
        atime: u32_at(8) as i32 as i64,
        ctime: u32_at(12) as i32 as i64,
        mtime: u32_at(16) as i32 as i64,
        flags: u32_at(32),
        disk_offset,
        block_map,
        sectors: u32_at(28) as u64 | (blocks_hi << 32),
        xattr_block: u32_at(104) as u64 | (file_acl_hi << 32),
    })
}

pub fn uses_extents(inode: &Inode) -> bool {
    inode.flags & EXT4_EXTENTS_FL != 0
}

pub fn has_inline_data(inode: &Inode) -> bool {
    inode.flags & EXT4_INLINE_DATA_FL != 0
}

/// Symlink whose target lives in `i_block` rather than a data block.
pub fn is_fast_symlink(inode: &Inode, block_size: u32) -> bool {
    if inode.kind != FileKind::Symlink || uses_extents(inode) || has_inline_data(inode) {
        return false;
    }
    let xattr_sectors = if inode.xattr_block != 0 {
        (block_size / 512) as u64
    } else {
        0
    };
    inode.size < BLOCK_MAP_SIZE as u64 && inode.sectors.saturating_sub(xattr_sectors) == 0
}
