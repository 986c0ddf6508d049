// Logical to physical block mapping for ext inodes
// Two strategies share one contract: classic indirect pointers (ext2/ext3)
// and extent trees (ext4). The inode's EXTENTS flag picks one.

use super::ExtDisk;
use crate::families::{BlockRun, Inode};
use byteorder::{ByteOrder, LittleEndian};
use firmctl_core::FirmctlError;

const DIRECT_POINTERS: u64 = 12;

const EXT4_EXT_MAGIC: u16 = 0xF30A;
const EXT4_MAX_EXTENT_DEPTH: u16 = 5;
const EXT_INIT_MAX_LEN: u32 = 32768;
const EXTENT_HEADER_SIZE: usize = 12;
const EXTENT_ENTRY_SIZE: usize = 12;
const BLOCK_MAP_DISK_OFFSET: u64 = 40;

pub trait AddressingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn map(&self, disk: &ExtDisk, inode: &Inode, logical: u64) -> Result<BlockRun, FirmctlError>;
}

/// 12 direct pointers followed by single, double and triple indirect blocks.
pub struct IndirectAddressing;

impl IndirectAddressing {
    fn root_pointer(inode: &Inode, index: usize) -> u64 {
        LittleEndian::read_u32(&inode.block_map[index * 4..]) as u64
    }

    /// Descend `levels` pointer blocks below `block`; `rel` indexes into that subtree.
    fn descend(
        disk: &ExtDisk,
        inode: &Inode,
        mut block: u64,
        mut levels: u32,
        mut rel: u64,
    ) -> Result<BlockRun, FirmctlError> {
        let per_block = disk.pointers_per_block();
        let mut referenced_at = inode.disk_offset + BLOCK_MAP_DISK_OFFSET;
        loop {
            if block == 0 {
                // the whole remaining subtree is unallocated
                return Ok(BlockRun::hole(per_block.pow(levels) - rel));
            }
            disk.check_blocks(block, 1, referenced_at)?;
            if levels == 0 {
                return Ok(BlockRun::mapped(block, 1));
            }
            let child_span = per_block.pow(levels - 1);
            let index = rel / child_span;
            referenced_at = disk.block_offset(block)? + index * 4;
            block = disk.read_pointer(block, index)? as u64;
            rel %= child_span;
            levels -= 1;
        }
    }
}

impl AddressingStrategy for IndirectAddressing {
    fn name(&self) -> &'static str {
        "indirect"
    }

    fn map(&self, disk: &ExtDisk, inode: &Inode, logical: u64) -> Result<BlockRun, FirmctlError> {
        if logical < DIRECT_POINTERS {
            let pointer = Self::root_pointer(inode, logical as usize);
            return Self::descend(disk, inode, pointer, 0, 0);
        }

        let per_block = disk.pointers_per_block();
        let mut rel = logical - DIRECT_POINTERS;
        for levels in 1..=3u32 {
            let covered = per_block.pow(levels);
            if rel < covered {
                let pointer = Self::root_pointer(inode, 11 + levels as usize);
                return Self::descend(disk, inode, pointer, levels, rel);
            }
            rel -= covered;
        }

        Err(FirmctlError::corrupt(
            inode.disk_offset,
            format!(
                "logical block {} of inode {} beyond indirect addressing range",
                logical, inode.number
            ),
        ))
    }
}

/// ext4 extent tree rooted in `i_block`.
pub struct ExtentAddressing;

#[derive(Debug)]
struct ExtentHeader {
    entries: usize,
    depth: u16,
}

fn parse_extent_header(node: &[u8], at: u64) -> Result<ExtentHeader, FirmctlError> {
    if node.len() < EXTENT_HEADER_SIZE {
        return Err(FirmctlError::corrupt(at, "extent node too small"));
    }
    let magic = LittleEndian::read_u16(&node[0..]);
    if magic != EXT4_EXT_MAGIC {
        return Err(FirmctlError::corrupt(
            at,
            format!("bad extent header magic 0x{:04X}", magic),
        ));
    }
    let entries = LittleEndian::read_u16(&node[2..]) as usize;
    let max = LittleEndian::read_u16(&node[4..]) as usize;
    let depth = LittleEndian::read_u16(&node[6..]);

    if entries > max {
        return Err(FirmctlError::corrupt(
            at,
            format!("extent node holds {} entries, max {}", entries, max),
        ));
    }
    if EXTENT_HEADER_SIZE + entries * EXTENT_ENTRY_SIZE > node.len() {
        return Err(FirmctlError::corrupt(
            at,
            format!("{} extent entries overrun {}-byte node", entries, node.len()),
        ));
    }
    if depth > EXT4_MAX_EXTENT_DEPTH {
        return Err(FirmctlError::corrupt(
            at,
            format!("extent tree depth {} exceeds {}", depth, EXT4_MAX_EXTENT_DEPTH),
        ));
    }
    Ok(ExtentHeader { entries, depth })
}

impl ExtentAddressing {
    fn map_leaf(
        disk: &ExtDisk,
        node: &[u8],
        node_offset: u64,
        entries: usize,
        logical: u64,
        bound: u64,
    ) -> Result<BlockRun, FirmctlError> {
        let mut prev_end = 0u64;
        for i in 0..entries {
            let pos = EXTENT_HEADER_SIZE + i * EXTENT_ENTRY_SIZE;
            let at = node_offset + pos as u64;
            let entry = &node[pos..pos + EXTENT_ENTRY_SIZE];

            let first = LittleEndian::read_u32(&entry[0..]) as u64;
            let raw_len = LittleEndian::read_u16(&entry[4..]) as u32;
            let (len, uninitialized) = if raw_len > EXT_INIT_MAX_LEN {
                ((raw_len - EXT_INIT_MAX_LEN) as u64, true)
            } else {
                (raw_len as u64, false)
            };
            let start = ((LittleEndian::read_u16(&entry[6..]) as u64) << 32)
                | LittleEndian::read_u32(&entry[8..]) as u64;

            if len == 0 {
                return Err(FirmctlError::corrupt(at, "zero-length extent"));
            }
            if first < prev_end {
                return Err(FirmctlError::corrupt(at, "extents overlap or are out of order"));
            }
            prev_end = first + len;

            if logical < first {
                return Ok(BlockRun::hole(first.min(bound) - logical));
            }
            if logical < first + len {
                disk.check_blocks(start, len, at)?;
                let run = (first + len).min(bound) - logical;
                // uninitialized extents are allocated but read as zeros
                return Ok(if uninitialized {
                    BlockRun::hole(run)
                } else {
                    BlockRun::mapped(start + (logical - first), run)
                });
            }
        }
        Ok(BlockRun::hole(bound.saturating_sub(logical)))
    }
}

impl AddressingStrategy for ExtentAddressing {
    fn name(&self) -> &'static str {
        "extents"
    }

    fn map(&self, disk: &ExtDisk, inode: &Inode, logical: u64) -> Result<BlockRun, FirmctlError> {
        let mut node = inode.block_map.to_vec();
        let mut node_offset = inode.disk_offset + BLOCK_MAP_DISK_OFFSET;
        let mut expected_depth: Option<u16> = None;
        // first logical block past the subtree being searched
        let mut bound = u64::MAX;

        loop {
            let header = parse_extent_header(&node, node_offset)?;
            if let Some(expected) = expected_depth {
                if header.depth != expected {
                    return Err(FirmctlError::corrupt(
                        node_offset,
                        format!("extent node depth {} where {} expected", header.depth, expected),
                    ));
                }
            }

            if header.depth == 0 {
                return Self::map_leaf(disk, &node, node_offset, header.entries, logical, bound);
            }

            let mut chosen: Option<(u64, u64)> = None;
            let mut first_index: Option<u64> = None;
            let mut prev_first: Option<u64> = None;
            for i in 0..header.entries {
                let pos = EXTENT_HEADER_SIZE + i * EXTENT_ENTRY_SIZE;
                let at = node_offset + pos as u64;
                let entry = &node[pos..pos + EXTENT_ENTRY_SIZE];
                let first = LittleEndian::read_u32(&entry[0..]) as u64;
                if let Some(prev) = prev_first {
                    if first <= prev {
                        return Err(FirmctlError::corrupt(at, "extent index entries out of order"));
                    }
                }
                prev_first = Some(first);
                first_index.get_or_insert(first);

                if first <= logical {
                    let child = LittleEndian::read_u32(&entry[4..]) as u64
                        | ((LittleEndian::read_u16(&entry[8..]) as u64) << 32);
                    disk.check_blocks(child, 1, at)?;
                    chosen = Some((child, at));
                } else {
                    bound = bound.min(first);
                    break;
                }
            }

            let Some((child, _)) = chosen else {
                let until = first_index.unwrap_or(bound).min(bound);
                return Ok(BlockRun::hole(until.saturating_sub(logical)));
            };

            let mut block = vec![0u8; disk.block_size() as usize];
            disk.read_block(child, &mut block)?;
            node = block;
            node_offset = disk.block_offset(child)?;
            expected_depth = Some(header.depth - 1);
        }
    }
}
