// ext2/ext3/ext4 read-only volume

pub mod block_map;
pub mod directory;
pub mod inode;
pub mod superblock;

use crate::detection::FamilySignature;
use crate::families::{
    BlockRun, DirectoryEntry, FilesystemFamily, Inode, Volume, VolumeInfo,
};
use block_map::{AddressingStrategy, ExtentAddressing, IndirectAddressing};
use byteorder::{ByteOrder, LittleEndian};
use firmctl_core::{ByteRange, FirmctlError};
use inode::{has_inline_data, is_fast_symlink, parse_inode, uses_extents, BLOCK_MAP_SIZE};
use log::{debug, info, warn};
use std::sync::Arc;
use superblock::{Superblock, EXT_ROOT_INO, EXT_SUPER_MAGIC, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};

pub use superblock::ExtVersion;

/// Block-granular access to the region.
///
/// Usable blocks are those the superblock declares that also lie inside the
/// region, so a pointer past a truncated region is corrupt rather than a short read.
pub struct ExtDisk {
    region: ByteRange,
    block_size: u32,
    blocks_count: u64,
}

impl ExtDisk {
    pub fn new(region: ByteRange, block_size: u32, blocks_count: u64) -> Self {
        let in_region = region.len() / block_size as u64;
        Self {
            region,
            block_size,
            blocks_count: blocks_count.min(in_region),
        }
    }

    /// Blocks addressable through this disk.
    pub fn blocks_count(&self) -> u64 {
        self.blocks_count
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn pointers_per_block(&self) -> u64 {
        (self.block_size / 4) as u64
    }

    pub fn block_offset(&self, block: u64) -> Result<u64, FirmctlError> {
        block.checked_mul(self.block_size as u64).ok_or_else(|| {
            FirmctlError::out_of_bounds("block", u64::MAX, self.block_size as u64, self.region.len())
        })
    }

    /// Reject `count` blocks starting at `start` unless they lie inside the filesystem.
    pub fn check_blocks(&self, start: u64, count: u64, referenced_at: u64) -> Result<(), FirmctlError> {
        let end = start.checked_add(count);
        match end {
            Some(end) if start != 0 && end <= self.blocks_count => Ok(()),
            _ => Err(FirmctlError::corrupt(
                referenced_at,
                format!(
                    "block range {}+{} outside filesystem of {} blocks",
                    start, count, self.blocks_count
                ),
            )),
        }
    }

    pub fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<(), FirmctlError> {
        debug_assert_eq!(buf.len(), self.block_size as usize);
        let offset = self.block_offset(block)?;
        self.region.read_at(offset, buf)
    }

    /// One little-endian block pointer from an indirect block.
    pub fn read_pointer(&self, block: u64, index: u64) -> Result<u32, FirmctlError> {
        let mut raw = [0u8; 4];
        self.region.read_at(self.block_offset(block)? + index * 4, &mut raw)?;
        Ok(LittleEndian::read_u32(&raw))
    }
}

pub struct ExtFamily;

impl FilesystemFamily for ExtFamily {
    fn name(&self) -> &'static str {
        "ext"
    }

    fn signature(&self) -> FamilySignature {
        FamilySignature {
            offset: SUPERBLOCK_OFFSET + 56,
            signature: EXT_SUPER_MAGIC.to_le_bytes().to_vec(),
        }
    }

    fn mount(&self, region: ByteRange) -> Result<Arc<dyn Volume>, FirmctlError> {
        Ok(Arc::new(ExtVolume::open(region)?))
    }
}

/// A mounted ext filesystem. Immutable after `open`, so it is shared freely.
pub struct ExtVolume {
    disk: ExtDisk,
    superblock: Superblock,
    inode_tables: Vec<u64>,
}

impl ExtVolume {
    pub fn open(region: ByteRange) -> Result<Self, FirmctlError> {
        if !region.contains(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE as u64) {
            return Err(FirmctlError::format(
                SUPERBLOCK_OFFSET,
                format!("region of {} bytes too small for an ext superblock", region.len()),
            ));
        }
        let raw = region.read_vec(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)?;
        let superblock = Superblock::parse(&raw)?;
        let block_size = superblock.block_size();

        info!(
            "Detected {} filesystem: {} blocks of {} bytes, {} inodes",
            superblock.version().name(),
            superblock.blocks_count,
            block_size,
            superblock.inodes_count
        );

        let declared = superblock.blocks_count.saturating_mul(block_size as u64);
        if declared > region.len() {
            warn!(
                "Filesystem declares {} bytes but region holds {}; blocks past the end are treated as corrupt",
                declared,
                region.len()
            );
        }

        let disk = ExtDisk::new(region, block_size, superblock.blocks_count);
        let inode_tables = Self::read_group_table(&disk, &superblock)?;
        debug!("Loaded {} group descriptors", inode_tables.len());

        Ok(Self {
            disk,
            superblock,
            inode_tables,
        })
    }

    /// Inode table location for every block group.
    fn read_group_table(disk: &ExtDisk, sb: &Superblock) -> Result<Vec<u64>, FirmctlError> {
        let groups = sb.group_count();
        let desc_size = sb.desc_size() as u64;
        let block_size = disk.block_size() as u64;
        let first_block = sb.group_table_block();
        let table_offset = disk.block_offset(first_block)?;
        let gdt_blocks = groups.saturating_mul(desc_size).div_ceil(block_size);

        if disk.check_blocks(first_block, gdt_blocks, SUPERBLOCK_OFFSET + 4).is_err() {
            return Err(FirmctlError::corrupt(
                table_offset,
                format!("{} group descriptors extend past the region", groups),
            ));
        }

        let table_blocks = (sb.inodes_per_group as u64 * sb.inode_size as u64).div_ceil(block_size);
        let per_block = (block_size / desc_size) as usize;
        let mut tables = Vec::new();
        let mut buf = vec![0u8; block_size as usize];

        // one descriptor block in memory at a time
        for index in 0..gdt_blocks {
            let block = first_block + index;
            disk.read_block(block, &mut buf)?;
            let remaining = (groups - tables.len() as u64).min(per_block as u64) as usize;
            for (slot, desc) in buf.chunks_exact(desc_size as usize).take(remaining).enumerate() {
                let mut inode_table = LittleEndian::read_u32(&desc[8..]) as u64;
                if sb.is_64bit() {
                    inode_table |= (LittleEndian::read_u32(&desc[40..]) as u64) << 32;
                }
                let at = block * block_size + (slot as u64) * desc_size + 8;
                disk.check_blocks(inode_table, table_blocks, at)?;
                tables.push(inode_table);
            }
        }
        Ok(tables)
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    fn addressing_for(&self, inode: &Inode) -> Result<&'static dyn AddressingStrategy, FirmctlError> {
        if uses_extents(inode) {
            if !self.superblock.has_extents() {
                return Err(FirmctlError::corrupt(
                    inode.disk_offset,
                    format!("inode {} uses extents on a filesystem without them", inode.number),
                ));
            }
            Ok(&ExtentAddressing)
        } else {
            Ok(&IndirectAddressing)
        }
    }
}

impl Volume for ExtVolume {
    fn info(&self) -> VolumeInfo {
        let sb = &self.superblock;
        VolumeInfo {
            filesystem_type: sb.version().name().to_string(),
            label: sb.label(),
            uuid: sb.uuid_string(),
            block_size: sb.block_size(),
            block_count: sb.blocks_count,
            free_blocks: sb.free_blocks_count,
            inode_count: sb.inodes_count as u64,
            free_inodes: sb.free_inodes_count as u64,
            inode_size: sb.inode_size as u32,
            addressing: if sb.has_extents() { "extents" } else { "indirect" }.to_string(),
        }
    }

    fn block_size(&self) -> u32 {
        self.disk.block_size
    }

    fn block_count(&self) -> u64 {
        self.disk.blocks_count()
    }

    fn root_inode(&self) -> u64 {
        EXT_ROOT_INO
    }

    fn read_inode(&self, number: u64) -> Result<Inode, FirmctlError> {
        let sb = &self.superblock;
        if number == 0 || number > sb.inodes_count as u64 {
            return Err(FirmctlError::corrupt(
                SUPERBLOCK_OFFSET,
                format!("inode {} outside 1..={}", number, sb.inodes_count),
            ));
        }

        let group = (number - 1) / sb.inodes_per_group as u64;
        let index = (number - 1) % sb.inodes_per_group as u64;
        let table = self.inode_tables.get(group as usize).copied().ok_or_else(|| {
            FirmctlError::corrupt(
                SUPERBLOCK_OFFSET,
                format!("inode {} belongs to missing group {}", number, group),
            )
        })?;

        let offset = self.disk.block_offset(table)? + index * sb.inode_size as u64;
        let raw = self.disk.region.read_vec(offset, sb.inode_size as usize)?;
        parse_inode(number, &raw, offset)
    }

    fn map_block(&self, inode: &Inode, logical: u64) -> Result<BlockRun, FirmctlError> {
        self.addressing_for(inode)?.map(&self.disk, inode, logical)
    }

    fn read_block(&self, physical: u64, buf: &mut [u8]) -> Result<(), FirmctlError> {
        self.disk.read_block(physical, buf)
    }

    fn inline_content(&self, inode: &Inode) -> Result<Option<Vec<u8>>, FirmctlError> {
        if is_fast_symlink(inode, self.disk.block_size) {
            return Ok(Some(inode.block_map[..inode.size as usize].to_vec()));
        }
        if has_inline_data(inode) {
            if inode.is_dir() {
                return Err(FirmctlError::NotSupported(format!(
                    "inline-data directory (inode {})",
                    inode.number
                )));
            }
            if inode.size > BLOCK_MAP_SIZE as u64 {
                return Err(FirmctlError::NotSupported(format!(
                    "inline data continued in extended attributes (inode {})",
                    inode.number
                )));
            }
            return Ok(Some(inode.block_map[..inode.size as usize].to_vec()));
        }
        Ok(None)
    }

    fn parse_directory_block(
        &self,
        block: &[u8],
        disk_offset: u64,
    ) -> Result<Vec<DirectoryEntry>, FirmctlError> {
        directory::parse_directory_block(block, disk_offset, self.superblock.has_filetype())
    }
}
