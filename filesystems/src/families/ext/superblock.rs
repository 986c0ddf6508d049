// ext2/ext3/ext4 superblock
// Parsed field by field from little-endian bytes; nothing is cast in place.

use byteorder::{ByteOrder, LittleEndian};
use firmctl_core::FirmctlError;
use log::warn;

pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const EXT_SUPER_MAGIC: u16 = 0xEF53;
const MAGIC_OFFSET: usize = 56;

pub const EXT_ROOT_INO: u64 = 2;
pub const EXT_GOOD_OLD_INODE_SIZE: u16 = 128;
const MAX_LOG_BLOCK_SIZE: u32 = 6;

pub const FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;

pub const FEATURE_INCOMPAT_COMPRESSION: u32 = 0x0001;
pub const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
pub const FEATURE_INCOMPAT_RECOVER: u32 = 0x0004;
pub const FEATURE_INCOMPAT_JOURNAL_DEV: u32 = 0x0008;
pub const FEATURE_INCOMPAT_META_BG: u32 = 0x0010;
pub const FEATURE_INCOMPAT_EXTENTS: u32 = 0x0040;
pub const FEATURE_INCOMPAT_64BIT: u32 = 0x0080;
pub const FEATURE_INCOMPAT_DIRDATA: u32 = 0x1000;
pub const FEATURE_INCOMPAT_INLINE_DATA: u32 = 0x8000;
pub const FEATURE_INCOMPAT_ENCRYPT: u32 = 0x10000;

pub const FEATURE_RO_COMPAT_METADATA_CSUM: u32 = 0x0400;

const UNSUPPORTED_INCOMPAT: &[(u32, &str)] = &[
    (FEATURE_INCOMPAT_COMPRESSION, "compression"),
    (FEATURE_INCOMPAT_JOURNAL_DEV, "journal_dev"),
    (FEATURE_INCOMPAT_META_BG, "meta_bg"),
    (FEATURE_INCOMPAT_DIRDATA, "dirdata"),
    (FEATURE_INCOMPAT_ENCRYPT, "encrypt"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtVersion {
    Ext2,
    Ext3,
    Ext4,
}

impl ExtVersion {
    pub fn name(self) -> &'static str {
        match self {
            ExtVersion::Ext2 => "ext2",
            ExtVersion::Ext3 => "ext3",
            ExtVersion::Ext4 => "ext4",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub free_blocks_count: u64,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub magic: u16,
    pub rev_level: u32,
    pub inode_size: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub desc_size: u16,
}

impl Superblock {
    /// Parse and validate the 1024 bytes found at `SUPERBLOCK_OFFSET`.
    pub fn parse(bytes: &[u8]) -> Result<Self, FirmctlError> {
        if bytes.len() < SUPERBLOCK_SIZE {
            return Err(FirmctlError::format(
                SUPERBLOCK_OFFSET,
                format!("superblock needs {} bytes, got {}", SUPERBLOCK_SIZE, bytes.len()),
            ));
        }

        let magic = LittleEndian::read_u16(&bytes[MAGIC_OFFSET..]);
        if magic != EXT_SUPER_MAGIC {
            return Err(FirmctlError::format(
                SUPERBLOCK_OFFSET + MAGIC_OFFSET as u64,
                format!("invalid ext magic 0x{:04X}", magic),
            ));
        }

        let u16_at = |o: usize| LittleEndian::read_u16(&bytes[o..]);
        let u32_at = |o: usize| LittleEndian::read_u32(&bytes[o..]);

        let incompat = u32_at(96);
        let is_64bit = incompat & FEATURE_INCOMPAT_64BIT != 0;
        let hi = |o: usize| if is_64bit { (u32_at(o) as u64) << 32 } else { 0 };

        let rev_level = u32_at(76);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[104..120]);
        let mut volume_name = [0u8; 16];
        volume_name.copy_from_slice(&bytes[120..136]);

        let sb = Superblock {
            inodes_count: u32_at(0),
            blocks_count: u32_at(4) as u64 | hi(336),
            free_blocks_count: u32_at(12) as u64 | hi(344),
            free_inodes_count: u32_at(16),
            first_data_block: u32_at(20),
            log_block_size: u32_at(24),
            blocks_per_group: u32_at(32),
            inodes_per_group: u32_at(40),
            magic,
            rev_level,
            inode_size: if rev_level == 0 {
                EXT_GOOD_OLD_INODE_SIZE
            } else {
                u16_at(88)
            },
            feature_compat: u32_at(92),
            feature_incompat: incompat,
            feature_ro_compat: u32_at(100),
            uuid,
            volume_name,
            desc_size: u16_at(254),
        };
        sb.validate()?;
        Ok(sb)
    }

    fn validate(&self) -> Result<(), FirmctlError> {
        let bad = |field_offset: u64, reason: String| {
            Err(FirmctlError::format(SUPERBLOCK_OFFSET + field_offset, reason))
        };

        if self.log_block_size > MAX_LOG_BLOCK_SIZE {
            return bad(24, format!("block size exponent {} out of range", self.log_block_size));
        }
        let block_size = self.block_size();
        if self.inodes_count == 0 || self.blocks_count == 0 {
            return bad(0, "filesystem declares no inodes or no blocks".to_string());
        }
        if self.blocks_per_group == 0 || self.blocks_per_group > block_size * 8 {
            return bad(32, format!("blocks per group {} invalid", self.blocks_per_group));
        }
        if self.inodes_per_group == 0 || self.inodes_per_group > block_size * 8 {
            return bad(40, format!("inodes per group {} invalid", self.inodes_per_group));
        }
        if self.first_data_block as u64 >= self.blocks_count {
            return bad(20, format!("first data block {} beyond end", self.first_data_block));
        }
        let inode_size = self.inode_size as u32;
        if inode_size < EXT_GOOD_OLD_INODE_SIZE as u32
            || !inode_size.is_power_of_two()
            || inode_size > block_size
        {
            return bad(88, format!("inode size {} invalid", self.inode_size));
        }
        if (self.inodes_count as u64) > self.group_count() * self.inodes_per_group as u64 {
            return bad(
                0,
                format!(
                    "{} inodes do not fit {} groups of {}",
                    self.inodes_count,
                    self.group_count(),
                    self.inodes_per_group
                ),
            );
        }
        if self.is_64bit() {
            let ds = self.desc_size as u32;
            if ds < 64 || ds > 1024 || !ds.is_power_of_two() {
                return bad(254, format!("group descriptor size {} invalid", self.desc_size));
            }
        }

        for (flag, name) in UNSUPPORTED_INCOMPAT {
            if self.feature_incompat & flag != 0 {
                return Err(FirmctlError::NotSupported(format!(
                    "ext feature '{}' is not supported for reading",
                    name
                )));
            }
        }
        if self.feature_incompat & FEATURE_INCOMPAT_RECOVER != 0 {
            warn!("Journal needs recovery; reading committed on-disk state only");
        }
        Ok(())
    }

    pub fn block_size(&self) -> u32 {
        1024 << self.log_block_size
    }

    pub fn group_count(&self) -> u64 {
        let data_blocks = self.blocks_count - self.first_data_block as u64;
        data_blocks.div_ceil(self.blocks_per_group as u64)
    }

    pub fn desc_size(&self) -> u32 {
        if self.is_64bit() {
            self.desc_size as u32
        } else {
            32
        }
    }

    /// Block holding the first group descriptor.
    pub fn group_table_block(&self) -> u64 {
        self.first_data_block as u64 + 1
    }

    pub fn is_64bit(&self) -> bool {
        self.feature_incompat & FEATURE_INCOMPAT_64BIT != 0
    }

    pub fn has_extents(&self) -> bool {
        self.feature_incompat & FEATURE_INCOMPAT_EXTENTS != 0
    }

    pub fn has_filetype(&self) -> bool {
        self.feature_incompat & FEATURE_INCOMPAT_FILETYPE != 0
    }

    pub fn has_inline_data(&self) -> bool {
        self.feature_incompat & FEATURE_INCOMPAT_INLINE_DATA != 0
    }

    /// Detect the ext generation from feature flags.
    pub fn version(&self) -> ExtVersion {
        let has_journal = self.feature_compat & FEATURE_COMPAT_HAS_JOURNAL != 0;
        let has_metadata_csum = self.feature_ro_compat & FEATURE_RO_COMPAT_METADATA_CSUM != 0;

        if self.has_extents() || self.is_64bit() || has_metadata_csum {
            ExtVersion::Ext4
        } else if has_journal {
            ExtVersion::Ext3
        } else {
            ExtVersion::Ext2
        }
    }

    pub fn label(&self) -> Option<String> {
        let label = String::from_utf8_lossy(&self.volume_name)
            .trim_end_matches('\0')
            .trim()
            .to_string();
        if label.is_empty() {
            None
        } else {
            Some(label)
        }
    }

    pub fn uuid_string(&self) -> Option<String> {
        if self.uuid.iter().all(|&b| b == 0) {
            return None;
        }
        Some(uuid::Uuid::from_bytes(self.uuid).hyphenated().to_string())
    }
}
