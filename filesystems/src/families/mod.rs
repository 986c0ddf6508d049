// Filesystem Families Organization
// Each family knows its own on-disk format; path resolution and listing only
// talk to the `Volume` trait.

pub mod ext;

use crate::detection::FamilySignature;
use firmctl_core::{ByteRange, FirmctlError};
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileKind {
    Unknown,
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Symlink,
}

impl FileKind {
    /// Decode the type bits of a POSIX mode.
    pub fn from_mode(mode: u16) -> Self {
        match mode & 0xF000 {
            0x8000 => FileKind::Regular,
            0x4000 => FileKind::Directory,
            0x2000 => FileKind::CharDevice,
            0x6000 => FileKind::BlockDevice,
            0x1000 => FileKind::Fifo,
            0xC000 => FileKind::Socket,
            0xA000 => FileKind::Symlink,
            _ => FileKind::Unknown,
        }
    }
}

/// Per-file metadata decoded from an on-disk inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub number: u64,
    pub kind: FileKind,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    /// Authoritative content length in bytes.
    pub size: u64,
    pub links: u16,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub flags: u32,
    /// Byte offset of the inode record inside the region.
    pub disk_offset: u64,
    /// Raw block-mapping area, interpreted by the owning family.
    pub(crate) block_map: [u8; 60],
    /// Allocated 512-byte sectors, including any extended attribute block.
    pub(crate) sectors: u64,
    pub(crate) xattr_block: u64,
}

impl Inode {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::Regular
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    pub fn permissions(&self) -> u16 {
        self.mode & 0o7777
    }
}

/// A directory record as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: Vec<u8>,
    pub inode: u64,
    /// Type tag from the record; `Unknown` when the format does not store one.
    pub kind: FileKind,
    pub record_len: u32,
    pub disk_offset: u64,
}

impl DirectoryEntry {
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn is_dot_or_dotdot(&self) -> bool {
        self.name == b"." || self.name == b".."
    }
}

/// Logical-to-physical mapping for a run of consecutive logical blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRun {
    /// First physical block, or `None` for a hole that reads as zeros.
    pub physical: Option<u64>,
    /// Number of logical blocks the mapping covers, at least 1.
    pub len: u64,
}

impl BlockRun {
    pub fn hole(len: u64) -> Self {
        Self {
            physical: None,
            len: len.max(1),
        }
    }

    pub fn mapped(physical: u64, len: u64) -> Self {
        Self {
            physical: Some(physical),
            len: len.max(1),
        }
    }
}

/// Filesystem-wide facts reported by a mounted volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeInfo {
    pub filesystem_type: String,
    pub label: Option<String>,
    pub uuid: Option<String>,
    pub block_size: u32,
    pub block_count: u64,
    pub free_blocks: u64,
    pub inode_count: u64,
    pub free_inodes: u64,
    pub inode_size: u32,
    pub addressing: String,
}

/// A mounted filesystem: the per-family strategy behind the generic reader.
pub trait Volume: Send + Sync {
    fn info(&self) -> VolumeInfo;

    fn block_size(&self) -> u32;

    /// Blocks that can be addressed inside the mounted region.
    fn block_count(&self) -> u64;

    fn root_inode(&self) -> u64;

    fn read_inode(&self, number: u64) -> Result<Inode, FirmctlError>;

    /// Map `logical` within the inode's data to a physical run.
    fn map_block(&self, inode: &Inode, logical: u64) -> Result<BlockRun, FirmctlError>;

    /// Read one whole block. `buf` must be exactly one block long.
    fn read_block(&self, physical: u64, buf: &mut [u8]) -> Result<(), FirmctlError>;

    /// Contents stored inside the inode itself, already cut to the declared size.
    fn inline_content(&self, inode: &Inode) -> Result<Option<Vec<u8>>, FirmctlError>;

    /// Decode the records of one directory block in storage order.
    fn parse_directory_block(
        &self,
        block: &[u8],
        disk_offset: u64,
    ) -> Result<Vec<DirectoryEntry>, FirmctlError>;
}

/// A filesystem format recognized by its magic number.
pub trait FilesystemFamily: Send + Sync {
    fn name(&self) -> &'static str;

    fn signature(&self) -> FamilySignature;

    fn probe(&self, region: &ByteRange) -> Result<bool, FirmctlError> {
        self.signature().matches(region)
    }

    fn mount(&self, region: ByteRange) -> Result<Arc<dyn Volume>, FirmctlError>;
}

/// Families known to the reader, probed in registration order.
pub struct FamilyRegistry {
    families: Vec<Box<dyn FilesystemFamily>>,
}

impl FamilyRegistry {
    pub fn new() -> Self {
        Self {
            families: Vec::new(),
        }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ext::ExtFamily));
        registry
    }

    pub fn register(&mut self, family: Box<dyn FilesystemFamily>) {
        self.families.push(family);
    }

    /// First family whose signature is present in `region`.
    pub fn detect(&self, region: &ByteRange) -> Result<Option<&dyn FilesystemFamily>, FirmctlError> {
        for family in &self.families {
            if family.probe(region)? {
                debug!("Region at offset {} matches {}", region.base_offset(), family.name());
                return Ok(Some(family.as_ref()));
            }
        }
        Ok(None)
    }

    pub fn mount(&self, region: ByteRange) -> Result<Arc<dyn Volume>, FirmctlError> {
        let family = self.detect(&region)?.ok_or_else(|| {
            FirmctlError::format(
                region.base_offset(),
                "no known filesystem signature in root region",
            )
        })?;
        info!("Mounting {} filesystem ({} bytes)", family.name(), region.len());
        family.mount(region)
    }
}

impl Default for FamilyRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
