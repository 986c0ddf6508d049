// Filesystem families organization
pub mod families;

pub mod detection;
pub mod image;
pub mod ops;
pub mod partitioner;
pub mod reader;

pub use families::ext::{ExtFamily, ExtVersion, ExtVolume};
pub use families::{
    BlockRun, DirectoryEntry, FamilyRegistry, FileKind, FilesystemFamily, Inode, Volume,
    VolumeInfo,
};

pub use image::{cat, extract, ls, mount, open_container, Image, ReleaseInfo};

pub use ops::{BackendChoice, DirectParseOps, FileAttributes, HostMountOps, ImageOps, ListedEntry};
pub use partitioner::{
    PartitionEntry, PartitionLocator, PartitionTable, PartitionType, RegionSource, RootRegion,
    TableKind,
};
pub use reader::{FileContents, FilesystemReader, WalkEntry};
