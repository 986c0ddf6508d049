// Backend interface for inspecting an image's root filesystem
// The direct parser is always available. A host mount is only an option when
// the operator has already loop-mounted the root partition somewhere.

use crate::families::{FileKind, Inode};
use crate::reader::FilesystemReader;
use firmctl_core::FirmctlError;
use log::debug;
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

/// File attributes returned by stat operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileAttributes {
    pub size: u64,
    pub kind: FileKind,
    pub permissions: u32,
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub modified: Option<i64>,
    pub accessed: Option<i64>,
    pub changed: Option<i64>,
    pub inode: Option<u64>,
}

impl From<&Inode> for FileAttributes {
    fn from(inode: &Inode) -> Self {
        FileAttributes {
            size: inode.size,
            kind: inode.kind,
            permissions: inode.permissions() as u32,
            owner: Some(inode.uid),
            group: Some(inode.gid),
            modified: Some(inode.mtime),
            accessed: Some(inode.atime),
            changed: Some(inode.ctime),
            inode: Some(inode.number),
        }
    }
}

/// Directory entry as reported by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedEntry {
    pub name: String,
    pub kind: FileKind,
    pub inode: Option<u64>,
}

/// Read-only operations every backend provides.
pub trait ImageOps: Send + Sync {
    fn list_directory(&self, path: &str) -> Result<Vec<ListedEntry>, FirmctlError>;

    fn read_file(&self, path: &str) -> Result<Box<dyn Read + Send>, FirmctlError>;

    fn stat(&self, path: &str) -> Result<FileAttributes, FirmctlError>;

    fn backend_name(&self) -> &str;
}

/// Which backend to serve an image through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BackendChoice {
    #[default]
    DirectParse,
    /// A directory where the root filesystem is already mounted by the host.
    HostMount(PathBuf),
}

impl BackendChoice {
    pub fn open(&self, reader: &FilesystemReader) -> Result<Box<dyn ImageOps>, FirmctlError> {
        match self {
            BackendChoice::DirectParse => Ok(Box::new(DirectParseOps::new(reader.clone()))),
            BackendChoice::HostMount(path) => Ok(Box::new(HostMountOps::new(path.clone())?)),
        }
    }
}

/// Serves requests by parsing the filesystem inside the payload.
pub struct DirectParseOps {
    reader: FilesystemReader,
}

impl DirectParseOps {
    pub fn new(reader: FilesystemReader) -> Self {
        Self { reader }
    }
}

impl ImageOps for DirectParseOps {
    fn list_directory(&self, path: &str) -> Result<Vec<ListedEntry>, FirmctlError> {
        Ok(self
            .reader
            .list_directory(path)?
            .into_iter()
            .map(|e| ListedEntry {
                name: e.name_lossy(),
                kind: e.kind,
                inode: Some(e.inode),
            })
            .collect())
    }

    fn read_file(&self, path: &str) -> Result<Box<dyn Read + Send>, FirmctlError> {
        Ok(Box::new(self.reader.read_file(path)?))
    }

    fn stat(&self, path: &str) -> Result<FileAttributes, FirmctlError> {
        Ok(FileAttributes::from(&self.reader.stat(path)?))
    }

    fn backend_name(&self) -> &str {
        "direct"
    }
}

/// Host filesystem operations over an already-mounted root partition
pub struct HostMountOps {
    base_path: PathBuf,
}

impl HostMountOps {
    pub fn new(path: PathBuf) -> Result<Self, FirmctlError> {
        if !path.is_dir() {
            return Err(FirmctlError::Configuration(format!(
                "host mount point {} is not a directory",
                path.display()
            )));
        }
        Ok(Self { base_path: path })
    }

    fn host_path(&self, path: &str) -> Result<PathBuf, FirmctlError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(FirmctlError::NotSupported(format!(
                "{}: '..' is not resolved on host-mounted images",
                path
            )));
        }
        Ok(self.base_path.join(relative))
    }

    fn map_io(path: &str, err: io::Error) -> FirmctlError {
        match err.kind() {
            io::ErrorKind::NotFound => FirmctlError::PathNotFound(path.to_string()),
            _ => FirmctlError::IoError(err),
        }
    }

    fn kind_of(file_type: fs::FileType) -> FileKind {
        if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_file() {
            FileKind::Regular
        } else if file_type.is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::Unknown
        }
    }
}

impl ImageOps for HostMountOps {
    fn list_directory(&self, path: &str) -> Result<Vec<ListedEntry>, FirmctlError> {
        let full_path = self.host_path(path)?;
        if !full_path.is_dir() {
            return Err(if full_path.exists() {
                FirmctlError::NotADirectory(path.to_string())
            } else {
                FirmctlError::PathNotFound(path.to_string())
            });
        }

        let mut entries = vec![
            ListedEntry {
                name: ".".to_string(),
                kind: FileKind::Directory,
                inode: None,
            },
            ListedEntry {
                name: "..".to_string(),
                kind: FileKind::Directory,
                inode: None,
            },
        ];

        for entry in fs::read_dir(&full_path).map_err(|e| Self::map_io(path, e))? {
            let entry = entry?;
            let kind = entry
                .file_type()
                .map(Self::kind_of)
                .unwrap_or(FileKind::Unknown);
            entries.push(ListedEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                kind,
                inode: None,
            });
        }
        debug!("Host listing of {} returned {} entries", full_path.display(), entries.len());
        Ok(entries)
    }

    fn read_file(&self, path: &str) -> Result<Box<dyn Read + Send>, FirmctlError> {
        let full_path = self.host_path(path)?;
        let metadata = fs::metadata(&full_path).map_err(|e| Self::map_io(path, e))?;
        if !metadata.is_file() {
            return Err(FirmctlError::NotAFile(path.to_string()));
        }
        let file = fs::File::open(&full_path).map_err(|e| Self::map_io(path, e))?;
        Ok(Box::new(file))
    }

    fn stat(&self, path: &str) -> Result<FileAttributes, FirmctlError> {
        let full_path = self.host_path(path)?;
        let metadata = fs::metadata(&full_path).map_err(|e| Self::map_io(path, e))?;

        let seconds = |t: io::Result<std::time::SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
        };

        #[cfg(unix)]
        let (permissions, owner, group, inode) = {
            use std::os::unix::fs::MetadataExt;
            (
                metadata.mode() & 0o7777,
                Some(metadata.uid()),
                Some(metadata.gid()),
                Some(metadata.ino()),
            )
        };
        #[cfg(not(unix))]
        let (permissions, owner, group, inode) = (0o755, None, None, None);

        Ok(FileAttributes {
            size: metadata.len(),
            kind: Self::kind_of(metadata.file_type()),
            permissions,
            owner,
            group,
            modified: seconds(metadata.modified()),
            accessed: seconds(metadata.accessed()),
            changed: None,
            inode,
        })
    }

    fn backend_name(&self) -> &str {
        "host-mount"
    }
}
