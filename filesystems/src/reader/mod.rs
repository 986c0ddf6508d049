// Family-independent path resolution, listing and file access
// Everything here goes through the `Volume` trait; on-disk formats live in
// `families`.

pub mod contents;

pub use contents::{Chunks, FileContents};

use crate::families::{DirectoryEntry, FamilyRegistry, FileKind, Inode, Volume, VolumeInfo};
use contents::BlockCursor;
use firmctl_core::{ByteRange, Config, FirmctlError};
use log::{debug, trace};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;

/// Longest symlink target accepted (PATH_MAX).
pub const MAX_SYMLINK_TARGET: u64 = 4096;

/// One entry produced by `FilesystemReader::walk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalkEntry {
    pub path: String,
    pub inode: u64,
    pub kind: FileKind,
    pub depth: usize,
}

/// Resolution state for a single lookup.
struct OpenPath {
    current: Inode,
    remaining: VecDeque<Vec<u8>>,
    hops: u32,
    resolved: String,
}

impl OpenPath {
    fn new(root: Inode, path: &str) -> Self {
        Self {
            current: root,
            remaining: split_components(path.as_bytes()).collect(),
            hops: 0,
            resolved: String::new(),
        }
    }

    /// Splice a link target in front of the components still to walk.
    fn push_target(&mut self, target: &[u8]) {
        let parts: Vec<Vec<u8>> = split_components(target).collect();
        for part in parts.into_iter().rev() {
            self.remaining.push_front(part);
        }
    }

    fn prefix_with(&self, name: &[u8]) -> String {
        format!("{}/{}", self.resolved, String::from_utf8_lossy(name))
    }

    fn display(&self) -> String {
        if self.resolved.is_empty() {
            "/".to_string()
        } else {
            self.resolved.clone()
        }
    }
}

/// Components of a path; an empty trailing component marks a trailing slash.
fn split_components(path: &[u8]) -> impl Iterator<Item = Vec<u8>> + '_ {
    let trailing_slash = path.len() > 1 && path.ends_with(b"/");
    path.split(|&b| b == b'/')
        .filter(|c| !c.is_empty())
        .map(|c| c.to_vec())
        .chain(trailing_slash.then(Vec::new))
}

/// Read-only view of one mounted filesystem.
///
/// Holds no mutable state, so a single reader can serve many threads.
#[derive(Clone)]
pub struct FilesystemReader {
    volume: Arc<dyn Volume>,
    max_symlink_hops: u32,
    max_walk_depth: usize,
}

impl FilesystemReader {
    /// Detect the family of `region` and mount it.
    pub fn mount(region: ByteRange, config: &Config) -> Result<Self, FirmctlError> {
        Self::mount_with(&FamilyRegistry::with_builtin(), region, config)
    }

    pub fn mount_with(
        families: &FamilyRegistry,
        region: ByteRange,
        config: &Config,
    ) -> Result<Self, FirmctlError> {
        let volume = families.mount(region)?;
        let root = volume.read_inode(volume.root_inode())?;
        if !root.is_dir() {
            return Err(FirmctlError::corrupt(
                root.disk_offset,
                format!("root inode {} is not a directory", root.number),
            ));
        }
        Ok(Self::from_volume(volume, config))
    }

    pub fn from_volume(volume: Arc<dyn Volume>, config: &Config) -> Self {
        Self {
            volume,
            max_symlink_hops: config.max_symlink_hops,
            max_walk_depth: config.max_walk_depth,
        }
    }

    pub fn volume(&self) -> &dyn Volume {
        self.volume.as_ref()
    }

    pub fn statfs(&self) -> VolumeInfo {
        self.volume.info()
    }

    /// Resolve `path`, following symlinks in every position.
    pub fn resolve_path(&self, path: &str) -> Result<Inode, FirmctlError> {
        self.resolve(path, true)
    }

    pub fn stat(&self, path: &str) -> Result<Inode, FirmctlError> {
        self.resolve(path, true)
    }

    /// Like `stat`, but a symlink in the final position is returned itself.
    pub fn symlink_metadata(&self, path: &str) -> Result<Inode, FirmctlError> {
        self.resolve(path, false)
    }

    pub fn read_link(&self, path: &str) -> Result<Vec<u8>, FirmctlError> {
        let inode = self.symlink_metadata(path)?;
        if !inode.is_symlink() {
            return Err(FirmctlError::NotSupported(format!(
                "{}: not a symbolic link",
                path
            )));
        }
        self.symlink_target(&inode)
    }

    /// Entries of a directory in on-disk order, `.` and `..` included.
    pub fn list_directory(&self, path: &str) -> Result<Vec<DirectoryEntry>, FirmctlError> {
        let inode = self.resolve(path, true)?;
        if !inode.is_dir() {
            return Err(FirmctlError::NotADirectory(path.to_string()));
        }
        self.list_inode(&inode, path)
    }

    /// Open a regular file for streaming.
    pub fn read_file(&self, path: &str) -> Result<FileContents, FirmctlError> {
        let inode = self.resolve(path, true)?;
        if !inode.is_file() {
            return Err(FirmctlError::NotAFile(path.to_string()));
        }
        FileContents::open(Arc::clone(&self.volume), inode)
    }

    /// Convenience for small files: the whole contents in memory.
    pub fn read_to_vec(&self, path: &str) -> Result<Vec<u8>, FirmctlError> {
        self.read_file(path)?.read_to_vec()
    }

    fn list_inode(&self, dir: &Inode, display: &str) -> Result<Vec<DirectoryEntry>, FirmctlError> {
        let mut entries = Vec::new();
        self.scan_directory(dir, display, |entry| {
            entries.push(entry);
            ControlFlow::Continue(())
        })?;
        Ok(entries)
    }

    /// Visit directory records in storage order until `visit` breaks.
    fn scan_directory<F>(&self, dir: &Inode, display: &str, mut visit: F) -> Result<(), FirmctlError>
    where
        F: FnMut(DirectoryEntry) -> ControlFlow<()>,
    {
        if !dir.is_dir() {
            return Err(FirmctlError::NotADirectory(display.to_string()));
        }

        if let Some(inline) = self.volume.inline_content(dir)? {
            for entry in self.volume.parse_directory_block(&inline, dir.disk_offset)? {
                if visit(entry).is_break() {
                    break;
                }
            }
            return Ok(());
        }

        let block_size = self.volume.block_size() as u64;
        if dir.size % block_size != 0 {
            return Err(FirmctlError::corrupt(
                dir.disk_offset,
                format!("directory size {} is not a multiple of the block size", dir.size),
            ));
        }
        let blocks = dir.size / block_size;
        if blocks > self.volume.block_count() {
            return Err(FirmctlError::corrupt(
                dir.disk_offset,
                format!("directory claims {} blocks", blocks),
            ));
        }

        let mut cursor = BlockCursor::default();
        let mut buf = vec![0u8; block_size as usize];
        for logical in 0..blocks {
            let Some(physical) = cursor.physical(self.volume.as_ref(), dir, logical)? else {
                return Err(FirmctlError::corrupt(
                    dir.disk_offset,
                    format!("directory {} has a hole at block {}", display, logical),
                ));
            };
            self.volume.read_block(physical, &mut buf)?;
            for entry in self.volume.parse_directory_block(&buf, physical * block_size)? {
                if visit(entry).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// First record named `name`, in storage order.
    fn lookup(&self, dir: &Inode, name: &[u8], display: &str) -> Result<Option<DirectoryEntry>, FirmctlError> {
        let mut found = None;
        self.scan_directory(dir, display, |entry| {
            if entry.name == name {
                found = Some(entry);
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok(found)
    }

    fn symlink_target(&self, link: &Inode) -> Result<Vec<u8>, FirmctlError> {
        if link.size > MAX_SYMLINK_TARGET {
            return Err(FirmctlError::corrupt(
                link.disk_offset,
                format!("symlink target of {} bytes", link.size),
            ));
        }
        FileContents::open(Arc::clone(&self.volume), link.clone())?.read_to_vec()
    }

    fn resolve(&self, path: &str, follow_final: bool) -> Result<Inode, FirmctlError> {
        let root = self.volume.read_inode(self.volume.root_inode())?;
        let mut state = OpenPath::new(root.clone(), path);

        while let Some(component) = state.remaining.pop_front() {
            if component.is_empty() {
                // trailing slash: only a directory may precede it
                if !state.current.is_dir() {
                    return Err(FirmctlError::NotADirectory(state.display()));
                }
                continue;
            }
            if !state.current.is_dir() {
                return Err(FirmctlError::NotADirectory(state.display()));
            }
            if component == b"." {
                continue;
            }

            let display = state.prefix_with(&component);
            let entry = self
                .lookup(&state.current, &component, &state.display())?
                .ok_or_else(|| FirmctlError::PathNotFound(display.clone()))?;
            let child = self.volume.read_inode(entry.inode)?;
            trace!("{} -> inode {}", display, child.number);

            let is_last = state.remaining.is_empty();
            if child.is_symlink() && (follow_final || !is_last) {
                state.hops += 1;
                if state.hops > self.max_symlink_hops {
                    return Err(FirmctlError::TooManySymlinks(display));
                }
                let target = self.symlink_target(&child)?;
                if target.is_empty() {
                    return Err(FirmctlError::PathNotFound(display));
                }
                debug!(
                    "Following symlink {} -> {}",
                    display,
                    String::from_utf8_lossy(&target)
                );
                if target.starts_with(b"/") {
                    state.current = root.clone();
                    state.resolved.clear();
                }
                state.push_target(&target);
                continue;
            }

            state.current = child;
            state.resolved = display;
        }
        Ok(state.current)
    }

    /// Every entry below `path`, excluding `.` and `..`.
    ///
    /// Each directory's entries come out in storage order before any of its
    /// subdirectories are entered. Symlinks are reported, never followed. A
    /// directory reachable through several names is entered only once.
    pub fn walk(&self, path: &str) -> Result<Vec<WalkEntry>, FirmctlError> {
        let start = self.resolve(path, true)?;
        if !start.is_dir() {
            return Err(FirmctlError::NotADirectory(path.to_string()));
        }

        let base = path.trim_end_matches('/').to_string();
        let mut out = Vec::new();
        let mut stack: Vec<(String, Inode, Vec<u64>)> = vec![(base, start.clone(), vec![start.number])];
        let mut visited = HashSet::from([start.number]);

        while let Some((dir_path, dir, ancestors)) = stack.pop() {
            let depth = ancestors.len();
            let display = if dir_path.is_empty() { "/" } else { dir_path.as_str() };
            let mut subdirs = Vec::new();

            for entry in self.list_inode(&dir, display)? {
                if entry.is_dot_or_dotdot() {
                    continue;
                }
                let child_path = format!("{}/{}", dir_path, entry.name_lossy());
                let kind = match entry.kind {
                    FileKind::Unknown => self.volume.read_inode(entry.inode)?.kind,
                    kind => kind,
                };
                out.push(WalkEntry {
                    path: child_path.clone(),
                    inode: entry.inode,
                    kind,
                    depth,
                });

                if kind != FileKind::Directory {
                    continue;
                }
                if ancestors.contains(&entry.inode) {
                    return Err(FirmctlError::corrupt(
                        entry.disk_offset,
                        format!("directory cycle at {}", child_path),
                    ));
                }
                if !visited.insert(entry.inode) {
                    debug!("{} links to an already visited directory", child_path);
                    continue;
                }
                if depth >= self.max_walk_depth {
                    return Err(FirmctlError::corrupt(
                        entry.disk_offset,
                        format!("{} nested deeper than {} levels", child_path, self.max_walk_depth),
                    ));
                }
                let child = self.volume.read_inode(entry.inode)?;
                if !child.is_dir() {
                    return Err(FirmctlError::corrupt(
                        entry.disk_offset,
                        format!("{} is tagged as a directory but inode {} is not", child_path, child.number),
                    ));
                }
                let mut chain = ancestors.clone();
                chain.push(child.number);
                subdirs.push((child_path, child, chain));
            }

            // reversed so the first subdirectory is visited first
            stack.extend(subdirs.into_iter().rev());
        }
        Ok(out)
    }
}
