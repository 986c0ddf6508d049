// Random-access byte sources
// Every read names its own offset, so one source can serve many readers at once.

use crate::FirmctlError;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Positional read access to an immutable byte store.
pub trait ReadAt: Send + Sync {
    /// Fill `buf` from `offset`, failing if the store ends first.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Total number of bytes in the store.
    fn size(&self) -> io::Result<u64>;
}

impl ReadAt for File {
    #[cfg(unix)]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        FileExt::read_exact_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.seek_read(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to fill whole buffer",
                    ))
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl ReadAt for Vec<u8> {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "offset beyond buffer"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read beyond buffer"))?;
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }
}

/// A bounded window into a shared byte source.
///
/// Offsets passed to the read methods are relative to the start of the window.
/// Cloning is cheap; the underlying handle is closed when the last clone drops.
#[derive(Clone)]
pub struct ByteRange {
    source: Arc<dyn ReadAt>,
    offset: u64,
    len: u64,
}

impl std::fmt::Debug for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteRange")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl ByteRange {
    /// Window covering the whole source.
    pub fn new(source: Arc<dyn ReadAt>) -> Result<Self, FirmctlError> {
        let len = source.size()?;
        Ok(Self {
            source,
            offset: 0,
            len,
        })
    }

    /// Open a file read-only and wrap all of it.
    pub fn open_file(path: &Path) -> Result<Self, FirmctlError> {
        let file = File::open(path)?;
        Self::new(Arc::new(file))
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self {
            source: Arc::new(bytes),
            offset: 0,
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Absolute offset of this window within the underlying source.
    pub fn base_offset(&self) -> u64 {
        self.offset
    }

    pub fn contains(&self, offset: u64, length: u64) -> bool {
        offset
            .checked_add(length)
            .map_or(false, |end| end <= self.len)
    }

    /// Narrow the window. Fails with `OutOfBounds` if the sub-range does not fit.
    pub fn slice(&self, offset: u64, length: u64) -> Result<ByteRange, FirmctlError> {
        if !self.contains(offset, length) {
            return Err(FirmctlError::out_of_bounds("range", offset, length, self.len));
        }
        Ok(ByteRange {
            source: Arc::clone(&self.source),
            offset: self.offset + offset,
            len: length,
        })
    }

    /// Fill `buf` from `offset` within the window.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), FirmctlError> {
        if !self.contains(offset, buf.len() as u64) {
            return Err(FirmctlError::out_of_bounds(
                "read",
                offset,
                buf.len() as u64,
                self.len,
            ));
        }
        let absolute = self.offset + offset;
        self.source
            .read_exact_at(buf, absolute)
            .map_err(|source| FirmctlError::Io {
                offset: absolute,
                source,
            })
    }

    pub fn read_vec(&self, offset: u64, length: usize) -> Result<Vec<u8>, FirmctlError> {
        let mut buf = vec![0u8; length];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Visit the window front to back through a single reusable buffer.
    pub fn for_each_chunk<F>(&self, chunk_size: usize, mut visit: F) -> Result<(), FirmctlError>
    where
        F: FnMut(&[u8]) -> Result<(), FirmctlError>,
    {
        let chunk_size = chunk_size.max(1);
        let mut buf = vec![0u8; chunk_size.min(self.len.min(usize::MAX as u64) as usize).max(1)];
        let mut offset = 0u64;
        while offset < self.len {
            let n = (self.len - offset).min(buf.len() as u64) as usize;
            self.read_at(offset, &mut buf[..n])?;
            visit(&buf[..n])?;
            offset += n as u64;
        }
        Ok(())
    }
}
