// Streaming access to file data
use crate::families::{BlockRun, Inode, Volume};
use firmctl_core::FirmctlError;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

/// Caches the most recent logical-to-physical run so sequential reads map
/// each extent once.
#[derive(Debug, Default)]
pub(crate) struct BlockCursor {
    start: u64,
    run: Option<BlockRun>,
}

impl BlockCursor {
    pub(crate) fn physical(
        &mut self,
        volume: &dyn Volume,
        inode: &Inode,
        logical: u64,
    ) -> Result<Option<u64>, FirmctlError> {
        let cached = self
            .run
            .filter(|run| logical >= self.start && logical - self.start < run.len);
        let run = match cached {
            Some(run) => run,
            None => {
                let run = volume.map_block(inode, logical)?;
                self.start = logical;
                self.run = Some(run);
                run
            }
        };
        Ok(run.physical.map(|p| p + (logical - self.start)))
    }
}

/// Contents of one regular file or symlink.
///
/// Implements `Read` and `Seek`; holes read as zeros and output stops at the
/// inode's declared size. Only one block is buffered at a time.
pub struct FileContents {
    volume: Arc<dyn Volume>,
    inode: Inode,
    inline: Option<Vec<u8>>,
    position: u64,
    cursor: BlockCursor,
    block: Vec<u8>,
    buffered: Option<u64>,
}

impl FileContents {
    pub(crate) fn open(volume: Arc<dyn Volume>, inode: Inode) -> Result<Self, FirmctlError> {
        let inline = volume.inline_content(&inode)?;
        Ok(Self {
            volume,
            inode,
            inline,
            position: 0,
            cursor: BlockCursor::default(),
            block: Vec::new(),
            buffered: None,
        })
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn size(&self) -> u64 {
        self.inode.size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Start over from offset 0.
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Copy bytes at the current position into `buf`, never crossing a block
    /// boundary. Returns 0 at end of file.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, FirmctlError> {
        let size = self.inode.size;
        if self.position >= size || buf.is_empty() {
            return Ok(0);
        }
        let remaining = size - self.position;

        if let Some(inline) = &self.inline {
            let start = self.position as usize;
            let n = buf.len().min(inline.len().saturating_sub(start));
            buf[..n].copy_from_slice(&inline[start..start + n]);
            self.position += n as u64;
            return Ok(n);
        }

        let block_size = self.volume.block_size() as u64;
        let logical = self.position / block_size;
        let within = (self.position % block_size) as usize;
        let n = buf
            .len()
            .min(block_size as usize - within)
            .min(remaining.min(usize::MAX as u64) as usize);

        match self.cursor.physical(self.volume.as_ref(), &self.inode, logical)? {
            None => buf[..n].fill(0),
            Some(physical) => {
                if self.buffered != Some(physical) {
                    self.block.resize(block_size as usize, 0);
                    self.buffered = None;
                    self.volume.read_block(physical, &mut self.block)?;
                    self.buffered = Some(physical);
                }
                buf[..n].copy_from_slice(&self.block[within..within + n]);
            }
        }
        self.position += n as u64;
        Ok(n)
    }

    /// Read everything from the current position to the end.
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>, FirmctlError> {
        let remaining = self.inode.size.saturating_sub(self.position);
        let mut out = Vec::with_capacity(remaining.min(64 * 1024 * 1024) as usize);
        let mut buf = vec![0u8; self.volume.block_size() as usize];
        loop {
            let n = self.read_chunk(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Iterate over the remaining contents in chunks of at most one block.
    pub fn chunks(&mut self) -> Chunks<'_> {
        let len = self.volume.block_size() as usize;
        Chunks {
            contents: self,
            buf: vec![0u8; len],
            failed: false,
        }
    }
}

impl Read for FileContents {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_chunk(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Seek for FileContents {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.inode.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

pub struct Chunks<'a> {
    contents: &'a mut FileContents,
    buf: Vec<u8>,
    failed: bool,
}

impl Iterator for Chunks<'_> {
    type Item = Result<Vec<u8>, FirmctlError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.contents.read_chunk(&mut self.buf) {
            Ok(0) => None,
            Ok(n) => Some(Ok(self.buf[..n].to_vec())),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
