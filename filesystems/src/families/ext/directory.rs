// Linear ext directory blocks
// Hashed (htree) directories keep linear records too, so a sequential scan
// sees every entry.

use crate::families::{DirectoryEntry, FileKind};
use byteorder::{ByteOrder, LittleEndian};
use firmctl_core::FirmctlError;

const DIRENT_HEADER_SIZE: usize = 8;

fn file_kind_from_tag(tag: u8) -> FileKind {
    match tag {
        1 => FileKind::Regular,
        2 => FileKind::Directory,
        3 => FileKind::CharDevice,
        4 => FileKind::BlockDevice,
        5 => FileKind::Fifo,
        6 => FileKind::Socket,
        7 => FileKind::Symlink,
        _ => FileKind::Unknown,
    }
}

/// On 64 KiB blocks the value 0 or 65535 stands for a whole-block record.
fn decode_rec_len(raw: u16, block_size: usize) -> usize {
    if block_size >= 65536 && (raw == 0 || raw == 65535) {
        65536
    } else {
        raw as usize
    }
}

/// Decode every live record in one directory block.
///
/// `has_filetype` selects between the one-byte name length plus type tag
/// layout and the older two-byte name length.
pub fn parse_directory_block(
    block: &[u8],
    disk_offset: u64,
    has_filetype: bool,
) -> Result<Vec<DirectoryEntry>, FirmctlError> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos < block.len() {
        let at = disk_offset + pos as u64;
        if pos + DIRENT_HEADER_SIZE > block.len() {
            return Err(FirmctlError::corrupt(at, "truncated directory record header"));
        }

        let inode = LittleEndian::read_u32(&block[pos..]);
        let rec_len = decode_rec_len(LittleEndian::read_u16(&block[pos + 4..]), block.len());
        let (name_len, kind) = if has_filetype {
            (block[pos + 6] as usize, file_kind_from_tag(block[pos + 7]))
        } else {
            (
                LittleEndian::read_u16(&block[pos + 6..]) as usize,
                FileKind::Unknown,
            )
        };

        if rec_len < DIRENT_HEADER_SIZE || rec_len % 4 != 0 {
            return Err(FirmctlError::corrupt(
                at,
                format!("directory record length {} invalid", rec_len),
            ));
        }
        if pos + rec_len > block.len() {
            return Err(FirmctlError::corrupt(
                at,
                format!("directory record length {} overruns block", rec_len),
            ));
        }
        if DIRENT_HEADER_SIZE + name_len > rec_len {
            return Err(FirmctlError::corrupt(
                at,
                format!("name length {} exceeds record length {}", name_len, rec_len),
            ));
        }

        if inode != 0 {
            if name_len == 0 {
                return Err(FirmctlError::corrupt(at, "live directory record with empty name"));
            }
            let name_start = pos + DIRENT_HEADER_SIZE;
            entries.push(DirectoryEntry {
                name: block[name_start..name_start + name_len].to_vec(),
                inode: inode as u64,
                kind,
                record_len: rec_len as u32,
                disk_offset: at,
            });
        }

        pos += rec_len;
    }

    Ok(entries)
}
