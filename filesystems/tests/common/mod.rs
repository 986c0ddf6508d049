// Shared test fixtures: an in-memory ext image builder and container helpers
#![allow(dead_code)]

use byteorder::{ByteOrder, LittleEndian};
use firmctl_core::container::build_container;
use firmctl_core::IntegrityKind;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;

pub const BLOCK_SIZE: usize = 1024;
pub const INODE_SIZE: usize = 256;
pub const INODES_PER_GROUP: u32 = 256;
const INODE_TABLE_BLOCK: u64 = 5;
const FIRST_FREE_BLOCK: u64 = 69;
const FIRST_INO: u64 = 11;

pub const ROOT_INO: u64 = 2;
pub const BUILD_ID: &str = "20221026104022";
pub const RELEASE_VERSION: &str = "2.15.1.1189";

const S_IFREG: u16 = 0o100000;
const S_IFDIR: u16 = 0o040000;
const S_IFLNK: u16 = 0o120000;

const EXTENTS_FL: u32 = 0x0008_0000;
const EXT_MAGIC: u16 = 0xF30A;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    Indirect,
    Extents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Contiguous,
    /// Leave a free block after every data block.
    Fragmented,
}

struct NodeSpec {
    mode: u16,
    size: u64,
    /// Physical block for each logical block, `None` for holes.
    blocks: Vec<Option<u64>>,
    /// Bytes stored in `i_block` (fast symlinks).
    inline: Option<Vec<u8>>,
    entries: Vec<(Vec<u8>, u64, u8)>,
    links: u16,
}

/// Builds a single-group ext filesystem with 1 KiB blocks.
pub struct ImageBuilder {
    addressing: Addressing,
    image: Vec<u8>,
    next_block: u64,
    nodes: Vec<Option<NodeSpec>>,
    next_inode: u64,
    label: String,
}

impl ImageBuilder {
    pub fn new(addressing: Addressing, total_blocks: usize) -> Self {
        let mut nodes: Vec<Option<NodeSpec>> = (0..=INODES_PER_GROUP as usize).map(|_| None).collect();
        nodes[ROOT_INO as usize] = Some(NodeSpec {
            mode: S_IFDIR | 0o755,
            size: 0,
            blocks: Vec::new(),
            inline: None,
            entries: vec![(b".".to_vec(), ROOT_INO, 2), (b"..".to_vec(), ROOT_INO, 2)],
            links: 2,
        });
        Self {
            addressing,
            image: vec![0u8; total_blocks * BLOCK_SIZE],
            next_block: FIRST_FREE_BLOCK,
            nodes,
            next_inode: FIRST_INO,
            label: "rootfs".to_string(),
        }
    }

    pub fn root(&self) -> u64 {
        ROOT_INO
    }

    fn alloc_block(&mut self) -> u64 {
        let block = self.next_block;
        self.next_block += 1;
        assert!(
            (self.next_block as usize) * BLOCK_SIZE <= self.image.len(),
            "test image too small"
        );
        block
    }

    fn alloc_inode(&mut self) -> u64 {
        let ino = self.next_inode;
        self.next_inode += 1;
        assert!(ino <= INODES_PER_GROUP as u64, "out of inodes");
        ino
    }

    fn node(&mut self, ino: u64) -> &mut NodeSpec {
        self.nodes[ino as usize].as_mut().expect("inode not allocated")
    }

    fn link(&mut self, dir: u64, name: &str, ino: u64, tag: u8) {
        self.node(dir).entries.push((name.as_bytes().to_vec(), ino, tag));
    }

    /// Append a raw directory record, bypassing name uniqueness.
    pub fn link_raw(&mut self, dir: u64, name: &[u8], ino: u64, tag: u8) {
        self.node(dir).entries.push((name.to_vec(), ino, tag));
    }

    pub fn mkdir(&mut self, parent: u64, name: &str) -> u64 {
        let ino = self.alloc_inode();
        self.nodes[ino as usize] = Some(NodeSpec {
            mode: S_IFDIR | 0o755,
            size: 0,
            blocks: Vec::new(),
            inline: None,
            entries: vec![(b".".to_vec(), ino, 2), (b"..".to_vec(), parent, 2)],
            links: 2,
        });
        self.link(parent, name, ino, 2);
        self.node(parent).links += 1;
        ino
    }

    fn write_data(&mut self, data: &[u8], size: u64, holes: &[u64], placement: Placement) -> Vec<Option<u64>> {
        let count = (size as usize).div_ceil(BLOCK_SIZE);
        let mut blocks = Vec::with_capacity(count);
        for logical in 0..count {
            if holes.contains(&(logical as u64)) {
                blocks.push(None);
                continue;
            }
            let physical = self.alloc_block();
            if placement == Placement::Fragmented {
                self.alloc_block();
            }
            let start = logical * BLOCK_SIZE;
            let end = (start + BLOCK_SIZE).min(data.len());
            if start < end {
                let at = physical as usize * BLOCK_SIZE;
                self.image[at..at + end - start].copy_from_slice(&data[start..end]);
            }
            blocks.push(Some(physical));
        }
        blocks
    }

    fn add_file(&mut self, dir: u64, name: &str, data: &[u8], holes: &[u64], placement: Placement) -> u64 {
        let ino = self.alloc_inode();
        let blocks = self.write_data(data, data.len() as u64, holes, placement);
        self.nodes[ino as usize] = Some(NodeSpec {
            mode: S_IFREG | 0o644,
            size: data.len() as u64,
            blocks,
            inline: None,
            entries: Vec::new(),
            links: 1,
        });
        self.link(dir, name, ino, 1);
        ino
    }

    pub fn file(&mut self, dir: u64, name: &str, data: &[u8]) -> u64 {
        self.add_file(dir, name, data, &[], Placement::Contiguous)
    }

    /// A file whose listed logical blocks are holes. `data` must be zero there.
    pub fn sparse_file(&mut self, dir: u64, name: &str, data: &[u8], holes: &[u64]) -> u64 {
        self.add_file(dir, name, data, holes, Placement::Fragmented)
    }

    /// Every block separate, so extent-mapped files need an index node.
    pub fn fragmented_file(&mut self, dir: u64, name: &str, data: &[u8]) -> u64 {
        self.add_file(dir, name, data, &[], Placement::Fragmented)
    }

    /// A file whose declared size differs from the length of its mapped data.
    pub fn file_with_size(&mut self, dir: u64, name: &str, data: &[u8], size: u64) -> u64 {
        let ino = self.alloc_inode();
        let blocks = self.write_data(data, data.len() as u64, &[], Placement::Contiguous);
        self.nodes[ino as usize] = Some(NodeSpec {
            mode: S_IFREG | 0o644,
            size,
            blocks,
            inline: None,
            entries: Vec::new(),
            links: 1,
        });
        self.link(dir, name, ino, 1);
        ino
    }

    pub fn symlink(&mut self, dir: u64, name: &str, target: &str) -> u64 {
        let ino = self.alloc_inode();
        let bytes = target.as_bytes();
        let spec = if bytes.len() < 60 {
            NodeSpec {
                mode: S_IFLNK | 0o777,
                size: bytes.len() as u64,
                blocks: Vec::new(),
                inline: Some(bytes.to_vec()),
                entries: Vec::new(),
                links: 1,
            }
        } else {
            let blocks = self.write_data(bytes, bytes.len() as u64, &[], Placement::Contiguous);
            NodeSpec {
                mode: S_IFLNK | 0o777,
                size: bytes.len() as u64,
                blocks,
                inline: None,
                entries: Vec::new(),
                links: 1,
            }
        };
        self.nodes[ino as usize] = Some(spec);
        self.link(dir, name, ino, 7);
        ino
    }

    /// Serialize directories and inodes, then write the metadata blocks.
    pub fn finish(self) -> Vec<u8> {
        self.finish_with_blocks().0
    }

    /// Like `finish`, also returning each inode's logical-to-physical map.
    pub fn finish_with_blocks(mut self) -> (Vec<u8>, Vec<Vec<Option<u64>>>) {
        for ino in 1..self.nodes.len() as u64 {
            let is_dir = matches!(&self.nodes[ino as usize], Some(n) if n.mode & 0xF000 == S_IFDIR);
            if is_dir {
                let bytes = serialize_directory(&self.node(ino).entries);
                let size = bytes.len() as u64;
                let blocks = self.write_data(&bytes, size, &[], Placement::Contiguous);
                let node = self.node(ino);
                node.size = size;
                node.blocks = blocks;
            }
        }

        let maps: Vec<Vec<Option<u64>>> = self
            .nodes
            .iter()
            .map(|n| n.as_ref().map(|n| n.blocks.clone()).unwrap_or_default())
            .collect();
        for ino in 1..self.nodes.len() as u64 {
            if self.nodes[ino as usize].is_some() {
                self.write_inode(ino);
            }
        }
        self.write_superblock();
        self.write_group_descriptor();
        (self.image, maps)
    }

    fn write_inode(&mut self, ino: u64) {
        let node = self.nodes[ino as usize].take().expect("inode present");
        let mut raw = vec![0u8; INODE_SIZE];
        LittleEndian::write_u16(&mut raw[0..], node.mode);
        LittleEndian::write_u32(&mut raw[4..], node.size as u32);
        LittleEndian::write_u32(&mut raw[108..], (node.size >> 32) as u32);
        LittleEndian::write_u32(&mut raw[8..], 1_666_780_822);
        LittleEndian::write_u32(&mut raw[12..], 1_666_780_822);
        LittleEndian::write_u32(&mut raw[16..], 1_666_780_822);
        LittleEndian::write_u16(&mut raw[26..], node.links);

        let mut meta_blocks = 0u64;
        if let Some(inline) = &node.inline {
            raw[40..40 + inline.len()].copy_from_slice(inline);
        } else {
            match self.addressing {
                Addressing::Indirect => {
                    meta_blocks = self.map_indirect(&node.blocks, &mut raw[40..100]);
                }
                Addressing::Extents => {
                    meta_blocks = self.map_extents(&node.blocks, &mut raw[40..100]);
                    LittleEndian::write_u32(&mut raw[32..], EXTENTS_FL);
                }
            }
        }
        let data_blocks = node.blocks.iter().filter(|b| b.is_some()).count() as u64;
        LittleEndian::write_u32(&mut raw[28..], ((data_blocks + meta_blocks) * 2) as u32);

        let at = INODE_TABLE_BLOCK as usize * BLOCK_SIZE + (ino as usize - 1) * INODE_SIZE;
        self.image[at..at + INODE_SIZE].copy_from_slice(&raw);
    }

    /// Direct, single and double indirect pointers. Returns pointer blocks used.
    fn map_indirect(&mut self, blocks: &[Option<u64>], i_block: &mut [u8]) -> u64 {
        let per_block = BLOCK_SIZE / 4;
        let ptr = |b: &Option<u64>| b.unwrap_or(0) as u32;
        let mut used = 0;

        for (i, b) in blocks.iter().take(12).enumerate() {
            LittleEndian::write_u32(&mut i_block[i * 4..], ptr(b));
        }
        if blocks.len() > 12 {
            let single = self.alloc_block();
            used += 1;
            LittleEndian::write_u32(&mut i_block[48..], single as u32);
            for (i, b) in blocks[12..].iter().take(per_block).enumerate() {
                let at = single as usize * BLOCK_SIZE + i * 4;
                LittleEndian::write_u32(&mut self.image[at..], ptr(b));
            }
        }
        if blocks.len() > 12 + per_block {
            let double = self.alloc_block();
            used += 1;
            LittleEndian::write_u32(&mut i_block[52..], double as u32);
            let rest = &blocks[12 + per_block..];
            for (outer, chunk) in rest.chunks(per_block).enumerate() {
                let child = self.alloc_block();
                used += 1;
                let at = double as usize * BLOCK_SIZE + outer * 4;
                LittleEndian::write_u32(&mut self.image[at..], child as u32);
                for (i, b) in chunk.iter().enumerate() {
                    let at = child as usize * BLOCK_SIZE + i * 4;
                    LittleEndian::write_u32(&mut self.image[at..], ptr(b));
                }
            }
        }
        used
    }

    /// Extent root in the inode; spills into one leaf block past four extents.
    fn map_extents(&mut self, blocks: &[Option<u64>], i_block: &mut [u8]) -> u64 {
        let mut extents: Vec<(u32, u16, u64)> = Vec::new();
        for (logical, b) in blocks.iter().enumerate() {
            let Some(physical) = *b else { continue };
            match extents.last_mut() {
                Some((first, len, start))
                    if *first as usize + *len as usize == logical
                        && *start + *len as u64 == physical =>
                {
                    *len += 1;
                }
                _ => extents.push((logical as u32, 1, physical)),
            }
        }

        let write_extent = |buf: &mut [u8], (first, len, start): (u32, u16, u64)| {
            LittleEndian::write_u32(&mut buf[0..], first);
            LittleEndian::write_u16(&mut buf[4..], len);
            LittleEndian::write_u16(&mut buf[6..], (start >> 32) as u16);
            LittleEndian::write_u32(&mut buf[8..], start as u32);
        };

        if extents.len() <= 4 {
            write_extent_header(i_block, extents.len() as u16, 4, 0);
            for (i, e) in extents.iter().enumerate() {
                write_extent(&mut i_block[12 + i * 12..], *e);
            }
            return 0;
        }

        let max = ((BLOCK_SIZE - 12) / 12) as u16;
        assert!(extents.len() <= max as usize, "too many extents for one leaf");
        let leaf = self.alloc_block();
        let at = leaf as usize * BLOCK_SIZE;
        write_extent_header(&mut self.image[at..], extents.len() as u16, max, 0);
        for (i, e) in extents.iter().enumerate() {
            write_extent(&mut self.image[at + 12 + i * 12..], *e);
        }

        write_extent_header(i_block, 1, 4, 1);
        LittleEndian::write_u32(&mut i_block[12..], 0);
        LittleEndian::write_u32(&mut i_block[16..], leaf as u32);
        LittleEndian::write_u16(&mut i_block[20..], 0);
        1
    }

    fn write_superblock(&mut self) {
        let total_blocks = (self.image.len() / BLOCK_SIZE) as u32;
        let sb = &mut self.image[1024..2048];
        LittleEndian::write_u32(&mut sb[0..], INODES_PER_GROUP);
        LittleEndian::write_u32(&mut sb[4..], total_blocks);
        LittleEndian::write_u32(&mut sb[12..], total_blocks - self.next_block as u32);
        LittleEndian::write_u32(&mut sb[16..], INODES_PER_GROUP - self.next_inode as u32 + 1);
        LittleEndian::write_u32(&mut sb[20..], 1);
        LittleEndian::write_u32(&mut sb[24..], 0);
        LittleEndian::write_u32(&mut sb[32..], 8192);
        LittleEndian::write_u32(&mut sb[40..], INODES_PER_GROUP);
        LittleEndian::write_u16(&mut sb[56..], 0xEF53);
        LittleEndian::write_u16(&mut sb[58..], 1);
        LittleEndian::write_u32(&mut sb[76..], 1);
        LittleEndian::write_u32(&mut sb[84..], FIRST_INO as u32);
        LittleEndian::write_u16(&mut sb[88..], INODE_SIZE as u16);
        let mut incompat = 0x0002;
        if self.addressing == Addressing::Extents {
            incompat |= 0x0040;
        }
        LittleEndian::write_u32(&mut sb[96..], incompat);
        sb[104..120].copy_from_slice(&[
            0x4b, 0x1d, 0x6e, 0x8a, 0x22, 0x31, 0x4c, 0x0e, 0x9a, 0x55, 0x10, 0x2f, 0x7c, 0x3e,
            0x01, 0x99,
        ]);
        let label = self.label.as_bytes();
        sb[120..120 + label.len()].copy_from_slice(label);
    }

    fn write_group_descriptor(&mut self) {
        let gd = &mut self.image[2 * BLOCK_SIZE..2 * BLOCK_SIZE + 32];
        LittleEndian::write_u32(&mut gd[0..], 3);
        LittleEndian::write_u32(&mut gd[4..], 4);
        LittleEndian::write_u32(&mut gd[8..], INODE_TABLE_BLOCK as u32);
    }
}

/// Byte offset of an inode record in a built image.
pub fn inode_offset(ino: u64) -> usize {
    INODE_TABLE_BLOCK as usize * BLOCK_SIZE + (ino as usize - 1) * INODE_SIZE
}

fn write_extent_header(buf: &mut [u8], entries: u16, max: u16, depth: u16) {
    LittleEndian::write_u16(&mut buf[0..], EXT_MAGIC);
    LittleEndian::write_u16(&mut buf[2..], entries);
    LittleEndian::write_u16(&mut buf[4..], max);
    LittleEndian::write_u16(&mut buf[6..], depth);
}

/// Pack records into 1 KiB blocks; the last record of a block absorbs the slack.
fn serialize_directory(entries: &[(Vec<u8>, u64, u8)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut block = vec![0u8; BLOCK_SIZE];
    let mut pos = 0usize;
    let mut last: Option<usize> = None;

    for (name, ino, tag) in entries {
        let needed = (8 + name.len()).div_ceil(4) * 4;
        if pos + needed > BLOCK_SIZE {
            if let Some(l) = last {
                LittleEndian::write_u16(&mut block[l + 4..], (BLOCK_SIZE - l) as u16);
            }
            out.extend_from_slice(&block);
            block = vec![0u8; BLOCK_SIZE];
            pos = 0;
        }
        LittleEndian::write_u32(&mut block[pos..], *ino as u32);
        LittleEndian::write_u16(&mut block[pos + 4..], needed as u16);
        block[pos + 6] = name.len() as u8;
        block[pos + 7] = *tag;
        block[pos + 8..pos + 8 + name.len()].copy_from_slice(name);
        last = Some(pos);
        pos += needed;
    }
    if let Some(l) = last {
        LittleEndian::write_u16(&mut block[l + 4..], (BLOCK_SIZE - l) as u16);
    }
    out.extend_from_slice(&block);
    out
}

pub const ROOT_LISTING: [&str; 21] = [
    ".", "..", "lost+found", "bin", "boot", "dev", "etc", "home", "lib", "media", "mnt",
    "postinst", "proc", "run", "sbin", "sys", "tmp", "uboot-postinst", "uboot-version", "usr",
    "var",
];

/// Deterministic pseudo-random bytes.
pub fn pattern(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

pub const UPDATE_CONF: &str = "GROUP=Prod\nREMARKABLE_RELEASE_VERSION=2.15.1.1189\n";

/// A root filesystem shaped like a tablet firmware image.
pub fn firmware_rootfs(addressing: Addressing) -> Vec<u8> {
    let mut b = ImageBuilder::new(addressing, 4096);
    let root = b.root();
    b.mkdir(root, "lost+found");
    let bin = b.mkdir(root, "bin");
    b.mkdir(root, "boot");
    b.mkdir(root, "dev");
    let etc = b.mkdir(root, "etc");
    let home = b.mkdir(root, "home");
    b.mkdir(root, "lib");
    b.mkdir(root, "media");
    b.mkdir(root, "mnt");
    b.file(root, "postinst", b"#!/bin/sh\nexit 0\n");
    b.mkdir(root, "proc");
    b.mkdir(root, "run");
    b.mkdir(root, "sbin");
    b.mkdir(root, "sys");
    b.mkdir(root, "tmp");
    b.file(root, "uboot-postinst", b"#!/bin/sh\nfw_setenv upgrade_available 1\n");
    b.file(root, "uboot-version", b"2018.07\n");
    let usr = b.mkdir(root, "usr");
    let var = b.mkdir(root, "var");

    b.file(etc, "version", BUILD_ID.as_bytes());
    b.file(etc, "hostname", b"reMarkable\n");
    b.symlink(etc, "mtab", "/proc/self/mounts");
    b.symlink(etc, "localtime", "../usr/share/zoneinfo/UTC");

    b.file(bin, "busybox", &pattern(300 * 1024, 1));
    b.symlink(bin, "sh", "busybox");

    let share = b.mkdir(usr, "share");
    let remarkable = b.mkdir(share, "remarkable");
    b.file(remarkable, "update.conf", UPDATE_CONF.as_bytes());
    let zoneinfo = b.mkdir(share, "zoneinfo");
    b.file(zoneinfo, "UTC", b"TZif2\0\0\0");
    let lib = b.mkdir(usr, "lib");
    b.fragmented_file(lib, "libqsgepaper.so", &pattern(60 * 1024, 2));

    let mut sparse = pattern(20 * 1024, 3);
    for hole in [2usize, 3, 10] {
        sparse[hole * BLOCK_SIZE..(hole + 1) * BLOCK_SIZE].fill(0);
    }
    b.sparse_file(var, "sparse.img", &sparse, &[2, 3, 10]);

    let long_target = format!("/usr/share/{}zoneinfo/UTC", "../share/".repeat(10));
    b.symlink(var, "slowlink", &long_target);
    b.symlink(var, "loop-a", "loop-b");
    b.symlink(var, "loop-b", "loop-a");
    b.symlink(var, "dangling", "/nowhere");

    let root_home = b.mkdir(home, "root");
    b.file(root_home, ".bashrc", b"export PS1='$ '\n");

    // enough entries to spill /var/log over several directory blocks
    let log = b.mkdir(var, "log");
    for i in 0..100 {
        b.file(log, &format!("messages.{}", i), format!("entry {}\n", i).as_bytes());
    }

    b.finish()
}

/// Wrap a filesystem in an MBR with one active Linux partition at 1 MiB.
pub fn with_mbr(fs: &[u8]) -> Vec<u8> {
    let start = 1024 * 1024;
    let mut payload = vec![0u8; start + fs.len()];
    payload[start..].copy_from_slice(fs);
    let entry = 446;
    payload[entry] = 0x80;
    payload[entry + 4] = 0x83;
    LittleEndian::write_u32(&mut payload[entry + 8..], (start / 512) as u32);
    LittleEndian::write_u32(&mut payload[entry + 12..], (fs.len() / 512) as u32);
    payload[510] = 0x55;
    payload[511] = 0xAA;
    payload
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn sha256_container(payload: &[u8]) -> Vec<u8> {
    let digest = Sha256::digest(payload);
    build_container("2.15.1.1189", 2, IntegrityKind::Sha256, &digest, payload)
}

pub fn write_temp(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).expect("create temp file");
    file.write_all(bytes).expect("write temp file");
    path
}
