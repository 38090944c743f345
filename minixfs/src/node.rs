use std::convert::TryFrom;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fs::{FsError, Result};
use crate::io::{BlockNumber, BlockStorage, BLOCK_SIZE};
use crate::sb::{Layout, Version};

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// The inode of the root directory.
pub const ROOT_INODE: u32 = 1;

pub const S_IFMT: u16 = 0o170_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFREG: u16 = 0o100_000;

const DEFAULT_FILE_PERMS: u16 = 0o644;
const DEFAULT_DIR_PERMS: u16 = 0o755;

/// Zone slots 0 through 6 address data directly.
pub const DIRECT_ZONES: usize = 7;
pub const INDIRECT_SLOT: usize = 7;
pub const DOUBLE_INDIRECT_SLOT: usize = 8;
/// V1 inodes carry 9 zone slots, V2 inodes add a triple indirect one.
const V1_ZONE_SLOTS: usize = 9;
const V2_ZONE_SLOTS: usize = 10;

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy)]
struct DiskInodeV1 {
    mode: U16,
    uid: U16,
    size: U32,
    time: U32,
    gid: u8,
    nlinks: u8,
    zones: [U16; V1_ZONE_SLOTS],
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy)]
struct DiskInodeV2 {
    mode: U16,
    nlinks: U16,
    uid: U16,
    gid: U16,
    size: U32,
    atime: U32,
    mtime: U32,
    ctime: U32,
    zones: [U32; V2_ZONE_SLOTS],
}

/// In-memory form of an inode, wide enough for either on-disk version. V1
/// inodes keep a single timestamp, which is read into and written from
/// `mtime`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inode {
    /// File type and permission bits.
    pub mode: u16,
    pub nlinks: u16,
    pub uid: u16,
    pub gid: u16,
    /// Size of the file in bytes.
    pub size: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// Zone numbers, 0 meaning unallocated: seven direct slots, then the
    /// indirect, double indirect and (V2 only) triple indirect zones.
    pub zones: [u32; V2_ZONE_SLOTS],
}

impl Inode {
    pub fn new_file() -> Self {
        Self::stamped(S_IFREG | DEFAULT_FILE_PERMS, 1)
    }

    pub fn new_directory() -> Self {
        Self::stamped(S_IFDIR | DEFAULT_DIR_PERMS, 2)
    }

    fn stamped(mode: u16, nlinks: u16) -> Self {
        let now = now();
        Self {
            mode,
            nlinks,
            atime: now,
            mtime: now,
            ctime: now,
            ..Self::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Marks the inode as modified now.
    pub fn touch(&mut self) {
        let now = now();
        self.mtime = now;
        self.ctime = now;
    }

    fn decode(version: Version, buf: &[u8]) -> Option<Self> {
        match version {
            Version::V1 => {
                let raw = DiskInodeV1::read_from_prefix(buf)?;
                let mut zones = [0; V2_ZONE_SLOTS];
                for (slot, zone) in zones.iter_mut().zip(raw.zones.iter()) {
                    *slot = u32::from(zone.get());
                }
                Some(Self {
                    mode: raw.mode.get(),
                    nlinks: u16::from(raw.nlinks),
                    uid: raw.uid.get(),
                    gid: u16::from(raw.gid),
                    size: raw.size.get(),
                    atime: raw.time.get(),
                    mtime: raw.time.get(),
                    ctime: raw.time.get(),
                    zones,
                })
            }
            Version::V2 => {
                let raw = DiskInodeV2::read_from_prefix(buf)?;
                let mut zones = [0; V2_ZONE_SLOTS];
                for (slot, zone) in zones.iter_mut().zip(raw.zones.iter()) {
                    *slot = zone.get();
                }
                Some(Self {
                    mode: raw.mode.get(),
                    nlinks: raw.nlinks.get(),
                    uid: raw.uid.get(),
                    gid: raw.gid.get(),
                    size: raw.size.get(),
                    atime: raw.atime.get(),
                    mtime: raw.mtime.get(),
                    ctime: raw.ctime.get(),
                    zones,
                })
            }
        }
    }

    /// Encodes into the start of `buf`. Fails when a field does not fit the
    /// narrower V1 record.
    fn encode(&self, version: Version, buf: &mut [u8]) -> Result<()> {
        let overflow = |field: &str| {
            FsError::CorruptImage(format!("{} does not fit a {:?} inode", field, version))
        };
        match version {
            Version::V1 => {
                let mut zones = [U16::new(0); V1_ZONE_SLOTS];
                for (slot, zone) in zones.iter_mut().zip(self.zones.iter()) {
                    *slot = U16::new(u16::try_from(*zone).map_err(|_| overflow("zone"))?);
                }
                let raw = DiskInodeV1 {
                    mode: U16::new(self.mode),
                    uid: U16::new(self.uid),
                    size: U32::new(self.size),
                    time: U32::new(self.mtime),
                    gid: u8::try_from(self.gid).map_err(|_| overflow("gid"))?,
                    nlinks: u8::try_from(self.nlinks).map_err(|_| overflow("link count"))?,
                    zones,
                };
                buf[..raw.as_bytes().len()].copy_from_slice(raw.as_bytes());
            }
            Version::V2 => {
                let mut zones = [U32::new(0); V2_ZONE_SLOTS];
                for (slot, zone) in zones.iter_mut().zip(self.zones.iter()) {
                    *slot = U32::new(*zone);
                }
                let raw = DiskInodeV2 {
                    mode: U16::new(self.mode),
                    nlinks: U16::new(self.nlinks),
                    uid: U16::new(self.uid),
                    gid: U16::new(self.gid),
                    size: U32::new(self.size),
                    atime: U32::new(self.atime),
                    mtime: U32::new(self.mtime),
                    ctime: U32::new(self.ctime),
                    zones,
                };
                buf[..raw.as_bytes().len()].copy_from_slice(raw.as_bytes());
            }
        }
        Ok(())
    }
}

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}

/// The fixed array of inode records following the bitmaps. Inode numbers are
/// 1-based. Records are read from and written to the device on every call.
#[derive(Debug, Clone, Copy)]
pub struct InodeTable {
    start: BlockNumber,
    count: u32,
    version: Version,
}

impl InodeTable {
    pub fn new(layout: &Layout) -> Self {
        Self {
            start: layout.inode_table_start,
            count: layout.inode_count,
            version: layout.version,
        }
    }

    /// The block holding an inode and the byte offset of its record within it.
    fn position(&self, ino: u32) -> Result<(BlockNumber, usize)> {
        if ino == 0 || ino > self.count {
            return Err(FsError::InvalidInode(ino));
        }
        let offset = (ino as usize - 1) * self.version.inode_size();
        Ok((self.start + offset / BLOCK_SIZE, offset % BLOCK_SIZE))
    }

    pub fn read<T: BlockStorage>(&self, dev: &mut T, ino: u32) -> Result<Inode> {
        let (block, offset) = self.position(ino)?;
        let mut buf = [0; BLOCK_SIZE];
        dev.read_block(block, &mut buf)?;
        Inode::decode(self.version, &buf[offset..])
            .ok_or_else(|| FsError::CorruptImage(format!("inode {} is truncated", ino)))
    }

    pub fn write<T: BlockStorage>(&self, dev: &mut T, ino: u32, inode: &Inode) -> Result<()> {
        let (block, offset) = self.position(ino)?;
        let mut buf = [0; BLOCK_SIZE];
        dev.read_block(block, &mut buf)?;
        inode.encode(self.version, &mut buf[offset..])?;
        dev.write_block(block, &buf)?;
        Ok(())
    }
}
