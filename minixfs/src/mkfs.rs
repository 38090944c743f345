use std::convert::TryFrom;

use crate::alloc::Allocator;
use crate::dir::Directory;
use crate::fs::{FsError, Result};
use crate::io::{BlockStorage, BLOCK_SIZE};
use crate::node::{Inode, InodeTable, ROOT_INODE};
use crate::sb::{Superblock, Version, LONG_NAME_LEN, SUPERBLOCK_BLOCK};
use log::info;

const BITS_PER_BLOCK: u64 = (BLOCK_SIZE * 8) as u64;
/// Largest file a V1 image can address: 7 direct, 512 indirect and 512 * 512
/// double indirect zones of 1K.
const V1_MAX_SIZE: u32 = (7 + 512 + 512 * 512) * 1024;
const V2_MAX_SIZE: u32 = 0x7FFF_FFFF;

/// Parameters for laying out a new image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    pub version: Version,
    /// Width of directory entry names, 14 or 30.
    pub name_len: usize,
    /// Inode count. Defaults to a third of the device blocks, rounded up to
    /// fill whole inode table blocks.
    pub inodes: Option<u32>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            version: Version::V1,
            name_len: LONG_NAME_LEN,
            inodes: None,
        }
    }
}

fn blocks_for_bits(bits: u64) -> u64 {
    (bits + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK
}

/// Computes the superblock for a device of `blocks` blocks. Zones are one
/// block each.
pub fn plan(blocks: usize, options: &FormatOptions) -> Result<Superblock> {
    let mut sb = Superblock::new(options.version, options.name_len)?;
    let too_small = || {
        FsError::InvalidGeometry(format!(
            "{} blocks cannot hold a {:?} filesystem",
            blocks, options.version
        ))
    };

    let zones = match options.version {
        Version::V1 => blocks.min(usize::from(u16::MAX)) as u64,
        Version::V2 => blocks.min(u32::MAX as usize) as u64,
    };

    let per_block = (BLOCK_SIZE / options.version.inode_size()) as u64;
    let max_inodes = (u64::from(u16::MAX) / per_block) * per_block;
    let requested = match options.inodes {
        Some(0) => {
            return Err(FsError::InvalidGeometry(
                "at least one inode is required".to_string(),
            ))
        }
        Some(count) => u64::from(count),
        None => (blocks as u64 / 3).max(1),
    };
    let inodes = ((requested + per_block - 1) / per_block * per_block).min(max_inodes);
    let inode_blocks = inodes / per_block;
    let imap_blocks = blocks_for_bits(inodes + 1);

    // The zone bitmap shrinks the data region it has to track, so settle on
    // the smallest size that still covers what is left.
    let mut zmap_blocks = 1;
    let first_data_zone = loop {
        let first_data_zone = 2 + imap_blocks + zmap_blocks + inode_blocks;
        if first_data_zone >= zones {
            return Err(too_small());
        }
        let needed = blocks_for_bits(zones - first_data_zone + 1);
        if needed <= zmap_blocks {
            break first_data_zone;
        }
        zmap_blocks = needed;
    };

    let narrow = |value: u64| u16::try_from(value).map_err(|_| too_small());
    sb.inodes_count = narrow(inodes)?;
    sb.imap_blocks = narrow(imap_blocks)?;
    sb.zmap_blocks = narrow(zmap_blocks)?;
    sb.first_data_zone = narrow(first_data_zone)?;
    sb.log_zone_size = 0;
    match options.version {
        Version::V1 => {
            sb.nzones = narrow(zones)?;
            sb.max_size = V1_MAX_SIZE;
        }
        Version::V2 => {
            sb.zones = zones as u32;
            sb.max_size = V2_MAX_SIZE;
        }
    }
    Ok(sb)
}

/// Lays out an empty filesystem over the whole device: superblock, bitmaps
/// with their reserved and padding bits set, a cleared inode table and a root
/// directory holding `.` and `..`.
pub fn format<T: BlockStorage>(dev: &mut T, options: &FormatOptions) -> Result<Superblock> {
    let blocks = dev.block_count();
    let sb = plan(blocks, options)?;
    let layout = sb.layout(blocks)?;

    let zeros = [0; BLOCK_SIZE];
    for block in 0..layout.zone_block(layout.first_data_zone) {
        dev.write_block(block, &zeros)?;
    }

    let mut buf = [0; BLOCK_SIZE];
    sb.serialize_into(&mut buf);
    dev.write_block(SUPERBLOCK_BLOCK, &buf)?;

    write_bitmap(dev, layout.imap_start, layout.imap_blocks, layout.inode_bits())?;
    write_bitmap(dev, layout.zmap_start, layout.zmap_blocks, layout.zone_bits())?;

    let ino = Allocator::new(&layout).allocate_inode(dev)?;
    if ino != ROOT_INODE {
        return Err(FsError::CorruptImage(format!(
            "root directory was given inode {}",
            ino
        )));
    }
    let zone = Directory::new(&layout).create_directory_block(dev, ROOT_INODE, ROOT_INODE)?;
    let mut root = Inode::new_directory();
    root.size = 2 * layout.dirent_size() as u32;
    root.zones[0] = zone;
    InodeTable::new(&layout).write(dev, ROOT_INODE, &root)?;

    dev.sync_disk()?;
    info!(
        "formatted {:?} image: {} inodes, {} zones, first data zone {}",
        layout.version, layout.inode_count, layout.zone_count, layout.first_data_zone
    );
    Ok(sb)
}

/// Writes a bitmap with bit 0 and every bit at or past `bits` marked used.
fn write_bitmap<T: BlockStorage>(
    dev: &mut T,
    start: usize,
    blocks: usize,
    bits: u32,
) -> Result<()> {
    let bits = u64::from(bits);
    for i in 0..blocks {
        let mut buf = [0; BLOCK_SIZE];
        let base = i as u64 * BITS_PER_BLOCK;
        for bit in 0..BITS_PER_BLOCK {
            let global = base + bit;
            if global == 0 || global >= bits {
                buf[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        dev.write_block(start + i, &buf)?;
    }
    Ok(())
}
