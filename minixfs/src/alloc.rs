use crate::fs::{FsError, Resource, Result};
use crate::io::{BlockNumber, BlockStorage, BLOCK_SIZE};
use crate::sb::Layout;
use log::{debug, warn};

const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// A bit-vector spread over consecutive disk blocks. Bit `i` lives in byte
/// `i / 8` at mask `1 << (i % 8)`, bit 0 is reserved and never handed out.
///
/// Nothing is cached: each query reads the containing block and each update
/// writes it straight back.
#[derive(Debug, Clone, Copy)]
pub struct Bitmap {
    start: BlockNumber,
    blocks: usize,
    /// Bits in use, bit 0 included. Bits at or past this bound are padding.
    bits: u32,
}

impl Bitmap {
    pub fn new(start: BlockNumber, blocks: usize, bits: u32) -> Self {
        Self {
            start,
            blocks,
            bits,
        }
    }

    fn locate(&self, bit: u32) -> (BlockNumber, usize, u8) {
        let block = self.start + (bit / BITS_PER_BLOCK) as usize;
        let within = (bit % BITS_PER_BLOCK) as usize;
        (block, within / 8, 1 << (within % 8))
    }

    pub fn get<T: BlockStorage>(&self, dev: &mut T, bit: u32) -> Result<State> {
        let (block, byte, mask) = self.locate(bit);
        let mut buf = [0; BLOCK_SIZE];
        dev.read_block(block, &mut buf)?;
        if buf[byte] & mask == 0 {
            Ok(State::Free)
        } else {
            Ok(State::Used)
        }
    }

    /// Updates a single bit and persists the block holding it.
    pub fn set<T: BlockStorage>(&self, dev: &mut T, bit: u32, state: State) -> Result<()> {
        let (block, byte, mask) = self.locate(bit);
        let mut buf = [0; BLOCK_SIZE];
        dev.read_block(block, &mut buf)?;
        match state {
            State::Used => buf[byte] |= mask,
            State::Free => buf[byte] &= !mask,
        }
        dev.write_block(block, &buf)?;
        Ok(())
    }

    /// Lowest clear bit in `1..bits`.
    pub fn first_free<T: BlockStorage>(&self, dev: &mut T) -> Result<Option<u32>> {
        let mut buf = [0; BLOCK_SIZE];
        for i in 0..self.blocks {
            let base = i as u32 * BITS_PER_BLOCK;
            if base >= self.bits {
                break;
            }
            dev.read_block(self.start + i, &mut buf)?;
            for (byte, value) in buf.iter().enumerate() {
                if *value == 0xFF {
                    continue;
                }
                for shift in 0..8 {
                    let bit = base + (byte * 8 + shift) as u32;
                    if bit >= self.bits {
                        return Ok(None);
                    }
                    if bit != 0 && value & (1 << shift) == 0 {
                        return Ok(Some(bit));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Number of clear bits in `1..bits`.
    pub fn count_free<T: BlockStorage>(&self, dev: &mut T) -> Result<u32> {
        let mut buf = [0; BLOCK_SIZE];
        let mut free = 0;
        for i in 0..self.blocks {
            let base = i as u32 * BITS_PER_BLOCK;
            if base >= self.bits {
                break;
            }
            dev.read_block(self.start + i, &mut buf)?;
            let end = (self.bits - base).min(BITS_PER_BLOCK);
            free += (0..end)
                .filter(|&bit| base + bit != 0)
                .filter(|&bit| buf[(bit / 8) as usize] & (1 << (bit % 8)) == 0)
                .count() as u32;
        }
        Ok(free)
    }
}

/// First-fit allocation of inodes and zones over the two on-disk bitmaps.
///
/// Inode `n` maps to bit `n` of the inode bitmap. Zone `z` maps to bit
/// `z - first_data_zone + 1` of the zone bitmap, so the first data zone is
/// the first zone handed out.
#[derive(Debug, Clone, Copy)]
pub struct Allocator {
    inodes: Bitmap,
    zones: Bitmap,
    first_data_zone: u32,
}

impl Allocator {
    pub fn new(layout: &Layout) -> Self {
        Self {
            inodes: Bitmap::new(layout.imap_start, layout.imap_blocks, layout.inode_bits()),
            zones: Bitmap::new(layout.zmap_start, layout.zmap_blocks, layout.zone_bits()),
            first_data_zone: layout.first_data_zone,
        }
    }

    pub fn allocate_inode<T: BlockStorage>(&self, dev: &mut T) -> Result<u32> {
        let ino = self.claim(dev, Resource::Inodes)?;
        debug!("allocated inode {}", ino);
        Ok(ino)
    }

    pub fn allocate_zone<T: BlockStorage>(&self, dev: &mut T) -> Result<u32> {
        let zone = self.claim(dev, Resource::Zones)? + self.first_data_zone - 1;
        debug!("allocated zone {}", zone);
        Ok(zone)
    }

    pub fn free_inode<T: BlockStorage>(&self, dev: &mut T, ino: u32) -> Result<()> {
        self.release(dev, Resource::Inodes, ino)?;
        debug!("freed inode {}", ino);
        Ok(())
    }

    pub fn free_zone<T: BlockStorage>(&self, dev: &mut T, zone: u32) -> Result<()> {
        self.release(dev, Resource::Zones, zone)?;
        debug!("freed zone {}", zone);
        Ok(())
    }

    pub fn is_allocated<T: BlockStorage>(
        &self,
        dev: &mut T,
        kind: Resource,
        number: u32,
    ) -> Result<bool> {
        let bit = self.bit(kind, number)?;
        Ok(self.bitmap(kind).get(dev, bit)? == State::Used)
    }

    pub fn free_count<T: BlockStorage>(&self, dev: &mut T, kind: Resource) -> Result<u32> {
        self.bitmap(kind).count_free(dev)
    }

    fn claim<T: BlockStorage>(&self, dev: &mut T, kind: Resource) -> Result<u32> {
        let bitmap = self.bitmap(kind);
        let bit = bitmap
            .first_free(dev)?
            .ok_or(FsError::OutOfSpace(kind))?;
        bitmap.set(dev, bit, State::Used)?;
        Ok(bit)
    }

    fn release<T: BlockStorage>(&self, dev: &mut T, kind: Resource, number: u32) -> Result<()> {
        let bit = self.bit(kind, number)?;
        let bitmap = self.bitmap(kind);
        if bitmap.get(dev, bit)? == State::Free {
            warn!("{} {} freed twice", kind, number);
            return Err(FsError::CorruptImage(format!(
                "{} {} is not allocated",
                kind, number
            )));
        }
        bitmap.set(dev, bit, State::Free)
    }

    fn bitmap(&self, kind: Resource) -> &Bitmap {
        match kind {
            Resource::Inodes => &self.inodes,
            Resource::Zones => &self.zones,
        }
    }

    fn bit(&self, kind: Resource, number: u32) -> Result<u32> {
        match kind {
            Resource::Inodes => {
                if number == 0 || number >= self.inodes.bits {
                    return Err(FsError::InvalidInode(number));
                }
                Ok(number)
            }
            Resource::Zones => {
                let bit = number
                    .checked_sub(self.first_data_zone)
                    .map(|offset| offset + 1)
                    .filter(|&bit| bit < self.zones.bits);
                bit.ok_or_else(|| {
                    FsError::CorruptImage(format!("zone {} is outside the data region", number))
                })
            }
        }
    }
}
