use std::collections::HashSet;

use crate::alloc::Allocator;
use crate::fs::{FsError, Result};
use crate::io::{BlockStorage, BLOCK_SIZE};
use crate::node::{Inode, InodeTable, DIRECT_ZONES, DOUBLE_INDIRECT_SLOT, INDIRECT_SLOT};
use crate::sb::Layout;
use log::{debug, trace, warn};

/// Where the zone number for a logical zone index is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// A direct slot of the inode.
    Direct(usize),
    /// A slot of the inode's indirect zone.
    Indirect(usize),
    /// A slot of the indirect zone found at the first index of the double
    /// indirect zone.
    DoubleIndirect(usize, usize),
}

/// Translates logical zone indexes of a file into physical zone numbers,
/// growing the pointer graph on demand. Also owns zone granular I/O since
/// a zone may span several device blocks.
#[derive(Debug, Clone, Copy)]
pub struct ZoneMap {
    layout: Layout,
    alloc: Allocator,
    inodes: InodeTable,
}

impl ZoneMap {
    pub fn new(layout: &Layout) -> Self {
        Self {
            layout: *layout,
            alloc: Allocator::new(layout),
            inodes: InodeTable::new(layout),
        }
    }

    /// Logical zones reachable through the direct, indirect and double
    /// indirect slots.
    pub fn capacity(&self) -> u64 {
        let fan_out = self.layout.ptrs_per_zone() as u64;
        DIRECT_ZONES as u64 + fan_out + fan_out * fan_out
    }

    /// Largest file size the pointer graph can address.
    pub fn max_bytes(&self) -> u64 {
        self.capacity() * self.layout.zone_size() as u64
    }

    pub fn slot(&self, index: u64) -> Result<Slot> {
        let fan_out = self.layout.ptrs_per_zone() as u64;
        if index < DIRECT_ZONES as u64 {
            return Ok(Slot::Direct(index as usize));
        }
        let index = index - DIRECT_ZONES as u64;
        if index < fan_out {
            return Ok(Slot::Indirect(index as usize));
        }
        let index = index - fan_out;
        if index < fan_out * fan_out {
            return Ok(Slot::DoubleIndirect(
                (index / fan_out) as usize,
                (index % fan_out) as usize,
            ));
        }
        Err(FsError::FileTooLarge {
            size: (DIRECT_ZONES as u64 + fan_out + index + 1) * self.layout.zone_size() as u64,
            max: self.max_bytes(),
        })
    }

    /// The inode slot at the root of a slot's chain, and the indexes to follow
    /// through each indirect zone below it.
    fn route(&self, index: u64) -> Result<(usize, Vec<usize>)> {
        Ok(match self.slot(index)? {
            Slot::Direct(i) => (i, vec![]),
            Slot::Indirect(i) => (INDIRECT_SLOT, vec![i]),
            Slot::DoubleIndirect(outer, inner) => (DOUBLE_INDIRECT_SLOT, vec![outer, inner]),
        })
    }

    /// Physical zone holding a logical zone of the file, or `None` for a hole.
    pub fn lookup<T: BlockStorage>(
        &self,
        dev: &mut T,
        inode: &Inode,
        index: u64,
    ) -> Result<Option<u32>> {
        let (root, path) = self.route(index)?;
        let mut zone = match self.check(inode.zones[root])? {
            Some(zone) => zone,
            None => return Ok(None),
        };
        for &slot in &path {
            zone = match self.check(self.read_ptr(dev, zone, slot)?)? {
                Some(next) => next,
                None => return Ok(None),
            };
        }
        Ok(Some(zone))
    }

    /// Number of zones `resolve` would allocate to back every logical zone in
    /// `first..=last`, indirect zones included. Indirect zones shared by
    /// several indexes are counted once.
    pub fn zones_needed<T: BlockStorage>(
        &self,
        dev: &mut T,
        inode: &Inode,
        first: u64,
        last: u64,
    ) -> Result<u64> {
        let mut missing = HashSet::new();
        for index in first..=last {
            let (root, path) = self.route(index)?;
            let present = self.present_levels(dev, inode, root, &path)?;
            for level in present..=path.len() {
                missing.insert((root, path[..level].to_vec()));
            }
        }
        Ok(missing.len() as u64)
    }

    /// How many zones of a chain already exist, counting from the inode slot.
    fn present_levels<T: BlockStorage>(
        &self,
        dev: &mut T,
        inode: &Inode,
        root: usize,
        path: &[usize],
    ) -> Result<usize> {
        let mut level = 0;
        let mut pointer = inode.zones[root];
        while let Some(zone) = self.check(pointer)? {
            if level == path.len() {
                return Ok(level + 1);
            }
            pointer = self.read_ptr(dev, zone, path[level])?;
            level += 1;
        }
        Ok(level)
    }

    /// Like `lookup`, but allocates the data zone and any missing indirect
    /// zones on the way. New zones are zero-filled, and the inode or indirect
    /// zone receiving a new pointer is persisted right away.
    pub fn resolve<T: BlockStorage>(
        &self,
        dev: &mut T,
        ino: u32,
        inode: &mut Inode,
        index: u64,
    ) -> Result<u32> {
        let (root, path) = self.route(index)?;

        // Follow the existing chain as far as it goes. `holder` is the zone
        // storing the pointer for `level`, or `None` when that is the inode.
        let mut level = 0;
        let mut holder = None;
        let mut pointer = inode.zones[root];
        while let Some(zone) = self.check(pointer)? {
            if level == path.len() {
                return Ok(zone);
            }
            holder = Some(zone);
            pointer = self.read_ptr(dev, zone, path[level])?;
            level += 1;
        }

        let fresh = self.allocate_zeroed(dev, path.len() + 1 - level)?;
        let mut target = 0;
        for (offset, &zone) in fresh.iter().enumerate() {
            match holder {
                None => {
                    inode.zones[root] = zone;
                    self.inodes.write(dev, ino, inode)?;
                }
                Some(parent) => self.write_ptr(dev, parent, path[level + offset - 1], zone)?,
            }
            debug!("inode {} zone index {} level {} -> zone {}", ino, index, level + offset, zone);
            holder = Some(zone);
            target = zone;
        }
        Ok(target)
    }

    /// Allocates `count` zones and zero-fills them. Either all are acquired or
    /// none: on failure the zones taken so far are released.
    pub fn allocate_zeroed<T: BlockStorage>(&self, dev: &mut T, count: usize) -> Result<Vec<u32>> {
        let mut fresh = Vec::with_capacity(count);
        for _ in 0..count {
            match self.alloc.allocate_zone(dev) {
                Ok(zone) => fresh.push(zone),
                Err(err) => {
                    for &zone in fresh.iter().rev() {
                        if let Err(free_err) = self.alloc.free_zone(dev, zone) {
                            warn!("could not release zone {}: {}", zone, free_err);
                        }
                    }
                    return Err(err);
                }
            }
        }
        let zeros = vec![0; self.layout.zone_size()];
        for &zone in &fresh {
            self.write_zone(dev, zone, &zeros)?;
        }
        Ok(fresh)
    }

    /// Reads a whole zone into `buf`, which must be exactly one zone long.
    pub fn read_zone<T: BlockStorage>(&self, dev: &mut T, zone: u32, buf: &mut [u8]) -> Result<()> {
        trace!("read zone {}", zone);
        let first = self.layout.zone_block(zone);
        for (i, chunk) in buf.chunks_mut(BLOCK_SIZE).enumerate() {
            dev.read_block(first + i, chunk)?;
        }
        Ok(())
    }

    /// Writes a whole zone from `buf`, which must be exactly one zone long.
    pub fn write_zone<T: BlockStorage>(&self, dev: &mut T, zone: u32, buf: &[u8]) -> Result<()> {
        trace!("write zone {}", zone);
        let first = self.layout.zone_block(zone);
        for (i, chunk) in buf.chunks(BLOCK_SIZE).enumerate() {
            dev.write_block(first + i, chunk)?;
        }
        Ok(())
    }

    /// Maps a stored zone number to `None` when unallocated, rejecting
    /// numbers outside the data region.
    fn check(&self, zone: u32) -> Result<Option<u32>> {
        if zone == 0 {
            return Ok(None);
        }
        if !self.layout.is_data_zone(zone) {
            return Err(FsError::CorruptImage(format!(
                "zone pointer {} is outside the data region",
                zone
            )));
        }
        Ok(Some(zone))
    }

    /// The block within an indirect zone holding a slot, and the slot's byte
    /// offset inside that block.
    fn ptr_position(&self, zone: u32, slot: usize) -> (usize, usize) {
        let offset = slot * self.layout.ptr_size();
        (
            self.layout.zone_block(zone) + offset / BLOCK_SIZE,
            offset % BLOCK_SIZE,
        )
    }

    fn read_ptr<T: BlockStorage>(&self, dev: &mut T, zone: u32, slot: usize) -> Result<u32> {
        let (block, offset) = self.ptr_position(zone, slot);
        let mut buf = [0; BLOCK_SIZE];
        dev.read_block(block, &mut buf)?;
        Ok(match self.layout.ptr_size() {
            2 => u32::from(u16::from_le_bytes([buf[offset], buf[offset + 1]])),
            _ => u32::from_le_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]),
        })
    }

    fn write_ptr<T: BlockStorage>(
        &self,
        dev: &mut T,
        zone: u32,
        slot: usize,
        value: u32,
    ) -> Result<()> {
        let (block, offset) = self.ptr_position(zone, slot);
        let mut buf = [0; BLOCK_SIZE];
        dev.read_block(block, &mut buf)?;
        match self.layout.ptr_size() {
            2 => buf[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes()),
            _ => buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes()),
        }
        dev.write_block(block, &buf)?;
        Ok(())
    }
}
