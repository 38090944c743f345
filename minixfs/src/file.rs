use crate::alloc::Allocator;
use crate::dir::Directory;
use crate::fs::{FsError, Resource, Result};
use crate::io::BlockStorage;
use crate::node::{Inode, InodeTable};
use crate::sb::Layout;
use crate::zone::ZoneMap;
use log::debug;

/// Reads whole files and appends to them through the zone translator.
#[derive(Debug, Clone, Copy)]
pub struct FileEngine {
    layout: Layout,
    zones: ZoneMap,
    inodes: InodeTable,
    alloc: Allocator,
    dirs: Directory,
}

impl FileEngine {
    pub fn new(layout: &Layout) -> Self {
        Self {
            layout: *layout,
            zones: ZoneMap::new(layout),
            inodes: InodeTable::new(layout),
            alloc: Allocator::new(layout),
            dirs: Directory::new(layout),
        }
    }

    fn read_file_inode<T: BlockStorage>(&self, dev: &mut T, ino: u32) -> Result<Inode> {
        let inode = self.inodes.read(dev, ino)?;
        if inode.is_dir() {
            return Err(FsError::NotAFile(format!("inode {}", ino)));
        }
        Ok(inode)
    }

    /// The file's bytes up to its recorded size. Unallocated zones read as
    /// zeros.
    pub fn read_all<T: BlockStorage>(&self, dev: &mut T, ino: u32) -> Result<Vec<u8>> {
        let inode = self.read_file_inode(dev, ino)?;
        let size = inode.size as usize;
        let zone_size = self.layout.zone_size();

        let mut content = Vec::with_capacity(size);
        let mut buf = vec![0; zone_size];
        let mut index = 0;
        while content.len() < size {
            let take = (size - content.len()).min(zone_size);
            match self.zones.lookup(dev, &inode, index)? {
                Some(zone) => {
                    self.zones.read_zone(dev, zone, &mut buf)?;
                    content.extend_from_slice(&buf[..take]);
                }
                None => content.resize(content.len() + take, 0),
            }
            index += 1;
        }
        Ok(content)
    }

    /// Allocates an empty regular file and links it into `parent_ino` as
    /// `name`.
    pub fn create_empty_file<T: BlockStorage>(
        &self,
        dev: &mut T,
        parent_ino: u32,
        name: &str,
    ) -> Result<u32> {
        self.dirs.check_insertable(dev, parent_ino, name)?;
        let ino = self.alloc.allocate_inode(dev)?;
        let linked = self
            .inodes
            .write(dev, ino, &Inode::new_file())
            .and_then(|_| self.dirs.add_entry(dev, parent_ino, name, ino));
        if let Err(err) = linked {
            self.dirs.undo(dev, ino, None);
            return Err(err);
        }
        Ok(ino)
    }

    /// Largest size a file may grow to on this image.
    pub fn size_limit(&self) -> u64 {
        let mut limit = self.zones.max_bytes().min(u64::from(u32::MAX));
        if self.layout.max_size != 0 {
            limit = limit.min(self.layout.max_size);
        }
        limit
    }

    /// Writes `data` after the current end of the file, allocating zones as
    /// needed, then records the new size.
    pub fn append<T: BlockStorage>(&self, dev: &mut T, ino: u32, data: &[u8]) -> Result<()> {
        let mut inode = self.read_file_inode(dev, ino)?;
        if data.is_empty() {
            return Ok(());
        }

        let start = u64::from(inode.size);
        let end = start + data.len() as u64;
        let limit = self.size_limit();
        if end > limit {
            return Err(FsError::FileTooLarge {
                size: end,
                max: limit,
            });
        }

        let zone_size = self.layout.zone_size();
        // Nothing is written unless every zone the append needs is free.
        let needed = self.zones.zones_needed(
            dev,
            &inode,
            start / zone_size as u64,
            (end - 1) / zone_size as u64,
        )?;
        if needed > u64::from(self.alloc.free_count(dev, Resource::Zones)?) {
            return Err(FsError::OutOfSpace(Resource::Zones));
        }

        let mut buf = vec![0; zone_size];
        let mut pos = start;
        let mut rest = data;
        while !rest.is_empty() {
            let index = pos / zone_size as u64;
            let within = (pos % zone_size as u64) as usize;
            let take = (zone_size - within).min(rest.len());
            let zone = self.zones.resolve(dev, ino, &mut inode, index)?;

            if take == zone_size {
                self.zones.write_zone(dev, zone, &rest[..take])?;
            } else {
                // Fresh zones come back zeroed, so whatever precedes `within`
                // is either earlier file data or zeros.
                self.zones.read_zone(dev, zone, &mut buf)?;
                buf[within..within + take].copy_from_slice(&rest[..take]);
                self.zones.write_zone(dev, zone, &buf)?;
            }
            pos += take as u64;
            rest = &rest[take..];
        }

        inode.size = end as u32;
        inode.touch();
        self.inodes.write(dev, ino, &inode)?;
        debug!("inode {} grew from {} to {} bytes", ino, start, end);
        Ok(())
    }
}
