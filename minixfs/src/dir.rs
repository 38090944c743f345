use std::borrow::Cow;

use crate::alloc::Allocator;
use crate::fs::{FsError, Result};
use crate::io::{BlockStorage, BLOCK_SIZE};
use crate::node::{Inode, InodeTable};
use crate::sb::Layout;
use crate::zone::ZoneMap;
use log::{debug, warn};

/// A decoded directory record. The name has its NUL padding removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub name: Vec<u8>,
}

impl DirEntry {
    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    fn is_free(&self) -> bool {
        self.inode == 0
    }
}

/// Reads and writes the fixed width records making up a directory's data:
/// a little-endian 16-bit inode number followed by a NUL padded name of the
/// image's filename width.
#[derive(Debug, Clone, Copy)]
pub struct Directory {
    layout: Layout,
    zones: ZoneMap,
    inodes: InodeTable,
    alloc: Allocator,
}

impl Directory {
    pub fn new(layout: &Layout) -> Self {
        Self {
            layout: *layout,
            zones: ZoneMap::new(layout),
            inodes: InodeTable::new(layout),
            alloc: Allocator::new(layout),
        }
    }

    /// Rejects names that cannot be stored as a single directory record.
    pub fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') || name.contains('\0') {
            return Err(FsError::InvalidName(name.to_string()));
        }
        if name.len() > self.layout.name_len {
            return Err(FsError::NameTooLong {
                name: name.to_string(),
                max: self.layout.name_len,
            });
        }
        Ok(())
    }

    fn decode_entry(&self, record: &[u8]) -> DirEntry {
        let inode = u32::from(u16::from_le_bytes([record[0], record[1]]));
        let field = &record[2..self.layout.dirent_size()];
        let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        DirEntry {
            inode,
            name: field[..len].to_vec(),
        }
    }

    fn encode_entry(&self, record: &mut [u8], ino: u32, name: &[u8]) {
        record[0..2].copy_from_slice(&(ino as u16).to_le_bytes());
        let field = &mut record[2..self.layout.dirent_size()];
        for b in field.iter_mut() {
            *b = 0;
        }
        field[..name.len()].copy_from_slice(name);
    }

    fn read_dir_inode<T: BlockStorage>(&self, dev: &mut T, ino: u32) -> Result<Inode> {
        let inode = self.inodes.read(dev, ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory(format!("inode {}", ino)));
        }
        Ok(inode)
    }

    /// Every record slot within the directory's recorded size, free slots
    /// included, with its byte offset in the directory.
    fn slots<T: BlockStorage>(&self, dev: &mut T, dir: &Inode) -> Result<Vec<(u64, DirEntry)>> {
        let dirent = self.layout.dirent_size() as u64;
        let zone_size = self.layout.zone_size() as u64;
        let size = u64::from(dir.size);
        if size > self.zones.max_bytes() {
            return Err(FsError::CorruptImage(format!(
                "directory size {} is beyond what its zones can address",
                size
            )));
        }
        if size % dirent != 0 {
            warn!("directory size {} is not a multiple of {}", size, dirent);
        }
        let used = size - size % dirent;

        let mut slots = Vec::with_capacity((used / dirent) as usize);
        let mut buf = vec![0; zone_size as usize];
        let mut start = 0;
        while start < used {
            let len = (used - start).min(zone_size);
            match self.zones.lookup(dev, dir, start / zone_size)? {
                Some(zone) => self.zones.read_zone(dev, zone, &mut buf)?,
                None => buf.iter_mut().for_each(|b| *b = 0),
            }
            for (i, record) in buf[..len as usize]
                .chunks(dirent as usize)
                .enumerate()
            {
                slots.push((start + i as u64 * dirent, self.decode_entry(record)));
            }
            start += len;
        }
        Ok(slots)
    }

    /// Entries in on-disk order, free slots skipped.
    pub fn list_entries<T: BlockStorage>(&self, dev: &mut T, dir_ino: u32) -> Result<Vec<DirEntry>> {
        let dir = self.read_dir_inode(dev, dir_ino)?;
        Ok(self
            .slots(dev, &dir)?
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|entry| !entry.is_free())
            .collect())
    }

    pub fn lookup<T: BlockStorage>(&self, dev: &mut T, dir_ino: u32, name: &str) -> Result<u32> {
        self.list_entries(dev, dir_ino)?
            .into_iter()
            .find(|entry| entry.name == name.as_bytes())
            .map(|entry| entry.inode)
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    /// Checks that `name` could be added to the directory right now and
    /// returns the directory's inode.
    pub fn check_insertable<T: BlockStorage>(
        &self,
        dev: &mut T,
        dir_ino: u32,
        name: &str,
    ) -> Result<Inode> {
        self.check_name(name)?;
        let dir = self.read_dir_inode(dev, dir_ino)?;
        let taken = self
            .slots(dev, &dir)?
            .iter()
            .any(|(_, entry)| !entry.is_free() && entry.name == name.as_bytes());
        if taken {
            return Err(FsError::DuplicateName(name.to_string()));
        }
        Ok(dir)
    }

    /// Stores a record in the first free slot, or appends one past the end,
    /// allocating a new zone when the last one is full.
    pub fn add_entry<T: BlockStorage>(
        &self,
        dev: &mut T,
        dir_ino: u32,
        name: &str,
        ino: u32,
    ) -> Result<()> {
        let mut dir = self.check_insertable(dev, dir_ino, name)?;
        let dirent = self.layout.dirent_size() as u64;
        let zone_size = self.layout.zone_size() as u64;

        let slots = self.slots(dev, &dir)?;
        let (offset, grows) = match slots.iter().find(|(_, entry)| entry.is_free()) {
            Some((offset, _)) => (*offset, false),
            None => (slots.len() as u64 * dirent, true),
        };
        if offset + dirent > u64::from(u32::MAX) {
            return Err(FsError::FileTooLarge {
                size: offset + dirent,
                max: u64::from(u32::MAX),
            });
        }

        let zone = self.zones.resolve(dev, dir_ino, &mut dir, offset / zone_size)?;
        let within = (offset % zone_size) as usize;
        let block = self.layout.zone_block(zone) + within / BLOCK_SIZE;
        let mut buf = [0; BLOCK_SIZE];
        dev.read_block(block, &mut buf)?;
        let at = within % BLOCK_SIZE;
        self.encode_entry(&mut buf[at..at + dirent as usize], ino, name.as_bytes());
        dev.write_block(block, &buf)?;

        if grows {
            dir.size = (offset + dirent) as u32;
        }
        dir.touch();
        self.inodes.write(dev, dir_ino, &dir)?;
        debug!("directory {}: {} -> inode {} at offset {}", dir_ino, name, ino, offset);
        Ok(())
    }

    /// Allocates and zero-fills a zone holding only the `.` and `..` records.
    pub fn create_directory_block<T: BlockStorage>(
        &self,
        dev: &mut T,
        self_ino: u32,
        parent_ino: u32,
    ) -> Result<u32> {
        let zone = self.zones.allocate_zeroed(dev, 1)?[0];
        let dirent = self.layout.dirent_size();
        let mut buf = [0; BLOCK_SIZE];
        self.encode_entry(&mut buf[..dirent], self_ino, b".");
        self.encode_entry(&mut buf[dirent..2 * dirent], parent_ino, b"..");
        dev.write_block(self.layout.zone_block(zone), &buf)?;
        Ok(zone)
    }

    /// Creates a directory named `name` inside `parent_ino` and returns its
    /// inode. The parent gains a link for the new `..` entry.
    pub fn make_directory<T: BlockStorage>(
        &self,
        dev: &mut T,
        parent_ino: u32,
        name: &str,
    ) -> Result<u32> {
        let parent = self.check_insertable(dev, parent_ino, name)?;
        if u32::from(parent.nlinks) >= self.layout.version.link_max() {
            return Err(FsError::TooManyLinks(parent_ino));
        }

        let ino = self.alloc.allocate_inode(dev)?;
        let zone = match self.create_directory_block(dev, ino, parent_ino) {
            Ok(zone) => zone,
            Err(err) => {
                self.undo(dev, ino, None);
                return Err(err);
            }
        };

        let mut inode = Inode::new_directory();
        inode.size = 2 * self.layout.dirent_size() as u32;
        inode.zones[0] = zone;
        let linked = self
            .inodes
            .write(dev, ino, &inode)
            .and_then(|_| self.add_entry(dev, parent_ino, name, ino));
        if let Err(err) = linked {
            self.undo(dev, ino, Some(zone));
            return Err(err);
        }

        let mut parent = self.inodes.read(dev, parent_ino)?;
        parent.nlinks += 1;
        self.inodes.write(dev, parent_ino, &parent)?;
        Ok(ino)
    }

    /// Releases units acquired by a creation that could not be completed.
    pub(crate) fn undo<T: BlockStorage>(&self, dev: &mut T, ino: u32, zone: Option<u32>) {
        if let Some(zone) = zone {
            if let Err(err) = self.alloc.free_zone(dev, zone) {
                warn!("could not release zone {}: {}", zone, err);
            }
        }
        if let Err(err) = self.alloc.free_inode(dev, ino) {
            warn!("could not release inode {}: {}", ino, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Resource;
    use crate::node::ROOT_INODE;
    use crate::sb::Version;
    use crate::testing;

    fn names(entries: &[DirEntry]) -> Vec<String> {
        entries.iter().map(|e| e.name_lossy().into_owned()).collect()
    }

    #[test]
    fn fresh_root_holds_dot_entries() {
        let mut fs = testing::image(Version::V1, 14, 64);
        let entries = fs.dirs.list_entries(&mut fs.dev, ROOT_INODE).unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry { inode: 1, name: b".".to_vec() },
                DirEntry { inode: 1, name: b"..".to_vec() },
            ]
        );
    }

    #[test]
    fn make_directory_writes_dot_entries_first() {
        let mut fs = testing::image(Version::V2, 30, 64);
        let d = fs.dirs.make_directory(&mut fs.dev, ROOT_INODE, "d").unwrap();
        let e = fs.dirs.make_directory(&mut fs.dev, d, "e").unwrap();

        let entries = fs.dirs.list_entries(&mut fs.dev, e).unwrap();
        assert_eq!(names(&entries), vec![".", ".."]);
        assert_eq!(entries[0].inode, e);
        assert_eq!(entries[1].inode, d);

        let d_inode = fs.inodes.read(&mut fs.dev, d).unwrap();
        assert!(d_inode.is_dir());
        assert_eq!(d_inode.nlinks, 3);
        assert_eq!(fs.inodes.read(&mut fs.dev, ROOT_INODE).unwrap().nlinks, 3);
        assert_eq!(fs.dirs.lookup(&mut fs.dev, d, "e").unwrap(), e);
    }

    #[test]
    fn name_width_boundaries() {
        let mut fs = testing::image(Version::V1, 14, 64);
        fs.dirs
            .add_entry(&mut fs.dev, ROOT_INODE, "abcdefghijklmn", 2)
            .unwrap();
        assert_eq!(
            fs.dirs.lookup(&mut fs.dev, ROOT_INODE, "abcdefghijklmn").unwrap(),
            2
        );
        assert!(matches!(
            fs.dirs.add_entry(&mut fs.dev, ROOT_INODE, "abcdefghijklmno", 3),
            Err(FsError::NameTooLong { max: 14, .. })
        ));

        let mut fs = testing::image(Version::V2, 30, 64);
        let longest = "a".repeat(30);
        fs.dirs.add_entry(&mut fs.dev, ROOT_INODE, &longest, 2).unwrap();
        assert_eq!(fs.dirs.lookup(&mut fs.dev, ROOT_INODE, &longest).unwrap(), 2);
        assert!(matches!(
            fs.dirs.add_entry(&mut fs.dev, ROOT_INODE, &"a".repeat(31), 3),
            Err(FsError::NameTooLong { max: 30, .. })
        ));
    }

    #[test]
    fn invalid_and_duplicate_names_are_rejected() {
        let mut fs = testing::image(Version::V1, 14, 64);
        fs.dirs.add_entry(&mut fs.dev, ROOT_INODE, "a", 2).unwrap();

        assert!(matches!(
            fs.dirs.add_entry(&mut fs.dev, ROOT_INODE, "a", 3),
            Err(FsError::DuplicateName(_))
        ));
        assert!(matches!(
            fs.dirs.add_entry(&mut fs.dev, ROOT_INODE, "..", 3),
            Err(FsError::DuplicateName(_))
        ));
        assert!(matches!(
            fs.dirs.add_entry(&mut fs.dev, ROOT_INODE, "", 3),
            Err(FsError::InvalidName(_))
        ));
        assert!(matches!(
            fs.dirs.add_entry(&mut fs.dev, ROOT_INODE, "x/y", 3),
            Err(FsError::InvalidName(_))
        ));
        assert!(matches!(
            fs.dirs.lookup(&mut fs.dev, ROOT_INODE, "b"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn directory_grows_into_new_zone() {
        let mut fs = testing::image(Version::V1, 14, 64);
        // 64 records fit a 1K zone and the root starts with two.
        for i in 0..62 {
            fs.dirs
                .add_entry(&mut fs.dev, ROOT_INODE, &format!("f{}", i), 2)
                .unwrap();
        }
        let root = fs.inodes.read(&mut fs.dev, ROOT_INODE).unwrap();
        assert_eq!(root.size, 1024);
        assert_eq!(root.zones[1], 0);

        let free = fs.alloc.free_count(&mut fs.dev, Resource::Zones).unwrap();
        fs.dirs.add_entry(&mut fs.dev, ROOT_INODE, "last", 3).unwrap();
        let root = fs.inodes.read(&mut fs.dev, ROOT_INODE).unwrap();
        assert_eq!(root.size, 1040);
        assert_ne!(root.zones[1], 0);
        assert_eq!(
            fs.alloc.free_count(&mut fs.dev, Resource::Zones).unwrap(),
            free - 1
        );

        let entries = fs.dirs.list_entries(&mut fs.dev, ROOT_INODE).unwrap();
        assert_eq!(entries.len(), 65);
        assert_eq!(entries[64].name, b"last".to_vec());
    }

    #[test]
    fn free_slots_are_reused() {
        let mut fs = testing::image(Version::V1, 14, 64);
        for name in &["a", "b", "c"] {
            fs.dirs.add_entry(&mut fs.dev, ROOT_INODE, name, 2).unwrap();
        }
        // Clear the record of "b", the fourth slot of the root's first zone.
        let root = fs.inodes.read(&mut fs.dev, ROOT_INODE).unwrap();
        let block = fs.layout.zone_block(root.zones[0]);
        let mut buf = [0; BLOCK_SIZE];
        fs.dev.read_block(block, &mut buf).unwrap();
        buf[48..50].copy_from_slice(&[0, 0]);
        fs.dev.write_block(block, &buf).unwrap();

        fs.dirs.add_entry(&mut fs.dev, ROOT_INODE, "d", 5).unwrap();
        let root_after = fs.inodes.read(&mut fs.dev, ROOT_INODE).unwrap();
        assert_eq!(root_after.size, root.size);
        let entries = fs.dirs.list_entries(&mut fs.dev, ROOT_INODE).unwrap();
        assert_eq!(names(&entries), vec![".", "..", "a", "d", "c"]);
    }

    #[test]
    fn oversized_directory_is_corrupt() {
        let mut fs = testing::image(Version::V1, 14, 64);
        let mut root = fs.inodes.read(&mut fs.dev, ROOT_INODE).unwrap();
        root.size = u32::MAX - 15;
        fs.inodes.write(&mut fs.dev, ROOT_INODE, &root).unwrap();

        assert!(matches!(
            fs.dirs.list_entries(&mut fs.dev, ROOT_INODE),
            Err(FsError::CorruptImage(_))
        ));
        assert!(matches!(
            fs.dirs.add_entry(&mut fs.dev, ROOT_INODE, "x", 2),
            Err(FsError::CorruptImage(_))
        ));
    }

    #[test]
    fn files_are_not_directories() {
        let mut fs = testing::image(Version::V1, 14, 64);
        let (ino, _) = testing::new_file(&mut fs);
        assert!(matches!(
            fs.dirs.list_entries(&mut fs.dev, ino),
            Err(FsError::NotADirectory(_))
        ));
        assert!(matches!(
            fs.dirs.make_directory(&mut fs.dev, ino, "x"),
            Err(FsError::NotADirectory(_))
        ));
    }

    #[test]
    fn failed_mkdir_releases_its_inode() {
        let mut fs = testing::image(Version::V1, 14, 64);
        while fs.alloc.free_count(&mut fs.dev, Resource::Zones).unwrap() > 0 {
            fs.alloc.allocate_zone(&mut fs.dev).unwrap();
        }
        let free_inodes = fs.alloc.free_count(&mut fs.dev, Resource::Inodes).unwrap();
        assert!(matches!(
            fs.dirs.make_directory(&mut fs.dev, ROOT_INODE, "d"),
            Err(FsError::OutOfSpace(Resource::Zones))
        ));
        assert_eq!(
            fs.alloc.free_count(&mut fs.dev, Resource::Inodes).unwrap(),
            free_inodes
        );
        assert!(fs.dirs.lookup(&mut fs.dev, ROOT_INODE, "d").is_err());
    }
}
