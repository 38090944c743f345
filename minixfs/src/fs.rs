use std::fmt;

use crate::alloc::Allocator;
use crate::dir::{DirEntry, Directory};
use crate::file::FileEngine;
use crate::io::{BlockStorage, BLOCK_SIZE};
use crate::mkfs::{self, FormatOptions};
use crate::node::{Inode, InodeTable, ROOT_INODE};
use crate::sb::{Layout, Superblock, SUPERBLOCK_BLOCK};
use crate::zone::ZoneMap;

use log::{debug, info};
use thiserror::Error;

/// The two kinds of unit tracked by the allocation bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Inodes,
    Zones,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Inodes => write!(f, "inode"),
            Resource::Zones => write!(f, "zone"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("corrupt image: {0}")]
    CorruptImage(String),
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    #[error("inode {0} is out of range")]
    InvalidInode(u32),
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("not a regular file: {0}")]
    NotAFile(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("name already exists: {0}")]
    DuplicateName(String),
    #[error("name {name:?} is longer than {max} bytes")]
    NameTooLong { name: String, max: usize },
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("no free {0} left")]
    OutOfSpace(Resource),
    #[error("file would grow to {size} bytes, the limit is {max}")]
    FileTooLarge { size: u64, max: u64 },
    #[error("inode {0} has too many links")]
    TooManyLinks(u32),
    #[error("image i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Allocation state of an image, counted from the bitmaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    pub inodes: u32,
    pub free_inodes: u32,
    /// Zones in the data region.
    pub data_zones: u32,
    pub free_zones: u32,
}

/// A Minix V1 or V2 filesystem image opened for direct manipulation.
///
/// # Layout
/// ==========================================================================
/// | Boot | SuperBlock | Bitmap (inodes) | Bitmap (zones) | Inodes | Zones |
/// ==========================================================================
///
/// Paths are either `name`, an entry of the root directory, or `dir/name`,
/// an entry of a directory in the root. Nothing is cached between calls: the
/// image is the only state.
pub struct MinixFs<T: BlockStorage> {
    pub(crate) dev: T,
    super_block: Superblock,
    pub(crate) layout: Layout,
    pub(crate) alloc: Allocator,
    pub(crate) inodes: InodeTable,
    pub(crate) zones: ZoneMap,
    pub(crate) dirs: Directory,
    pub(crate) files: FileEngine,
}

impl<T: BlockStorage> MinixFs<T> {
    /// Reads the superblock and derives the image layout.
    pub fn open(mut dev: T) -> Result<Self> {
        if dev.block_count() <= SUPERBLOCK_BLOCK {
            return Err(FsError::CorruptImage(
                "image is too small to hold a superblock".to_string(),
            ));
        }
        let mut block_buf = [0; BLOCK_SIZE];
        dev.read_block(SUPERBLOCK_BLOCK, &mut block_buf)?;
        let super_block = Superblock::parse(&block_buf)?;
        let layout = super_block.layout(dev.block_count())?;
        info!(
            "opened {:?} image: {} inodes, {} zones of {} bytes, {} byte names",
            layout.version,
            layout.inode_count,
            layout.zone_count,
            layout.zone_size(),
            layout.name_len
        );

        Ok(MinixFs {
            dev,
            super_block,
            layout,
            alloc: Allocator::new(&layout),
            inodes: InodeTable::new(&layout),
            zones: ZoneMap::new(&layout),
            dirs: Directory::new(&layout),
            files: FileEngine::new(&layout),
        })
    }

    /// Writes a fresh filesystem over the whole device and opens it.
    pub fn format(mut dev: T, options: &FormatOptions) -> Result<Self> {
        mkfs::format(&mut dev, options)?;
        Self::open(dev)
    }

    pub fn superblock(&self) -> &Superblock {
        &self.super_block
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn device_mut(&mut self) -> &mut T {
        &mut self.dev
    }

    /// Returns ownership of the underlying device to the caller.
    pub fn into_device(self) -> T {
        self.dev
    }

    pub fn sync(&mut self) -> Result<()> {
        self.dev.sync_disk()?;
        Ok(())
    }

    pub fn usage(&mut self) -> Result<Usage> {
        Ok(Usage {
            inodes: self.layout.inode_count,
            free_inodes: self.alloc.free_count(&mut self.dev, Resource::Inodes)?,
            data_zones: self.layout.zone_count - self.layout.first_data_zone,
            free_zones: self.alloc.free_count(&mut self.dev, Resource::Zones)?,
        })
    }

    /// Inode number of the entry a path names.
    pub fn resolve(&mut self, path: &str) -> Result<u32> {
        let (dir, name) = split_path(path)?;
        let parent = self.parent_of(dir)?;
        self.dirs.lookup(&mut self.dev, parent, name)
    }

    pub fn metadata(&mut self, path: &str) -> Result<Inode> {
        let ino = self.resolve(path)?;
        self.inodes.read(&mut self.dev, ino)
    }

    /// Entries of the root directory, or of the directory at `path`.
    pub fn ls(&mut self, path: Option<&str>) -> Result<Vec<DirEntry>> {
        let ino = match path {
            None => ROOT_INODE,
            Some(path) => {
                let ino = self.resolve(path)?;
                if !self.inodes.read(&mut self.dev, ino)?.is_dir() {
                    return Err(FsError::NotADirectory(path.to_string()));
                }
                ino
            }
        };
        self.dirs.list_entries(&mut self.dev, ino)
    }

    /// Full contents of the regular file at `path`.
    pub fn cat(&mut self, path: &str) -> Result<Vec<u8>> {
        let ino = self.file_at(path)?;
        self.files.read_all(&mut self.dev, ino)
    }

    /// Creates an empty regular file and returns its inode number.
    pub fn touch(&mut self, path: &str) -> Result<u32> {
        let (dir, name) = split_path(path)?;
        let parent = self.parent_of(dir)?;
        let ino = self.files.create_empty_file(&mut self.dev, parent, name)?;
        debug!("created file {} as inode {}", path, ino);
        Ok(ino)
    }

    /// Creates a directory holding `.` and `..` and returns its inode number.
    pub fn mkdir(&mut self, path: &str) -> Result<u32> {
        let (dir, name) = split_path(path)?;
        let parent = self.parent_of(dir)?;
        let ino = self.dirs.make_directory(&mut self.dev, parent, name)?;
        debug!("created directory {} as inode {}", path, ino);
        Ok(ino)
    }

    pub fn append(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let ino = self.file_at(path)?;
        self.files.append(&mut self.dev, ino, data)
    }

    fn file_at(&mut self, path: &str) -> Result<u32> {
        let ino = self.resolve(path)?;
        if self.inodes.read(&mut self.dev, ino)?.is_dir() {
            return Err(FsError::NotAFile(path.to_string()));
        }
        Ok(ino)
    }

    /// The directory a path's final component lives in.
    fn parent_of(&mut self, dir: Option<&str>) -> Result<u32> {
        let dir = match dir {
            None => return Ok(ROOT_INODE),
            Some(dir) => dir,
        };
        let ino = self.dirs.lookup(&mut self.dev, ROOT_INODE, dir)?;
        if !self.inodes.read(&mut self.dev, ino)?.is_dir() {
            return Err(FsError::NotADirectory(dir.to_string()));
        }
        Ok(ino)
    }
}

/// Splits `name` or `dir/name`. Deeper paths and empty components name
/// nothing.
fn split_path(path: &str) -> Result<(Option<&str>, &str)> {
    let not_found = || FsError::NotFound(path.to_string());
    let mut parts = path.split('/');
    let first = parts.next().ok_or_else(not_found)?;
    let second = parts.next();
    if parts.next().is_some() {
        return Err(not_found());
    }
    let (dir, name) = match second {
        None => (None, first),
        Some(name) => (Some(first), name),
    };
    if name.is_empty() || dir.map_or(false, str::is_empty) {
        return Err(not_found());
    }
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ImageFile, ImageFileBuilder};
    use crate::sb::Version;
    use crate::testing;

    #[test]
    fn split_path_accepts_one_or_two_components() {
        assert_eq!(split_path("a").unwrap(), (None, "a"));
        assert_eq!(split_path("d/a").unwrap(), (Some("d"), "a"));
        for bad in &["", "/a", "a/", "d/e/a", "/", "d//a"] {
            assert!(
                matches!(split_path(bad), Err(FsError::NotFound(_))),
                "{:?}",
                bad
            );
        }
    }

    #[test]
    fn touch_append_cat() {
        let mut fs = testing::image(Version::V1, 14, 64);
        fs.touch("a").unwrap();
        fs.append("a", b"hello").unwrap();
        assert_eq!(fs.cat("a").unwrap(), b"hello".to_vec());

        let names: Vec<Vec<u8>> = fs.ls(None).unwrap().into_iter().map(|e| e.name).collect();
        assert!(names.contains(&b"a".to_vec()));
    }

    #[test]
    fn nested_paths_resolve_through_one_directory() {
        let mut fs = testing::image(Version::V2, 30, 64);
        let d = fs.mkdir("d").unwrap();
        let f = fs.touch("d/f").unwrap();
        fs.append("d/f", b"nested").unwrap();

        assert_eq!(fs.resolve("d").unwrap(), d);
        assert_eq!(fs.resolve("d/f").unwrap(), f);
        assert_eq!(fs.cat("d/f").unwrap(), b"nested".to_vec());
        assert_eq!(fs.resolve("d/..").unwrap(), ROOT_INODE);
        assert!(matches!(fs.resolve("d/f/g"), Err(FsError::NotFound(_))));

        let entries = fs.ls(Some("d")).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].inode, f);
    }

    #[test]
    fn type_mismatches_are_reported_by_path() {
        let mut fs = testing::image(Version::V1, 30, 64);
        fs.mkdir("d").unwrap();
        fs.touch("f").unwrap();

        match fs.cat("d") {
            Err(FsError::NotAFile(path)) => assert_eq!(path, "d"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(fs.append("d", b"x"), Err(FsError::NotAFile(_))));
        assert!(matches!(fs.touch("f/x"), Err(FsError::NotADirectory(_))));
        assert!(matches!(fs.ls(Some("f")), Err(FsError::NotADirectory(_))));
        assert!(matches!(fs.cat("missing"), Err(FsError::NotFound(_))));
        assert!(matches!(fs.touch("missing/x"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn usage_tracks_allocations() {
        let mut fs = testing::image(Version::V1, 14, 64);
        let before = fs.usage().unwrap();
        assert_eq!(before.free_inodes, before.inodes - 1);
        assert_eq!(before.free_zones, before.data_zones - 1);

        fs.mkdir("d").unwrap();
        let after = fs.usage().unwrap();
        assert_eq!(after.free_inodes, before.free_inodes - 1);
        assert_eq!(after.free_zones, before.free_zones - 1);
    }

    #[test]
    fn can_create_and_reopen_initialized_filesystem() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let dev = ImageFileBuilder::from(disk.reopen().unwrap())
            .with_block_count(128)
            .build()
            .unwrap();
        let mut fs = testing::format(dev, Version::V2, 14);
        fs.touch("kept").unwrap();
        fs.append("kept", b"across opens").unwrap();
        fs.sync().unwrap();
        let file = fs.into_device().into_file();
        assert_eq!(file.metadata().unwrap().len(), 128 * 1024);
        drop(file);

        let dev = ImageFile::open_disk(disk.path()).unwrap();
        let mut fs = MinixFs::open(dev).unwrap();
        assert_eq!(fs.superblock().version(), Version::V2);
        assert_eq!(fs.cat("kept").unwrap(), b"across opens".to_vec());
    }

    #[test]
    fn unformatted_image_is_corrupt() {
        let dev = ImageFileBuilder::from(tempfile::tempfile().unwrap())
            .with_block_count(16)
            .build()
            .unwrap();
        assert!(matches!(
            MinixFs::open(dev),
            Err(FsError::CorruptImage(_))
        ));
    }
}
