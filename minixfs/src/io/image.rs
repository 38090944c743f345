use crate::io::block::{BlockNumber, BlockStorage, BLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

/// A filesystem image held in a regular file and accessed in whole blocks.
pub struct ImageFile {
    /// The file backing the image. Any trailing partial block is ignored.
    fd: File,
    /// The total number of blocks available in the image.
    block_count: usize,
}

impl ImageFile {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn check_range(&self, blocknr: BlockNumber) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("block {} out of range ({} blocks)", blocknr, self.block_count),
            ));
        }
        Ok(())
    }
}

impl BlockStorage for ImageFile {
    fn open_disk<P: AsRef<Path>>(path: P) -> std::io::Result<Self>
    where
        Self: std::marker::Sized,
    {
        // Return error if the file does not exist rather than create one.
        let fd = OpenOptions::new().read(true).write(true).open(path)?;
        let block_count = (fd.metadata()?.len() / BLOCK_SIZE as u64) as usize;
        Ok(ImageFile { fd, block_count })
    }

    fn block_count(&self) -> usize {
        self.block_count
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        if buf.len() < BLOCK_SIZE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }
        self.fd
            .seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;
        self.fd.read_exact(&mut buf[..BLOCK_SIZE])
    }

    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        self.check_range(blocknr)?;
        if buf.len() > BLOCK_SIZE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer is larger than a block",
            ));
        }
        self.fd
            .seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;
        self.fd.write_all(buf)
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()
    }
}

/// Prepares a file to serve as an image of a fixed number of blocks.
pub struct ImageFileBuilder {
    fd: File,
    block_count: usize,
    clear: bool,
}

impl From<File> for ImageFileBuilder {
    fn from(fd: File) -> Self {
        ImageFileBuilder {
            fd,
            block_count: 0,
            clear: true,
        }
    }
}

impl ImageFileBuilder {
    /// Sets the number of blocks in the image.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Whether to overwrite the medium with zeros. Enabled by default; disable it
    /// to wrap a file that already holds an image.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// The builder owns the file descriptor and, unless told otherwise, does
    /// destructive things to prepare the file for use.
    pub fn build(mut self) -> std::io::Result<ImageFile> {
        if self.block_count == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "image must hold at least one block",
            ));
        }
        if self.clear {
            self.zero_blocks()?;
        }
        self.fd.set_len((self.block_count * BLOCK_SIZE) as u64)?;
        Ok(ImageFile {
            fd: self.fd,
            block_count: self.block_count,
        })
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let mut bfd = BufWriter::new(&self.fd);
        let zeros = [0u8; BLOCK_SIZE];
        for _ in 0..self.block_count {
            bfd.write_all(&zeros)?;
        }
        bfd.flush()
    }
}
