use std::path::Path;

/// Minix V1 and V2 images always use 1K blocks. Zones may span several of
/// them, but every transfer to the device happens in whole blocks.
pub const BLOCK_SIZE: usize = 1024;

/// The block number to access ranging from 0 (the boot block) to n - 1 (the last
/// block) where n is number of blocks available.
pub type BlockNumber = usize;

/// Random access storage addressed in `BLOCK_SIZE` units.
///
/// Nothing above this trait caches blocks, so each call is a round trip to the
/// backing medium and the medium always reflects the last completed write.
pub trait BlockStorage {
    /// Opens an existing disk image at the specified path. This method does not
    /// validate the contents, it is up to clients to check the image is formatted.
    fn open_disk<P: AsRef<Path>>(path: P) -> std::io::Result<Self>
    where
        Self: std::marker::Sized;
    /// Number of whole blocks on the device.
    fn block_count(&self) -> usize;
    /// Reads disk block number into provided buffer.
    ///
    /// # Errors
    ///
    /// Attempting to read a block out of range, or into a buffer shorter than a
    /// block, will return an error.
    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes provided buffer into the specified block number.
    ///
    /// # Errors
    ///
    /// Attempting to write a block out of range, or a buffer longer than a block,
    /// will return an error.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()>;
    /// Flush any buffered disk IO from memory.
    fn sync_disk(&mut self) -> std::io::Result<()>;
}
