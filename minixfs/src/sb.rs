use crate::fs::{FsError, Result};
use crate::io::{BlockNumber, BLOCK_SIZE};
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Block 0 is reserved for a boot loader, the superblock lives in the next one.
pub const SUPERBLOCK_BLOCK: BlockNumber = 1;

pub const MINIX_V1_MAGIC: u16 = 0x137F;
pub const MINIX_V1_MAGIC_LONG: u16 = 0x138F;
pub const MINIX_V2_MAGIC: u16 = 0x2468;
pub const MINIX_V2_MAGIC_LONG: u16 = 0x2478;

/// Value of the state field for a cleanly unmounted filesystem.
pub const MINIX_VALID_FS: u16 = 0x0001;

pub const SHORT_NAME_LEN: usize = 14;
pub const LONG_NAME_LEN: usize = 30;

const MAX_LOG_ZONE_SIZE: u16 = 4;
const BITS_PER_BLOCK: u64 = (BLOCK_SIZE * 8) as u64;
/// The V1 superblock ends before the 32-bit zone count introduced by V2.
const V1_SUPERBLOCK_LEN: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
}

impl Version {
    /// The magic number identifying this version with the given filename width.
    pub fn magic(self, name_len: usize) -> Option<u16> {
        match (self, name_len) {
            (Version::V1, SHORT_NAME_LEN) => Some(MINIX_V1_MAGIC),
            (Version::V1, LONG_NAME_LEN) => Some(MINIX_V1_MAGIC_LONG),
            (Version::V2, SHORT_NAME_LEN) => Some(MINIX_V2_MAGIC),
            (Version::V2, LONG_NAME_LEN) => Some(MINIX_V2_MAGIC_LONG),
            _ => None,
        }
    }

    pub fn inode_size(self) -> usize {
        match self {
            Version::V1 => 32,
            Version::V2 => 64,
        }
    }

    /// Width of a zone number stored in an inode or an indirect zone.
    pub fn zone_ptr_size(self) -> usize {
        match self {
            Version::V1 => 2,
            Version::V2 => 4,
        }
    }

    pub fn link_max(self) -> u32 {
        match self {
            Version::V1 => 250,
            Version::V2 => 65530,
        }
    }
}

fn identify(magic: u16) -> Option<(Version, usize)> {
    match magic {
        MINIX_V1_MAGIC => Some((Version::V1, SHORT_NAME_LEN)),
        MINIX_V1_MAGIC_LONG => Some((Version::V1, LONG_NAME_LEN)),
        MINIX_V2_MAGIC => Some((Version::V2, SHORT_NAME_LEN)),
        MINIX_V2_MAGIC_LONG => Some((Version::V2, LONG_NAME_LEN)),
        _ => None,
    }
}

/// Byte image of the superblock. V1 only defines the first 20 bytes.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy)]
struct RawSuperblock {
    ninodes: U16,
    nzones: U16,
    imap_blocks: U16,
    zmap_blocks: U16,
    first_data_zone: U16,
    log_zone_size: U16,
    max_size: U32,
    magic: U16,
    state: U16,
    zones: U32,
}

/// Filesystem geometry as recorded on disk. Loaded once when the image is
/// opened; this crate never resizes an image so it is never written back
/// except by the formatter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub inodes_count: u16,
    /// Zone count used by V1 images.
    pub nzones: u16,
    pub imap_blocks: u16,
    pub zmap_blocks: u16,
    pub first_data_zone: u16,
    /// log2 of the number of blocks per zone.
    pub log_zone_size: u16,
    pub max_size: u32,
    pub magic: u16,
    pub state: u16,
    /// Zone count used by V2 images.
    pub zones: u32,
    version: Version,
    name_len: usize,
}

impl Superblock {
    /// An empty superblock for the given variant. Geometry is filled in by the
    /// formatter.
    pub fn new(version: Version, name_len: usize) -> Result<Self> {
        let magic = version.magic(name_len).ok_or_else(|| {
            FsError::InvalidGeometry(format!("no minix variant has {} byte names", name_len))
        })?;
        Ok(Self {
            inodes_count: 0,
            nzones: 0,
            imap_blocks: 0,
            zmap_blocks: 0,
            first_data_zone: 0,
            log_zone_size: 0,
            max_size: 0,
            magic,
            state: MINIX_VALID_FS,
            zones: 0,
            version,
            name_len,
        })
    }

    /// Decodes the superblock from the start of `buf`, rejecting any magic
    /// number other than the four known variants.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let raw = RawSuperblock::read_from_prefix(buf)
            .ok_or_else(|| FsError::CorruptImage("superblock is truncated".to_string()))?;
        let magic = raw.magic.get();
        let (version, name_len) = identify(magic).ok_or_else(|| {
            FsError::CorruptImage(format!("unrecognized magic number {:#06x}", magic))
        })?;

        Ok(Self {
            inodes_count: raw.ninodes.get(),
            nzones: raw.nzones.get(),
            imap_blocks: raw.imap_blocks.get(),
            zmap_blocks: raw.zmap_blocks.get(),
            first_data_zone: raw.first_data_zone.get(),
            log_zone_size: raw.log_zone_size.get(),
            max_size: raw.max_size.get(),
            magic,
            state: raw.state.get(),
            zones: raw.zones.get(),
            version,
            name_len,
        })
    }

    /// Encodes the superblock into the start of `buf`. Bytes past the fields
    /// the variant defines are left untouched.
    pub fn serialize_into(&self, buf: &mut [u8]) {
        let raw = RawSuperblock {
            ninodes: U16::new(self.inodes_count),
            nzones: U16::new(self.nzones),
            imap_blocks: U16::new(self.imap_blocks),
            zmap_blocks: U16::new(self.zmap_blocks),
            first_data_zone: U16::new(self.first_data_zone),
            log_zone_size: U16::new(self.log_zone_size),
            max_size: U32::new(self.max_size),
            magic: U16::new(self.magic),
            state: U16::new(self.state),
            zones: U32::new(self.zones),
        };
        let len = match self.version {
            Version::V1 => V1_SUPERBLOCK_LEN,
            Version::V2 => std::mem::size_of::<RawSuperblock>(),
        };
        buf[..len].copy_from_slice(&raw.as_bytes()[..len]);
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Width of the name field in a directory entry.
    pub fn name_len(&self) -> usize {
        self.name_len
    }

    pub fn zone_count(&self) -> u32 {
        match self.version {
            Version::V1 => u32::from(self.nzones),
            Version::V2 => self.zones,
        }
    }

    /// Derives and validates the layout of an image spanning `device_blocks`
    /// blocks.
    pub fn layout(&self, device_blocks: usize) -> Result<Layout> {
        let corrupt = |msg: String| Err(FsError::CorruptImage(msg));

        if self.inodes_count == 0 || self.imap_blocks == 0 || self.zmap_blocks == 0 {
            return corrupt("superblock records an empty inode or bitmap region".to_string());
        }
        if self.log_zone_size > MAX_LOG_ZONE_SIZE {
            return corrupt(format!("unsupported zone size log {}", self.log_zone_size));
        }
        let zone_count = self.zone_count();
        if zone_count == 0 {
            return corrupt("superblock records no zones".to_string());
        }
        if u64::from(self.imap_blocks) * BITS_PER_BLOCK < u64::from(self.inodes_count) + 1 {
            return corrupt(format!(
                "{} inode bitmap blocks cannot track {} inodes",
                self.imap_blocks, self.inodes_count
            ));
        }

        let zone_shift = u32::from(self.log_zone_size);
        let first_data_zone = u32::from(self.first_data_zone);
        let imap_start = SUPERBLOCK_BLOCK + 1;
        let zmap_start = imap_start + self.imap_blocks as usize;
        let inode_table_start = zmap_start + self.zmap_blocks as usize;
        let inode_table_blocks =
            (self.inodes_count as usize * self.version.inode_size() + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let inode_table_end = inode_table_start + inode_table_blocks;

        if (first_data_zone as usize) << zone_shift < inode_table_end {
            return corrupt(format!(
                "first data zone {} overlaps the inode table ending at block {}",
                first_data_zone, inode_table_end
            ));
        }
        if first_data_zone >= zone_count {
            return corrupt(format!(
                "first data zone {} is beyond the zone count {}",
                first_data_zone, zone_count
            ));
        }
        let data_zones = u64::from(zone_count - first_data_zone) + 1;
        if u64::from(self.zmap_blocks) * BITS_PER_BLOCK < data_zones {
            return corrupt(format!(
                "{} zone bitmap blocks cannot track {} zones",
                self.zmap_blocks, data_zones
            ));
        }
        let needed_blocks = (zone_count as usize) << zone_shift;
        if device_blocks < needed_blocks {
            return corrupt(format!(
                "image holds {} blocks but the superblock describes {}",
                device_blocks, needed_blocks
            ));
        }

        Ok(Layout {
            version: self.version,
            name_len: self.name_len,
            zone_shift,
            inode_count: u32::from(self.inodes_count),
            zone_count,
            first_data_zone,
            max_size: u64::from(self.max_size),
            imap_start,
            imap_blocks: self.imap_blocks as usize,
            zmap_start,
            zmap_blocks: self.zmap_blocks as usize,
            inode_table_start,
            inode_table_blocks,
        })
    }
}

/// Geometry of an opened image, computed once from the superblock and passed
/// by value to every component that addresses the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub version: Version,
    pub name_len: usize,
    pub zone_shift: u32,
    pub inode_count: u32,
    pub zone_count: u32,
    pub first_data_zone: u32,
    pub max_size: u64,
    pub imap_start: BlockNumber,
    pub imap_blocks: usize,
    pub zmap_start: BlockNumber,
    pub zmap_blocks: usize,
    pub inode_table_start: BlockNumber,
    pub inode_table_blocks: usize,
}

impl Layout {
    pub fn blocks_per_zone(&self) -> usize {
        1 << self.zone_shift
    }

    pub fn zone_size(&self) -> usize {
        BLOCK_SIZE << self.zone_shift
    }

    /// First block of a zone.
    pub fn zone_block(&self, zone: u32) -> BlockNumber {
        (zone as usize) << self.zone_shift
    }

    pub fn dirent_size(&self) -> usize {
        2 + self.name_len
    }

    pub fn inode_size(&self) -> usize {
        self.version.inode_size()
    }

    pub fn ptr_size(&self) -> usize {
        self.version.zone_ptr_size()
    }

    /// Number of zone numbers held by one indirect zone.
    pub fn ptrs_per_zone(&self) -> usize {
        self.zone_size() / self.ptr_size()
    }

    /// Bits of the zone bitmap in use, bit 0 included.
    pub fn zone_bits(&self) -> u32 {
        self.zone_count - self.first_data_zone + 1
    }

    /// Bits of the inode bitmap in use, bit 0 included.
    pub fn inode_bits(&self) -> u32 {
        self.inode_count + 1
    }

    pub fn is_data_zone(&self, zone: u32) -> bool {
        zone >= self.first_data_zone && zone < self.zone_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1_block() -> Vec<u8> {
        let mut sb = Superblock::new(Version::V1, 14).unwrap();
        sb.inodes_count = 64;
        sb.nzones = 128;
        sb.imap_blocks = 1;
        sb.zmap_blocks = 1;
        sb.first_data_zone = 6;
        sb.max_size = 268_966_912;
        let mut block = vec![0; BLOCK_SIZE];
        sb.serialize_into(&mut block);
        block
    }

    #[test]
    fn decodes_known_offsets() {
        let block = v1_block();
        assert_eq!(&block[0..2], &[64, 0]);
        assert_eq!(&block[16..18], &[0x7F, 0x13]);

        let sb = Superblock::parse(&block).unwrap();
        assert_eq!(sb.version(), Version::V1);
        assert_eq!(sb.name_len(), 14);
        assert_eq!(sb.zone_count(), 128);
        assert_eq!(sb.state, MINIX_VALID_FS);
    }

    #[test]
    fn decode_then_encode_is_byte_identical() {
        let mut block = v1_block();
        // Bytes past the V1 superblock belong to nobody and must survive.
        block[20..24].copy_from_slice(&[1, 2, 3, 4]);
        block[600] = 0xEE;

        let sb = Superblock::parse(&block).unwrap();
        let mut encoded = block.clone();
        sb.serialize_into(&mut encoded);
        assert_eq!(encoded, block);
    }

    #[test]
    fn v2_uses_32_bit_zone_count() {
        let mut sb = Superblock::new(Version::V2, 30).unwrap();
        sb.zones = 70_000;
        sb.nzones = 0;
        let mut block = vec![0; BLOCK_SIZE];
        sb.serialize_into(&mut block);

        let parsed = Superblock::parse(&block).unwrap();
        assert_eq!(parsed.magic, MINIX_V2_MAGIC_LONG);
        assert_eq!(parsed.name_len(), 30);
        assert_eq!(parsed.zone_count(), 70_000);
    }

    #[test]
    fn unknown_magic_is_rejected() {
        let zero_block = vec![0; BLOCK_SIZE];
        assert!(matches!(
            Superblock::parse(&zero_block),
            Err(FsError::CorruptImage(_))
        ));

        // Minix V3 is deliberately not recognized.
        let mut block = v1_block();
        block[16..18].copy_from_slice(&0x4d5a_u16.to_le_bytes());
        assert!(Superblock::parse(&block).is_err());
    }

    #[test]
    fn layout_places_regions_in_order() {
        let sb = Superblock::parse(&v1_block()).unwrap();
        let layout = sb.layout(128).unwrap();
        assert_eq!(layout.imap_start, 2);
        assert_eq!(layout.zmap_start, 3);
        assert_eq!(layout.inode_table_start, 4);
        assert_eq!(layout.inode_table_blocks, 2);
        assert_eq!(layout.zone_size(), 1024);
        assert_eq!(layout.ptrs_per_zone(), 512);
        assert_eq!(layout.dirent_size(), 16);
        assert_eq!(layout.zone_bits(), 123);
    }

    #[test]
    fn layout_rejects_inconsistent_geometry() {
        let mut sb = Superblock::parse(&v1_block()).unwrap();
        assert!(sb.layout(127).is_err(), "device too small");

        sb.first_data_zone = 5;
        assert!(sb.layout(128).is_err(), "data overlaps inode table");

        sb.first_data_zone = 6;
        sb.log_zone_size = 9;
        assert!(sb.layout(1 << 16).is_err(), "zone size out of range");
    }
}
