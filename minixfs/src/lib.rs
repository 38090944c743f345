//! Direct manipulation of Minix V1 and V2 filesystem images.
//!
//! The image is opened as a [`BlockStorage`](io::BlockStorage) device and
//! every operation reads and writes it in place. Nothing is cached between
//! calls, so an image is consistent on disk after each one returns.

mod alloc;
mod dir;
mod file;
mod fs;
pub mod io;
mod mkfs;
mod node;
mod sb;
mod zone;

pub use crate::alloc::Allocator;
pub use crate::dir::{DirEntry, Directory};
pub use crate::file::FileEngine;
pub use crate::fs::{FsError, MinixFs, Resource, Result, Usage};
pub use crate::mkfs::{format, plan, FormatOptions};
pub use crate::node::{Inode, InodeTable, ROOT_INODE, S_IFDIR, S_IFMT, S_IFREG};
pub use crate::sb::{Layout, Superblock, Version};
pub use crate::zone::{Slot, ZoneMap};
