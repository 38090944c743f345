mod block;
mod image;

pub use block::{BlockNumber, BlockStorage, BLOCK_SIZE};
pub use image::{ImageFile, ImageFileBuilder};
