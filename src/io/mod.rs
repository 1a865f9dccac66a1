//! FITS input/output.
//!
//! Reading goes through a memory map and walks HDUs until it finds a data
//! block of the requested dimensionality. Writing emits BITPIX -32
//! big-endian data in 2880-byte blocks.

mod reader;
mod writer;

pub use reader::{read_cube, read_spectrum};
pub use writer::{write_cube, write_map, WriteOptions};

/// FITS block granularity: headers and data are padded to this size.
pub const BLOCK_SIZE: usize = 2880;
