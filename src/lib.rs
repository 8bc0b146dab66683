//! Parallel bzip2 decompression.
//!
//! bzip2 is a block-structured format whose compressed blocks are
//! independent of one another except for a cumulative stream checksum.
//! This crate locates the bit-aligned boundaries between blocks without
//! decoding them ([`Scanner`]), decodes blocks concurrently on a bounded
//! worker pool ([`Decompressor`]) and reassembles the plaintext in stream
//! order, producing output byte-identical to a serial decoder.
//!
//! Most callers only need [`Reader`]:
//!
//! ```no_run
//! use std::io::Read;
//!
//! let file = std::fs::File::open("data.bz2").unwrap();
//! let mut reader = parbz2::Reader::new(file, parbz2::ReaderOptions::default());
//! let mut out = Vec::new();
//! reader.read_to_end(&mut out).unwrap();
//! ```
//!
//! Concatenated streams are handled transparently, trailing empty streams
//! are skipped, and a false-positive match of the block magic inside a
//! block's payload is recovered by re-decoding the two halves merged back
//! together.

pub mod bitstream;
pub mod bzip2;
mod cancel;
mod error;
mod parallel;
mod reader;
mod scanner;

use std::sync::{Arc, LazyLock, RwLock};

use bitstream::MagicTables;

pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use parallel::{
    active_decompression_workers, ConcurrencyPool, Decompressor, DecompressorOptions,
    OutputReader, Progress,
};
pub use reader::{Reader, ReaderOptions};
pub use scanner::{CompressedBlock, Scanner, ScannerOptions};

// The lookup tables for the block magic are process-wide so that their
// construction cost is paid once, not per scanner. They are replaced
// wholesale by set_custom_block_magic; running scanners keep the snapshot
// taken at construction.
static BLOCK_MAGIC_TABLES: LazyLock<RwLock<Arc<MagicTables>>> =
    LazyLock::new(|| RwLock::new(Arc::new(MagicTables::new(bzip2::BLOCK_MAGIC))));

pub(crate) fn block_magic_tables() -> Arc<MagicTables> {
    BLOCK_MAGIC_TABLES.read().unwrap().clone()
}

/// Rebuilds the process-global lookup tables for an arbitrary 6-byte block
/// magic. Used by tests to force false-positive collisions. Must not be
/// called while a scanner or pipeline is active.
pub fn set_custom_block_magic(magic: [u8; 6]) {
    *BLOCK_MAGIC_TABLES.write().unwrap() = Arc::new(MagicTables::new(magic));
}

/// Restores the standard bzip2 block magic. See [`set_custom_block_magic`].
pub fn reset_block_magic() {
    set_custom_block_magic(bzip2::BLOCK_MAGIC);
}
