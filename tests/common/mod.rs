//! Shared helpers for the integration tests: fixture generation via the
//! reference bzip2 codec and deterministic pseudo-random payloads.

use std::io::Read;

use bzip2::read::{BzEncoder, MultiBzDecoder};
use bzip2::Compression;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Seed for the predictable pseudo-random payloads.
pub const RAND_SEED: u64 = 0x1234;

pub fn predictable_random(size: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(RAND_SEED);
    let mut out = vec![0u8; size];
    rng.fill_bytes(&mut out);
    out
}

/// Compresses `data` into a single bzip2 stream at the given level (the
/// level selects the 100kB..900kB block size).
pub fn compress(data: &[u8], level: u32) -> Vec<u8> {
    let mut out = Vec::new();
    BzEncoder::new(data, Compression::new(level))
        .read_to_end(&mut out)
        .expect("bzip2 encode");
    out
}

/// Serial reference decode of (possibly concatenated) streams.
pub fn reference_decode(compressed: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    MultiBzDecoder::new(compressed)
        .read_to_end(&mut out)
        .expect("reference decode");
    out
}

/// Reads from `rd` until EOF or the first error, returning everything read
/// before the error along with it.
pub fn read_until_error<R: Read>(mut rd: R) -> (Vec<u8>, Option<std::io::Error>) {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match rd.read(&mut buf) {
            Ok(0) => return (out, None),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) => return (out, Some(err)),
        }
    }
}

/// Decompresses `compressed` through the parallel reader at the given
/// concurrency.
pub fn parallel_decode(compressed: &[u8], concurrency: usize) -> (Vec<u8>, Option<std::io::Error>) {
    let reader = parbz2::Reader::new(
        std::io::Cursor::new(compressed.to_vec()),
        parbz2::ReaderOptions::default()
            .decompressor_options(parbz2::DecompressorOptions::default().concurrency(concurrency)),
    );
    read_until_error(reader)
}
