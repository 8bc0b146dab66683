//! Recovery from false-positive matches of the block magic.
//!
//! A block payload can contain the 6-byte block magic by chance, which
//! splits one real block into two bogus ones. The pipeline recovers by
//! re-decoding the two halves merged back together. Rather than waiting
//! for a 1-in-2^48 event, the block magic is rewired to a byte sequence
//! that already occurs in the compressed payload, so every real magic
//! position plus one natural payload occurrence match.

mod common;

use common::*;
use parbz2::bitstream::overwrite_at_bit_offset;
use parbz2::bzip2::{BLOCK_MAGIC, EOS_MAGIC};
use parbz2::CancelToken;

// Bit positions of each block magic occurrence in a single-stream file:
// the first sits right after the 4-byte header, each subsequent one after
// the previous block's payload.
fn block_magic_bit_positions(compressed: &[u8]) -> Vec<usize> {
    let cancel = CancelToken::new();
    let mut sc = parbz2::Scanner::new(compressed);
    let mut positions = Vec::new();
    let mut payload_start = 4 * 8 + 48;
    while let Some(block) = sc.next(&cancel) {
        if !block.is_stream_end {
            positions.push(payload_start + block.size_in_bits);
        }
        payload_start += block.size_in_bits + 48;
    }
    assert!(sc.err().is_none(), "{:?}", sc.err());
    let mut all = vec![4 * 8];
    all.extend(positions);
    all
}

#[test]
fn false_positive_magic_is_recovered_by_block_merge() {
    let data = predictable_random(300 * 1024);
    let compressed = compress(&data, 1);
    let magic_positions = block_magic_bit_positions(&compressed);
    assert!(magic_positions.len() >= 4, "{:?}", magic_positions);

    // Pick a 6-byte sequence that occurs naturally inside the first
    // block's payload.
    let mut candidate_at = magic_positions[0] / 8 + 9000;
    let false_positive = loop {
        let mut candidate = [0u8; 6];
        candidate.copy_from_slice(&compressed[candidate_at..candidate_at + 6]);
        if candidate != BLOCK_MAGIC && candidate != EOS_MAGIC {
            break candidate;
        }
        candidate_at += 1;
    };

    // Rewrite every real block magic to the false-positive sequence, so
    // that scanning for it finds the real boundaries plus the natural
    // occurrence inside block one.
    let mut rewritten = compressed.clone();
    for &pos in &magic_positions {
        overwrite_at_bit_offset(&mut rewritten, pos, &false_positive);
    }

    parbz2::set_custom_block_magic(false_positive);
    let (out, err) = parallel_decode(&rewritten, 3);
    parbz2::reset_block_magic();

    assert!(err.is_none(), "{:?}", err);
    assert_eq!(out, data, "merged decode must reproduce the original data");
}
