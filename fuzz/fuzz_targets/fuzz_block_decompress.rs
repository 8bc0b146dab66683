#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use parbz2::bzip2::decompress_block;

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    data: Vec<u8>,
    bit_offset: u8,
    level: u8,
}

fuzz_target!(|input: FuzzInput| {
    if input.data.len() > 1_000_000 {
        return;
    }

    // Decoding an arbitrary payload must either produce bytes or an
    // error, never panic or hang.
    let block_size = 100 * 1000 * usize::from(input.level % 9 + 1);
    let _ = decompress_block(block_size, &input.data, usize::from(input.bit_offset % 8));
});
