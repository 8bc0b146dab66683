#![no_main]

use libfuzzer_sys::fuzz_target;
use parbz2::{CancelToken, Scanner};

fuzz_target!(|data: &[u8]| {
    if data.len() > 1_000_000 {
        return;
    }

    // Scanning arbitrary bytes must terminate with either a clean end or a
    // stored error, never a panic, and every emitted block must be
    // internally consistent.
    let cancel = CancelToken::new();
    let mut sc = Scanner::new(data);
    let mut blocks = 0;
    while let Some(block) = sc.next(&cancel) {
        assert!(block.bit_offset < 8);
        assert!(block.data.len() <= data.len());
        blocks += 1;
        if blocks > 10_000 {
            break;
        }
    }
});
