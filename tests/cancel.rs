//! Cancellation releases readers and worker threads.
//!
//! Kept in its own test binary so that the process-wide worker gauge is
//! not disturbed by concurrent tests.

mod common;

use std::io::Read;
use std::time::{Duration, Instant};

use common::*;
use parbz2::{
    active_decompression_workers, CancelToken, DecompressorOptions, Error, Reader, ReaderOptions,
};

fn wait_for_workers_to_drain() {
    let deadline = Instant::now() + Duration::from_secs(10);
    while active_decompression_workers() != 0 {
        assert!(
            Instant::now() < deadline,
            "worker threads were not released: {}",
            active_decompression_workers()
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn cancellation_mid_read_releases_workers() {
    let data = predictable_random(1033 * 1024);
    let compressed = compress(&data, 1);

    for concurrency in [1, 2, 4] {
        let cancel = CancelToken::new();
        let mut reader = Reader::new(
            std::io::Cursor::new(compressed.clone()),
            ReaderOptions::default()
                .decompressor_options(DecompressorOptions::default().concurrency(concurrency))
                .cancel_token(cancel.clone()),
        );

        let mut buf = [0u8; 4096];
        let mut read_before_cancel = 0usize;
        let mut err = None;
        for i in 0.. {
            match reader.read(&mut buf) {
                Ok(0) => panic!("stream completed despite cancellation"),
                Ok(n) => read_before_cancel += n,
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
            if i == 3 {
                cancel.cancel(Error::Canceled);
            }
        }
        let err = err.expect("canceled read must error");
        assert_eq!(err.to_string(), "operation canceled");
        assert!(read_before_cancel > 0);

        drop(reader);
        wait_for_workers_to_drain();
    }
}

#[test]
fn immediate_cancellation() {
    let data = predictable_random(64 * 1024);
    let compressed = compress(&data, 1);
    let cancel = CancelToken::new();
    cancel.cancel(Error::Canceled);
    let mut reader = Reader::new(
        std::io::Cursor::new(compressed),
        ReaderOptions::default().cancel_token(cancel),
    );
    let mut out = Vec::new();
    let err = reader.read_to_end(&mut out).expect_err("canceled");
    assert_eq!(err.to_string(), "operation canceled");
}
