//! A sequential `Read` facade over the scanner and the parallel pipeline.

use std::io::{self, Read};
use std::thread::{self, JoinHandle};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::parallel::{Decompressor, DecompressorOptions, OutputReader};
use crate::scanner::{Scanner, ScannerOptions};

/// Configuration for [`Reader`], passed through to the internal scanner
/// and decompressor.
#[derive(Default)]
pub struct ReaderOptions {
    scanner: ScannerOptions,
    decompressor: DecompressorOptions,
}

impl ReaderOptions {
    pub fn scanner_options(mut self, opts: ScannerOptions) -> Self {
        self.scanner = opts;
        self
    }

    pub fn decompressor_options(mut self, opts: DecompressorOptions) -> Self {
        self.decompressor = opts;
        self
    }

    /// Cancellation token observed by the scan loop and the pipeline.
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.decompressor = self.decompressor.cancel_token(cancel);
        self
    }
}

/// Decompresses bzip2 data concurrently behind an `io::Read` interface.
///
/// A background thread drives the scanner and feeds blocks to the worker
/// pipeline; `read` yields the reassembled plaintext in stream order.
/// Reads return EOF only once every block of every concatenated stream has
/// been emitted without error, and observe at most one error.
pub struct Reader {
    out: OutputReader,
    driver: Option<JoinHandle<Result<()>>>,
    cancel: CancelToken,
    err: Option<Error>,
}

impl Reader {
    pub fn new<R: Read + Send + 'static>(rd: R, opts: ReaderOptions) -> Reader {
        let cancel = opts.decompressor.cancel_handle();
        let scanner = Scanner::with_options(rd, opts.scanner);
        let (decompressor, out) = Decompressor::new(opts.decompressor);
        let driver = {
            let cancel = cancel.clone();
            thread::spawn(move || drive(scanner, decompressor, cancel))
        };
        Reader {
            out,
            driver: Some(driver),
            cancel,
            err: None,
        }
    }

    fn join_driver(&mut self) -> Result<()> {
        match self.driver.take() {
            Some(driver) => driver
                .join()
                .unwrap_or_else(|_| Err(Error::Input("decompression driver panicked".into()))),
            None => Ok(()),
        }
    }
}

// Runs the scanner against the input, appending every block to the
// decompressor, and guarantees that finish is called. Any error returned
// here is observed by the final read.
fn drive<R: Read>(
    mut scanner: Scanner<R>,
    mut decompressor: Decompressor,
    cancel: CancelToken,
) -> Result<()> {
    while let Some(block) = scanner.next(&cancel) {
        if let Err(err) = decompressor.append(block) {
            decompressor.cancel(err.clone());
            let _ = decompressor.finish();
            return Err(err);
        }
    }
    if let Some(err) = scanner.err() {
        decompressor.cancel(err.clone());
        let _ = decompressor.finish();
        return Err(err);
    }
    decompressor.finish()
}

impl Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(err) = &self.err {
            return Err(io::Error::other(err.clone()));
        }
        match self.out.read_decompressed(buf) {
            Ok(0) if !buf.is_empty() => {
                // Clean end of output; surface any error the driver saw
                // after the last block (a missing trailer, for instance).
                if let Err(err) = self.join_driver() {
                    self.err = Some(err.clone());
                    return Err(io::Error::other(err));
                }
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(err) => {
                self.err = Some(err.clone());
                let _ = self.join_driver();
                Err(io::Error::other(err))
            }
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        // Best effort: release the driver if it is still scanning or
        // waiting on the pipeline. Blocking reads on the underlying source
        // cannot be interrupted, so the driver is not joined here.
        self.cancel.cancel(Error::Canceled);
    }
}
