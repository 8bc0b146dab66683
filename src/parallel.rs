//! Concurrent block decoding with in-order reassembly.
//!
//! A bounded pool of worker threads drains a queue of compressed blocks;
//! an assembler thread reorders the results by submission ordinal, checks
//! the per-stream CRCs and hands the plaintext to the output reader. A
//! block that fails to decode is retried merged with its successor, which
//! recovers from a false-positive match of the block magic inside a
//! block's payload.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::debug;

use crate::bitstream::BitWriter;
use crate::bzip2;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::scanner::CompressedBlock;

static ACTIVE_WORKERS: AtomicI64 = AtomicI64::new(0);

/// Number of live block-decoding worker threads, across all pipelines in
/// the process. Intended for tests and diagnostics.
pub fn active_decompression_workers() -> i64 {
    ACTIVE_WORKERS.load(Ordering::SeqCst)
}

fn update_stream_crc(stream_crc: u32, block_crc: u32) -> u32 {
    (stream_crc << 1 | stream_crc >> 31) ^ block_crc
}

/// One progress report per block, emitted once the block has been written
/// in order.
#[derive(Debug, Clone)]
pub struct Progress {
    pub duration: Duration,
    pub block: u64,
    pub crc: u32,
    pub compressed: usize,
    pub size: usize,
}

/// A token bucket limiting the total number of concurrently decoding
/// workers across any number of pipelines that share it.
#[derive(Clone)]
pub struct ConcurrencyPool {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl ConcurrencyPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        for _ in 0..capacity {
            tx.send(()).expect("filling a fresh token bucket");
        }
        ConcurrencyPool { tx, rx }
    }

    // Returns false if canceled while waiting for a token.
    fn acquire(&self, cancel: &CancelToken) -> bool {
        select! {
            recv(self.rx) -> token => token.is_ok(),
            recv(cancel.receiver()) -> _ => false,
        }
    }

    fn release(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Configuration for [`Decompressor`].
pub struct DecompressorOptions {
    concurrency: usize,
    pool: Option<ConcurrencyPool>,
    progress: Option<Sender<Progress>>,
    verbose: bool,
    cancel: CancelToken,
}

impl Default for DecompressorOptions {
    fn default() -> Self {
        DecompressorOptions {
            concurrency: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            pool: None,
            progress: None,
            verbose: false,
            cancel: CancelToken::new(),
        }
    }
}

impl DecompressorOptions {
    /// Number of worker threads used for decompression.
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Shares a token bucket with other pipelines to cap total concurrent
    /// decodes.
    pub fn concurrency_pool(mut self, pool: ConcurrencyPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sends one [`Progress`] record per in-order block.
    pub fn progress(mut self, tx: Sender<Progress>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Enables debug tracing of the pipeline.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Cancellation token observed by every blocking operation in the
    /// pipeline.
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }
}

struct BlockWork {
    order: u64,
    block: CompressedBlock,
    result: Option<Result<Vec<u8>>>,
    duration: Duration,
}

impl PartialEq for BlockWork {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}
impl Eq for BlockWork {}
impl PartialOrd for BlockWork {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for BlockWork {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so that the binary heap pops the smallest ordinal.
        other.order.cmp(&self.order)
    }
}

/// Concurrent decompressor for scanned bzip2 blocks.
///
/// Designed to work in conjunction with [`crate::Scanner`]: feed each
/// block from the scanner to [`Decompressor::append`], read the plaintext
/// from the paired [`OutputReader`], and call [`Decompressor::finish`]
/// exactly once to tear the pipeline down and collect the first error.
/// Output order matches append order regardless of concurrency.
pub struct Decompressor {
    order: AtomicU64,
    work_tx: Option<Sender<BlockWork>>,
    cancel: CancelToken,
    pipe: CancelToken,
    first_err: Arc<Mutex<Option<Error>>>,
    workers: Vec<JoinHandle<()>>,
    assembler: Option<JoinHandle<()>>,
}

impl Decompressor {
    /// Starts the worker pool and assembler and returns the pipeline
    /// handle together with the reading end of the output.
    pub fn new(opts: DecompressorOptions) -> (Decompressor, OutputReader) {
        let concurrency = opts.concurrency.max(1);
        let (work_tx, work_rx) = bounded::<BlockWork>(concurrency);
        let (done_tx, done_rx) = bounded::<BlockWork>(concurrency);
        let (out_tx, out_rx) = bounded::<Vec<u8>>(concurrency);
        let pipe = CancelToken::new();
        let first_err = Arc::new(Mutex::new(None));
        let magic = crate::block_magic_tables().magic();

        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            let pool = opts.pool.clone();
            let cancel = opts.cancel.clone();
            let verbose = opts.verbose;
            workers.push(thread::spawn(move || {
                worker(work_rx, done_tx, pool, cancel, verbose)
            }));
        }
        drop(done_tx);

        let assembler = {
            let cancel = opts.cancel.clone();
            let pipe = pipe.clone();
            let first_err = first_err.clone();
            let progress = opts.progress.clone();
            let verbose = opts.verbose;
            thread::spawn(move || {
                assemble(done_rx, out_tx, cancel, pipe, first_err, progress, magic, verbose)
            })
        };

        let reader = OutputReader {
            rx: out_rx,
            cancel: opts.cancel.clone(),
            pipe: pipe.clone(),
            first_err: first_err.clone(),
            current: Vec::new(),
            pos: 0,
        };
        let dc = Decompressor {
            order: AtomicU64::new(0),
            work_tx: Some(work_tx),
            cancel: opts.cancel,
            pipe,
            first_err,
            workers,
            assembler: Some(assembler),
        };
        (dc, reader)
    }

    /// Enqueues a block for decompression. Ordinals are assigned in call
    /// order and define the output order. Fails with the cancellation
    /// cause if the pipeline is being torn down.
    pub fn append(&self, block: CompressedBlock) -> Result<()> {
        let order = self.order.fetch_add(1, Ordering::SeqCst) + 1;
        let work = BlockWork {
            order,
            block,
            result: None,
            duration: Duration::ZERO,
        };
        let tx = self.work_tx.as_ref().ok_or_else(|| self.cancel.cause())?;
        select! {
            send(tx, work) -> sent => match sent {
                Ok(()) => Ok(()),
                Err(_) => Err(self.cancel.cause()),
            },
            recv(self.cancel.receiver()) -> _ => Err(self.cancel.cause()),
        }
    }

    /// Unblocks any readers waiting on the output, making them observe
    /// `err`. In-flight blocks are still drained by [`Decompressor::finish`].
    pub fn cancel(&self, err: Error) {
        let mut slot = self.first_err.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.pipe.cancel(Error::Canceled);
    }

    /// Closes the work queue, waits for the workers and the assembler to
    /// drain, and returns the first error observed, the cancellation cause
    /// if the pipeline was canceled, or success. Must be called exactly
    /// once.
    pub fn finish(&mut self) -> Result<()> {
        self.work_tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(assembler) = self.assembler.take() {
            let _ = assembler.join();
        }
        if self.cancel.is_canceled() {
            return Err(self.cancel.cause());
        }
        match self.first_err.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn decompress(block: &CompressedBlock) -> Result<Vec<u8>> {
    bzip2::decompress_block(block.stream_block_size, &block.data, block.bit_offset)
}

fn worker(
    work_rx: Receiver<BlockWork>,
    done_tx: Sender<BlockWork>,
    pool: Option<ConcurrencyPool>,
    cancel: CancelToken,
    verbose: bool,
) {
    ACTIVE_WORKERS.fetch_add(1, Ordering::SeqCst);
    loop {
        let mut work = select! {
            recv(work_rx) -> work => match work {
                Ok(work) => work,
                Err(_) => break,
            },
            recv(cancel.receiver()) -> _ => break,
        };
        if let Some(pool) = &pool {
            if !pool.acquire(&cancel) {
                break;
            }
        }
        if verbose {
            debug!(order = work.order, size = work.block.data.len(), "decompressing block");
        }
        let start = Instant::now();
        work.result = Some(decompress(&work.block));
        work.duration = start.elapsed();
        if let Some(pool) = &pool {
            pool.release();
        }
        select! {
            send(done_tx, work) -> sent => {
                if sent.is_err() {
                    break;
                }
            }
            recv(cancel.receiver()) -> _ => break,
        }
    }
    ACTIVE_WORKERS.fetch_sub(1, Ordering::SeqCst);
}

enum MergeOutcome {
    Merged(Vec<u8>),
    Failed,
    Canceled,
}

// Attempts to merge two consecutive blocks on the assumption that they
// were split by a false positive match of the block magic inside a block's
// payload. Defeating this requires two false positives within the same
// block, which given the block sizes is vanishingly unlikely. The
// successor block is consumed only if the merged payload decodes.
fn try_merge_blocks(
    done_rx: &Receiver<BlockWork>,
    cancel: &CancelToken,
    heap: &mut BinaryHeap<BlockWork>,
    work: &mut BlockWork,
    magic: &[u8; 6],
) -> MergeOutcome {
    // Wait for the immediate successor to arrive.
    loop {
        if let Some(top) = heap.peek() {
            if top.order == work.order + 1 {
                break;
            }
        }
        let next = select! {
            recv(done_rx) -> next => next,
            recv(cancel.receiver()) -> _ => return MergeOutcome::Canceled,
        };
        match next {
            Ok(next) => heap.push(next),
            // The queue closed without the successor ever arriving.
            Err(_) => return MergeOutcome::Failed,
        }
    }

    {
        let next = heap.peek().unwrap();
        // The first block starts at an offset within its first byte, so
        // the stored bit size is offset + size.
        let mut bw = BitWriter::new(
            &work.block.data,
            work.block.size_in_bits + work.block.bit_offset,
            work.block.data.len() + next.block.data.len() + magic.len() + 1,
        );
        bw.append(magic, 0, magic.len() * 8);
        bw.append(&next.block.data, next.block.bit_offset, next.block.size_in_bits);
        let (data, len_bits) = bw.into_parts();
        work.block.data = data;
        work.block.size_in_bits = len_bits;
    }

    match decompress(&work.block) {
        Ok(data) => {
            // The merge succeeded; the successor has been consumed. The
            // merged block terminates its stream if the successor did.
            let next = heap.pop().unwrap();
            if next.block.is_stream_end {
                work.block.is_stream_end = true;
                work.block.stream_crc = next.block.stream_crc;
            }
            MergeOutcome::Merged(data)
        }
        Err(_) => MergeOutcome::Failed,
    }
}

#[allow(clippy::too_many_arguments)]
fn assemble(
    done_rx: Receiver<BlockWork>,
    out_tx: Sender<Vec<u8>>,
    cancel: CancelToken,
    pipe: CancelToken,
    first_err: Arc<Mutex<Option<Error>>>,
    progress: Option<Sender<Progress>>,
    magic: [u8; 6],
    verbose: bool,
) {
    let fail = |err: Error| {
        let mut slot = first_err.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    };

    let mut heap: BinaryHeap<BlockWork> = BinaryHeap::new();
    let mut expected: u64 = 1;
    let mut stream_crc: u32 = 0;
    let mut failed = false;

    'outer: loop {
        let closed = match select! {
            recv(done_rx) -> work => work,
            recv(cancel.receiver()) -> _ => {
                fail(cancel.cause());
                failed = true;
                break 'outer;
            }
        } {
            Ok(work) => {
                heap.push(work);
                false
            }
            Err(_) => true,
        };

        while heap.peek().map(|top| top.order) == Some(expected) {
            let mut work = heap.pop().unwrap();
            expected += 1;

            let data = match work.result.take().unwrap_or(Ok(Vec::new())) {
                Ok(data) => data,
                Err(err) => {
                    if verbose {
                        debug!(order = work.order, %err, "block failed, attempting merge");
                    }
                    match try_merge_blocks(&done_rx, &cancel, &mut heap, &mut work, &magic) {
                        MergeOutcome::Merged(data) => {
                            // The successor's ordinal was consumed by the
                            // merge.
                            expected += 1;
                            data
                        }
                        MergeOutcome::Failed => {
                            fail(err);
                            failed = true;
                            break 'outer;
                        }
                        MergeOutcome::Canceled => {
                            fail(cancel.cause());
                            failed = true;
                            break 'outer;
                        }
                    }
                }
            };

            let size = data.len();
            if !data.is_empty() {
                select! {
                    send(out_tx, data) -> sent => {
                        if sent.is_err() {
                            // The reading side is gone.
                            failed = true;
                            break 'outer;
                        }
                    }
                    recv(pipe.receiver()) -> _ => {
                        failed = true;
                        break 'outer;
                    }
                    recv(cancel.receiver()) -> _ => {
                        fail(cancel.cause());
                        failed = true;
                        break 'outer;
                    }
                }
            }

            stream_crc = update_stream_crc(stream_crc, work.block.crc);
            if verbose {
                debug!(order = work.order, crc = work.block.crc, size, "assembled block");
            }
            if let Some(progress) = &progress {
                let report = Progress {
                    duration: work.duration,
                    block: work.order,
                    crc: work.block.crc,
                    compressed: work.block.data.len(),
                    size,
                };
                select! {
                    send(progress, report) -> _ => {}
                    recv(cancel.receiver()) -> _ => {
                        fail(cancel.cause());
                        failed = true;
                        break 'outer;
                    }
                }
            }

            if work.block.is_stream_end {
                if stream_crc != work.block.stream_crc {
                    fail(Error::StreamCrc {
                        calculated: stream_crc,
                        stored: work.block.stream_crc,
                    });
                    failed = true;
                    break 'outer;
                }
                stream_crc = 0;
            }
        }

        if closed {
            break;
        }
    }

    // Release any blocked reader, then keep draining the done queue until
    // it closes so that no worker stays blocked on a full channel.
    drop(out_tx);
    if failed {
        for _ in done_rx.iter() {}
    }
}

/// The reading end of a [`Decompressor`]: yields the decompressed bytes in
/// stream order.
pub struct OutputReader {
    rx: Receiver<Vec<u8>>,
    cancel: CancelToken,
    pipe: CancelToken,
    first_err: Arc<Mutex<Option<Error>>>,
    current: Vec<u8>,
    pos: usize,
}

impl OutputReader {
    fn stored_err(&self) -> Option<Error> {
        self.first_err.lock().unwrap().clone()
    }

    /// Reads decompressed bytes, blocking until some are available.
    /// Returns `Ok(0)` only once every appended block has been emitted
    /// without error.
    pub fn read_decompressed(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if self.pos < self.current.len() {
                let n = (self.current.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if buf.is_empty() {
                return Ok(0);
            }
            if self.pipe.is_canceled() {
                return Err(self.stored_err().unwrap_or(Error::Canceled));
            }
            let chunk = select! {
                recv(self.rx) -> chunk => chunk,
                recv(self.pipe.receiver()) -> _ => {
                    return Err(self.stored_err().unwrap_or(Error::Canceled));
                }
                recv(self.cancel.receiver()) -> _ => return Err(self.cancel.cause()),
            };
            match chunk {
                Ok(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                // The assembler is done; surface its error, if any, once.
                Err(_) => {
                    return match self.stored_err() {
                        Some(err) => Err(err),
                        None => Ok(0),
                    }
                }
            }
        }
    }
}

impl std::io::Read for OutputReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read_decompressed(buf).map_err(std::io::Error::other)
    }
}
