//! Splitting a compressed input into whole bzip2 blocks without decoding
//! them.
//!
//! The scanner consumes the input as a byte stream and emits one
//! [`CompressedBlock`] per bzip2 block, located by searching for the block
//! magic at every bit alignment. The first unit in the stream is the
//! 4-byte header, which is validated and consumed; end-of-stream trailers
//! (including those of concatenated and empty streams) are detected and
//! folded into the terminal block of each stream.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use crate::bitstream::{find_trailing_magic_and_crc, shift_right, MagicTables};
use crate::bzip2::{EOS_MAGIC, FILE_MAGIC};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Configuration for [`Scanner`].
#[derive(Clone, Copy)]
pub struct ScannerOptions {
    max_preamble: usize,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        // Allow enough overhead for the per-block coding tables that
        // precede the content bits.
        ScannerOptions {
            max_preamble: 30 * 1024,
        }
    }
}

impl ScannerOptions {
    /// Sets the overhead, in bytes, assumed sufficient to capture all of
    /// the bzip2 per-block data structures beyond the maximum uncompressed
    /// block size. Only ever needed if the scanner fails to find a magic
    /// number within its look-ahead window.
    pub fn scan_block_overhead(mut self, bytes: usize) -> Self {
        self.max_preamble = bytes;
        self
    }
}

/// A single bzip2 compressed block as carved out of the input stream.
///
/// `data` contains the block's compressed bits, starting at `bit_offset`
/// in the first byte and running for `size_in_bits` bits. The leading
/// block magic is not included.
#[derive(Debug, Clone, Default)]
pub struct CompressedBlock {
    pub data: Vec<u8>,
    /// Bits to skip in `data[0]` before the first meaningful bit.
    pub bit_offset: usize,
    /// Number of meaningful bits measured from `bit_offset`.
    pub size_in_bits: usize,
    /// The CRC stored in the first 32 bits of the block payload.
    pub crc: u32,
    /// The uncompressed block size of the containing stream, in bytes.
    pub stream_block_size: usize,
    /// True for the terminal block of a stream.
    pub is_stream_end: bool,
    /// The CRC stored in the end-of-stream trailer; meaningful only when
    /// `is_stream_end` is set.
    pub stream_crc: u32,
}

impl fmt::Display for CompressedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = self.stream_block_size / (100 * 1000);
        write!(
            f,
            "@{}..{} bits: block CRC 0x{:08x}, bzip2 level -{}",
            self.bit_offset, self.size_in_bits, self.crc, level
        )?;
        if self.is_stream_end {
            write!(f, " EOS: stream CRC 0x{:08x}", self.stream_crc)?;
        }
        Ok(())
    }
}

/// Emits runs of entire bzip2 blocks from a byte source.
///
/// Blocks are terminated by either the next block magic or the
/// end-of-stream magic. Both magics are matched at any bit alignment via
/// the precomputed shift tables in [`MagicTables`]. The first unit read is
/// the stream header, which is validated and consumed; the trailer of each
/// stream is likewise consumed and folded into its terminal block.
pub struct Scanner<R> {
    brd: LookaheadBuffer<R>,
    tables: Arc<MagicTables>,
    err: Option<Error>,
    prev_bit_offset: usize,
    first: bool,
    done: bool,
    max_preamble: usize,
    stream_block_size: usize,
}

impl<R: Read> Scanner<R> {
    pub fn new(rd: R) -> Self {
        Self::with_options(rd, ScannerOptions::default())
    }

    pub fn with_options(rd: R, opts: ScannerOptions) -> Self {
        Scanner {
            brd: LookaheadBuffer::new(rd),
            tables: crate::block_magic_tables(),
            err: None,
            prev_bit_offset: 0,
            first: true,
            done: false,
            max_preamble: opts.max_preamble,
            stream_block_size: 0,
        }
    }

    /// The first error encountered, if any.
    pub fn err(&self) -> Option<Error> {
        self.err.clone()
    }

    /// Advances to the next block. Returns `None` after the final block of
    /// the final stream, on error (see [`Scanner::err`]) or on
    /// cancellation.
    pub fn next(&mut self, cancel: &CancelToken) -> Option<CompressedBlock> {
        if self.err.is_some() || self.done {
            return None;
        }
        if cancel.is_canceled() {
            self.err = Some(cancel.cause());
            return None;
        }
        if self.first {
            if let Err(err) = self.scan_header() {
                self.err = Some(err);
                return None;
            }
        }
        let was_first = self.first;
        self.first = false;

        // Allow for the maximum possible block size plus its preamble.
        let lookahead = 9 * 100 * 1000 + self.max_preamble;
        if let Err(err) = self.brd.fill(lookahead) {
            self.err = Some(Error::Input(err.to_string()));
            return None;
        }
        let eof = self.brd.available() < lookahead;

        if was_first {
            // The block magic indicates the start of a block, not the end
            // of one, so the leading magic of the first block is discarded
            // before searching for the next one.
            let magic = self.tables.magic();
            if self.brd.peek(lookahead).starts_with(&magic) {
                self.brd.discard(magic.len());
                self.prev_bit_offset = 0;
            }
        }

        let buf = self.brd.peek(lookahead);
        match self.tables.scan(buf) {
            None => {
                if !eof {
                    self.err = Some(Error::BlockNotFound(lookahead));
                    return None;
                }
                // If the stream is corrupted and there are no trailing
                // empty streams to trim, the stream checksum check will
                // fail or the trailer won't be located.
                let (trimmed, _) = trim_trailing_empty_files(buf);
                match handle_eof(self.prev_bit_offset, self.stream_block_size, trimmed) {
                    Ok(block) => {
                        self.done = true;
                        Some(block)
                    }
                    Err(err) => {
                        self.err = Some(err);
                        None
                    }
                }
            }
            Some((byte_offset, bit_offset)) => {
                if bit_offset == 0 {
                    // A byte-aligned match may sit just past a skipped
                    // end-of-stream trailer and the next stream's header.
                    if let Some(skipped) = handle_skipped_eos(&buf[..byte_offset]) {
                        // The size in bits is that of the compressed block
                        // up to the EOS trailer, so the trailer offset
                        // participates below.
                        let sz_bits = (byte_offset as i64 - skipped.consumed as i64) * 8
                            + skipped.trailer_offset as i64
                            - self.prev_bit_offset as i64;
                        let mut sz_bytes = sz_bits / 8;
                        if sz_bits % 8 != 0 {
                            sz_bytes += 1;
                        }
                        if self.prev_bit_offset > 0 {
                            sz_bytes += 1;
                        }
                        let block = make_block(
                            self.prev_bit_offset,
                            self.stream_block_size,
                            true,
                            buf,
                            sz_bytes.max(0) as usize,
                            sz_bits.max(0) as usize,
                            skipped.prev_stream_crc,
                        );
                        self.stream_block_size = skipped.new_stream_block_size;
                        self.prev_bit_offset = bit_offset;
                        // Skip the magic before searching for the next one.
                        self.brd.discard(byte_offset + 6);
                        return Some(block);
                    }
                }
                let mut sz = byte_offset;
                if bit_offset > 0 {
                    sz += 1;
                }
                let size_in_bits =
                    (byte_offset * 8 + bit_offset) as i64 - self.prev_bit_offset as i64;
                let block = make_block(
                    self.prev_bit_offset,
                    self.stream_block_size,
                    false,
                    buf,
                    sz,
                    size_in_bits.max(0) as usize,
                    0,
                );
                self.prev_bit_offset = bit_offset;
                // Skip the magic before searching for the next one.
                self.brd.discard(byte_offset + 6);
                Some(block)
            }
        }
    }

    fn scan_header(&mut self) -> Result<()> {
        if let Err(err) = self.brd.fill(4) {
            return Err(Error::StreamHeader(err.to_string()));
        }
        let header = self.brd.peek(4);
        if header.is_empty() {
            return Err(Error::StreamHeader("EOF".into()));
        }
        if header.len() != 4 {
            return Err(Error::HeaderTooSmall(header.len()));
        }
        let block_size = parse_header(header)?;
        self.stream_block_size = block_size;
        self.brd.discard(4);
        Ok(())
    }
}

/// Validates a 4-byte stream header and returns the uncompressed block
/// size it selects.
///
/// The header is the two-byte 'BZ' signature, the version byte ('h' for
/// Huffman coding) and the block size selector '1'..'9' denoting
/// 100kB..900kB.
pub(crate) fn parse_header(buf: &[u8]) -> Result<usize> {
    if buf[0..2] != FILE_MAGIC {
        return Err(Error::WrongFileMagic {
            first: buf[0],
            second: buf[1],
        });
    }
    if buf[2] != b'h' {
        return Err(Error::WrongVersion(buf[2] as char));
    }
    let selector = buf[3];
    if !selector.is_ascii_digit() {
        return Err(Error::BadBlockSize(selector as char));
    }
    Ok(100 * 1000 * usize::from(selector - b'0'))
}

// Extracts the 32-bit CRC stored at bit `shift` of the block payload.
fn read_crc(block: &[u8], shift: usize) -> u32 {
    if block.len() < 4 {
        return 0;
    }
    let mut tmp = [0u8; 5];
    let n = block.len().min(5);
    tmp[..n].copy_from_slice(&block[..n]);
    for _ in shift..8 {
        shift_right(&mut tmp);
    }
    u32::from_be_bytes(tmp[1..5].try_into().unwrap())
}

fn make_block(
    prev_bit_offset: usize,
    stream_block_size: usize,
    eos: bool,
    buf: &[u8],
    sz: usize,
    size_in_bits: usize,
    stream_crc: u32,
) -> CompressedBlock {
    let mut block = CompressedBlock {
        is_stream_end: eos,
        bit_offset: prev_bit_offset,
        size_in_bits,
        stream_block_size,
        stream_crc,
        ..Default::default()
    };
    if sz > 0 {
        block.data = buf[..sz].to_vec();
        block.crc = read_crc(buf, prev_bit_offset);
    }
    block
}

// The input ends here: everything up to the trailer belongs to the final
// block of the final stream.
fn handle_eof(
    prev_bit_offset: usize,
    stream_block_size: usize,
    buf: &[u8],
) -> Result<CompressedBlock> {
    let (crc, trailer_size, trailer_offset) =
        find_trailing_magic_and_crc(buf, &EOS_MAGIC).ok_or(Error::Trailer)?;
    let sz_bytes = buf.len() - trailer_size;
    let mut sz_bits = sz_bytes as i64 * 8;
    if trailer_offset > 0 {
        sz_bits += -8 + trailer_offset as i64;
    }
    if prev_bit_offset > 0 {
        sz_bits -= prev_bit_offset as i64;
    }
    Ok(make_block(
        prev_bit_offset,
        stream_block_size,
        true,
        buf,
        sz_bytes,
        sz_bits.max(0) as usize,
        u32::from_be_bytes(crc),
    ))
}

// Removes a trailing run of zero or more empty streams. An empty stream is
// a 4-byte header directly followed by the EOS magic, an all-zero CRC and
// 0..7 bits of padding, 14 or 15 bytes in all.
fn trim_trailing_empty_files(mut buf: &[u8]) -> (&[u8], usize) {
    let mut n = 0;
    while let Some(trimmed) = trim_empty_file(buf) {
        buf = trimmed;
        n += 1;
    }
    (buf, n)
}

fn trim_empty_file(buf: &[u8]) -> Option<&[u8]> {
    let (crc, _, trailer_offset) = find_trailing_magic_and_crc(buf, &EOS_MAGIC)?;
    if crc != [0, 0, 0, 0] {
        return None;
    }
    let mut cut = 14; // 10 bytes of trailer plus the 4-byte header
    if trailer_offset > 0 {
        cut += 1;
    }
    let l = buf.len();
    if l < cut {
        return None;
    }
    parse_header(&buf[l - cut..l - cut + 4]).ok()?;
    Some(&buf[..l - cut])
}

struct SkippedEos {
    new_stream_block_size: usize,
    prev_stream_crc: u32,
    consumed: usize,
    trailer_offset: usize,
}

// Tests whether the data before a byte-aligned block magic ends a stream
// and begins the next one. If an EOS trailer has been skipped, the block
// magic must be preceded by a valid stream header, itself preceded by zero
// or more empty streams and then the trailer of the current stream:
//
//   ...EOS [empty stream]* <header> <block magic>
fn handle_skipped_eos(buf: &[u8]) -> Option<SkippedEos> {
    if buf.len() <= 4 {
        return None;
    }
    let l = buf.len();
    let new_stream_block_size = parse_header(&buf[l - 4..]).ok()?;
    let (trimmed, n) = trim_trailing_empty_files(&buf[..l - 4]);
    let (trailer, trailer_size, trailer_offset) =
        find_trailing_magic_and_crc(trimmed, &EOS_MAGIC)?;
    // Header, trailer, plus any empty streams.
    let mut consumed = 4 + trailer_size + n * 14;
    if trailer_offset > 0 {
        consumed += 1;
    }
    Some(SkippedEos {
        new_stream_block_size,
        prev_stream_crc: u32::from_be_bytes(trailer),
        consumed,
        trailer_offset,
    })
}

// A buffered reader over a byte source with a peek window large enough to
// hold an entire compressed block. EOF from the source is not an error;
// truncation shows up as a short peek.
struct LookaheadBuffer<R> {
    rd: R,
    buf: Vec<u8>,
    start: usize,
    eof: bool,
}

impl<R: Read> LookaheadBuffer<R> {
    fn new(rd: R) -> Self {
        LookaheadBuffer {
            rd,
            buf: Vec::new(),
            start: 0,
            eof: false,
        }
    }

    // Buffers until at least `n` bytes are available or the source is
    // exhausted.
    fn fill(&mut self, n: usize) -> io::Result<()> {
        if self.buf.len() - self.start >= n || self.eof {
            return Ok(());
        }
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        while self.buf.len() < n && !self.eof {
            let old = self.buf.len();
            self.buf.resize(n, 0);
            match self.rd.read(&mut self.buf[old..]) {
                Ok(0) => {
                    self.buf.truncate(old);
                    self.eof = true;
                }
                Ok(read) => self.buf.truncate(old + read),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => self.buf.truncate(old),
                Err(err) => {
                    self.buf.truncate(old);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn available(&self) -> usize {
        self.buf.len() - self.start
    }

    fn peek(&self, n: usize) -> &[u8] {
        let end = (self.start + n).min(self.buf.len());
        &self.buf[self.start..end]
    }

    fn discard(&mut self, n: usize) {
        self.start = (self.start + n).min(self.buf.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bzip2::BLOCK_MAGIC;

    fn scan_all(input: &[u8]) -> (Vec<CompressedBlock>, Option<Error>) {
        let cancel = CancelToken::new();
        let mut sc = Scanner::new(input);
        let mut blocks = Vec::new();
        while let Some(block) = sc.next(&cancel) {
            blocks.push(block);
        }
        (blocks, sc.err())
    }

    #[test]
    fn empty_input_is_a_header_error() {
        let (blocks, err) = scan_all(&[]);
        assert!(blocks.is_empty());
        assert_eq!(
            err.unwrap().to_string(),
            "failed to read stream header: EOF"
        );
    }

    #[test]
    fn short_header() {
        let (_, err) = scan_all(&[0x1, 0x1, 0x1]);
        assert_eq!(err.unwrap().to_string(), "stream header is too small: 3");
    }

    #[test]
    fn header_validation() {
        assert_eq!(
            scan_all(b"xZh9....").1.unwrap().to_string(),
            "wrong file magic: 785a"
        );
        assert_eq!(
            scan_all(b"BZx9....").1.unwrap().to_string(),
            "wrong version: x"
        );
        assert_eq!(
            scan_all(b"BZhx....").1.unwrap().to_string(),
            "bad block size: x"
        );
    }

    #[test]
    fn parse_header_block_sizes() {
        assert_eq!(parse_header(b"BZh1").unwrap(), 100_000);
        assert_eq!(parse_header(b"BZh9").unwrap(), 900_000);
    }

    #[test]
    fn missing_trailer() {
        // A valid header and block magic, then data that ends without any
        // end-of-stream trailer.
        let mut input = b"BZh9".to_vec();
        input.extend_from_slice(&BLOCK_MAGIC);
        input.extend_from_slice(&[0x55; 64]);
        let (blocks, err) = scan_all(&input);
        assert!(blocks.is_empty());
        assert_eq!(err.unwrap().to_string(), "failed to find trailer");
    }

    #[test]
    fn block_not_found_within_lookahead() {
        let mut input = b"BZh9".to_vec();
        input.extend_from_slice(&BLOCK_MAGIC);
        input.extend_from_slice(&vec![0u8; 2 * 1000 * 1000]);
        let (blocks, err) = scan_all(&input);
        assert!(blocks.is_empty());
        assert_eq!(
            err.unwrap().to_string(),
            "failed to find next block within expected max buffer size of 930720"
        );
    }

    #[test]
    fn lone_empty_stream_yields_single_empty_terminal_block() {
        // Header + EOS magic + zero CRC: a stream with no blocks.
        let mut input = b"BZh9".to_vec();
        input.extend_from_slice(&EOS_MAGIC);
        input.extend_from_slice(&[0, 0, 0, 0]);
        let (blocks, err) = scan_all(&input);
        assert!(err.is_none(), "{:?}", err);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_stream_end);
        assert!(blocks[0].data.is_empty());
        assert_eq!(blocks[0].stream_crc, 0);
        assert_eq!(blocks[0].size_in_bits, 0);
    }

    #[test]
    fn cancellation_stops_the_scan() {
        let cancel = CancelToken::new();
        cancel.cancel(Error::Canceled);
        let mut sc = Scanner::new(&b"BZh9 anything"[..]);
        assert!(sc.next(&cancel).is_none());
        assert_eq!(sc.err().unwrap(), Error::Canceled);
    }

    #[test]
    fn trim_empty_files_strips_complete_trailing_streams() {
        let empty_stream: Vec<u8> = {
            let mut v = b"BZh9".to_vec();
            v.extend_from_slice(&EOS_MAGIC);
            v.extend_from_slice(&[0, 0, 0, 0]);
            v
        };
        let mut buf = b"payload".to_vec();
        buf.extend_from_slice(&empty_stream);
        buf.extend_from_slice(&empty_stream);
        let (trimmed, n) = trim_trailing_empty_files(&buf);
        assert_eq!(n, 2);
        assert_eq!(trimmed, b"payload");

        // A non-zero CRC is not an empty stream.
        let mut buf = b"payload".to_vec();
        buf.extend_from_slice(&empty_stream);
        let l = buf.len();
        buf[l - 1] = 0xff;
        let (_, n) = trim_trailing_empty_files(&buf);
        assert_eq!(n, 0);
    }

    #[test]
    fn read_crc_extracts_bit_aligned_value() {
        // CRC bytes 0x01020304 at the start of an aligned payload.
        let buf = [0x01, 0x02, 0x03, 0x04, 0xaa];
        assert_eq!(read_crc(&buf, 0), 0x01020304);

        // The same payload shifted right by three bits.
        let mut shifted = [0u8; 6];
        shifted[..5].copy_from_slice(&buf);
        for _ in 0..3 {
            shift_right(&mut shifted);
        }
        assert_eq!(read_crc(&shifted, 3), 0x01020304);
    }

    #[test]
    fn lookahead_buffer_peek_and_discard() {
        let data: Vec<u8> = (0..=255u8).collect();
        let mut buf = LookaheadBuffer::new(&data[..]);
        buf.fill(16).unwrap();
        assert_eq!(buf.peek(4), &[0, 1, 2, 3]);
        buf.discard(4);
        buf.fill(300).unwrap();
        assert_eq!(buf.available(), 252);
        assert_eq!(buf.peek(2), &[4, 5]);
        buf.discard(300);
        assert_eq!(buf.available(), 0);
    }
}
