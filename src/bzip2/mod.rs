//! Decoding of single bzip2 blocks.
//!
//! The stream-level framing (headers, block boundaries, stream CRCs) is
//! handled by the scanner and the parallel pipeline; this module takes one
//! block's compressed bits, starting at an arbitrary bit offset within a
//! buffer, and turns them back into plaintext: Huffman decode with the
//! run-length metasymbols, move-to-front, inverse Burrows-Wheeler, and the
//! outer run-length layer, with the block checksum verified at the end.

mod bit_reader;
mod crc;
mod huffman;
mod move_to_front;

use std::io::{self, Read};

use bit_reader::BitReader;
use crc::Crc;
use huffman::HuffmanTree;
use move_to_front::MoveToFrontDecoder;

use crate::error::{Error, Result};

/// The bzip2 file magic number, "BZ".
pub const FILE_MAGIC: [u8; 2] = [0x42, 0x5a];

/// The magic number at the start of each compressed block (pi).
pub const BLOCK_MAGIC: [u8; 6] = [0x31, 0x41, 0x59, 0x26, 0x53, 0x59];

/// The magic number of the end of stream trailer (sqrt pi).
pub const EOS_MAGIC: [u8; 6] = [0x17, 0x72, 0x45, 0x38, 0x50, 0x90];

// The repeat limit from the bzip2 source; prevents the run length
// accumulator from overflowing.
const MAX_REPEAT: usize = 2 * 1024 * 1024;

/// Reads the plaintext of a single bzip2 block.
///
/// `data` holds the block's compressed bits beginning at `bit_offset`
/// (0..=7) in its first byte, with the leading block magic already
/// stripped. The block is entropy-decoded and BWT-inverted up front; the
/// outer run-length layer is expanded on demand as the reader is drained.
pub struct BlockReader<'a> {
    br: BitReader<'a>,
    block_size: usize,
    start_bits: u32,

    want_crc: u32,
    crc: Crc,

    // The `tt` array from the bzip2 source: the BWT output byte in the low
    // 8 bits, the index of the next output position in the upper 24.
    tt: Vec<u32>,
    pre_rle_len: usize,
    pre_rle_used: usize,
    t_pos: u32,

    last_byte: i32,
    byte_repeats: u32,
    repeats: u32,

    started: bool,
    empty: bool,
    failed: Option<Error>,
}

impl<'a> BlockReader<'a> {
    pub fn new(block_size: usize, data: &'a [u8], bit_offset: usize) -> Self {
        BlockReader {
            br: BitReader::new(data),
            block_size,
            start_bits: bit_offset as u32,
            want_crc: 0,
            crc: Crc::new(),
            tt: Vec::new(),
            pre_rle_len: 0,
            pre_rle_used: 0,
            t_pos: 0,
            last_byte: -1,
            byte_repeats: 0,
            repeats: 0,
            started: false,
            empty: data.is_empty(),
            failed: None,
        }
    }

    /// Fills `buf` with decoded plaintext, returning 0 once the block has
    /// been fully emitted and its checksum verified.
    pub fn decode(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        if self.empty {
            return Ok(0);
        }
        if !self.started {
            self.started = true;
            self.br.read_bits(self.start_bits);
            if let Err(err) = self.read_block() {
                self.failed = Some(err.clone());
                return Err(err);
            }
        }
        let n = self.read_from_block(buf);
        if n > 0 || buf.is_empty() {
            self.crc.update(&buf[..n]);
            return Ok(n);
        }
        if self.crc.value() != self.want_crc {
            self.failed = Some(Error::BlockCrc);
            return Err(Error::BlockCrc);
        }
        Ok(0)
    }

    // Expands the pending run-length data into buf. bzip2 is block based
    // except for this outer RLE layer, whose worst-case expansion would
    // need a huge buffer, so it is decompressed on demand.
    fn read_from_block(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while (self.repeats > 0 || self.pre_rle_used < self.pre_rle_len) && n < buf.len() {
            if self.repeats > 0 {
                buf[n] = self.last_byte as u8;
                n += 1;
                self.repeats -= 1;
                if self.repeats == 0 {
                    self.last_byte = -1;
                }
                continue;
            }

            self.t_pos = self.tt[self.t_pos as usize];
            let b = self.t_pos as u8;
            self.t_pos >>= 8;
            self.pre_rle_used += 1;

            // Any sequence of four equal bytes is followed by a length byte
            // with the number of additional repeats.
            if self.byte_repeats == 3 {
                self.repeats = u32::from(b);
                self.byte_repeats = 0;
                continue;
            }

            if self.last_byte == i32::from(b) {
                self.byte_repeats += 1;
            } else {
                self.byte_repeats = 0;
            }
            self.last_byte = i32::from(b);

            buf[n] = b;
            n += 1;
        }
        n
    }

    // Parses the block payload (the magic has already been consumed by the
    // scanner) and leaves the RLE state ready for read_from_block.
    fn read_block(&mut self) -> Result<()> {
        let br = &mut self.br;
        self.want_crc = br.read_bits64(32) as u32;
        self.crc = Crc::new();

        if br.read_bits(1) != 0 {
            return Err(Error::Structural("deprecated randomized files".into()));
        }
        let orig_ptr = br.read_bits(24) as usize;

        // If not every byte value is used in the block then the symbol set
        // is reduced; the symbols used are stored as a two-level 16x16
        // bitmap.
        let symbol_range_bitmap = br.read_bits(16);
        let mut symbol_present = [false; 256];
        let mut num_symbols = 0usize;
        for sym_range in 0..16 {
            if symbol_range_bitmap & (1 << (15 - sym_range)) != 0 {
                let bits = br.read_bits(16);
                for symbol in 0..16 {
                    if bits & (1 << (15 - symbol)) != 0 {
                        symbol_present[16 * sym_range + symbol] = true;
                        num_symbols += 1;
                    }
                }
            }
        }
        if num_symbols == 0 {
            // There must be an EOF symbol.
            return Err(Error::Structural("no symbols in input".into()));
        }

        // A block uses between two and six Huffman trees.
        let num_huffman_trees = br.read_bits(3) as usize;
        if !(2..=6).contains(&num_huffman_trees) {
            return Err(Error::Structural("invalid number of Huffman trees".into()));
        }

        // The tree can switch every 50 symbols; the list of tree indexes is
        // move-to-front transformed and stored as unary numbers.
        let num_selectors = br.read_bits(15) as usize;
        let mut tree_indexes = vec![0u8; num_selectors];
        let mut mtf_tree_decoder = MoveToFrontDecoder::new_with_range(num_huffman_trees);
        for index in tree_indexes.iter_mut() {
            let mut c = 0usize;
            while br.read_bits(1) != 0 {
                c += 1;
                if c >= num_huffman_trees {
                    return Err(Error::Structural("tree index too large".into()));
                }
            }
            *index = mtf_tree_decoder.decode(c);
        }

        // The symbol list for the move-to-front transform comes from the
        // symbol bitmap decoded above.
        let mut symbols = Vec::with_capacity(num_symbols);
        for (i, present) in symbol_present.iter().enumerate() {
            if *present {
                symbols.push(i as u8);
            }
        }
        let mut mtf = MoveToFrontDecoder::new(&symbols);

        num_symbols += 2; // to account for the RUNA and RUNB symbols

        // Decode the delta-encoded code lengths and build each tree.
        let mut huffman_trees = Vec::with_capacity(num_huffman_trees);
        let mut lengths = vec![0u8; num_symbols];
        for _ in 0..num_huffman_trees {
            // The code lengths are delta encoded from a 5-bit base value.
            let mut length = br.read_bits(5) as i32;
            for l in lengths.iter_mut() {
                loop {
                    if !(1..=20).contains(&length) {
                        return Err(Error::Structural("Huffman length out of range".into()));
                    }
                    if !br.read_bit() {
                        break;
                    }
                    if br.read_bit() {
                        length -= 1;
                    } else {
                        length += 1;
                    }
                }
                *l = length as u8;
            }
            huffman_trees.push(HuffmanTree::new(&lengths)?);
        }

        if tree_indexes.is_empty() {
            return Err(Error::Structural("no tree selectors given".into()));
        }
        if usize::from(tree_indexes[0]) >= huffman_trees.len() {
            return Err(Error::Structural("tree selector out of range".into()));
        }
        let mut current_tree = &huffman_trees[usize::from(tree_indexes[0])];
        let mut selector_index = 1usize;

        // The MTF output is run-length encoded; the decoding is merged into
        // the Huffman parsing loop, with these two accumulating the repeat
        // count.
        let mut repeat = 0usize;
        let mut repeat_power = 0usize;

        // The `C' array for the inverse BWT.
        let mut c = [0u32; 256];

        self.tt.clear();
        self.tt.resize(self.block_size, 0);
        let mut buf_index = 0usize;
        let mut decoded = 0usize; // symbols decoded by the current tree
        loop {
            if decoded == 50 {
                if selector_index >= num_selectors {
                    return Err(Error::Structural(
                        "insufficient selector indices for number of symbols".into(),
                    ));
                }
                if usize::from(tree_indexes[selector_index]) >= huffman_trees.len() {
                    return Err(Error::Structural("tree selector out of range".into()));
                }
                current_tree = &huffman_trees[usize::from(tree_indexes[selector_index])];
                selector_index += 1;
                decoded = 0;
            }

            let v = current_tree.decode(br);
            decoded += 1;

            if v < 2 {
                // RUNA or RUNB.
                if repeat == 0 {
                    repeat_power = 1;
                }
                repeat += repeat_power << v;
                repeat_power <<= 1;
                if repeat > MAX_REPEAT {
                    return Err(Error::Structural("repeat count too large".into()));
                }
                continue;
            }

            if repeat > 0 {
                // A complete run length has been decoded; replicate the
                // current front of the MTF list.
                if repeat > self.block_size - buf_index {
                    return Err(Error::Structural("repeats past end of block".into()));
                }
                let b = mtf.first();
                c[usize::from(b)] += repeat as u32;
                for slot in &mut self.tt[buf_index..buf_index + repeat] {
                    *slot = u32::from(b);
                }
                buf_index += repeat;
                repeat = 0;
            }

            if usize::from(v) == num_symbols - 1 {
                // The EOF symbol: always at the end of the move-to-front
                // list and never moved to the front, so its value is
                // unique.
                break;
            }

            // The front of the MTF list is never referenced as 0 (a run
            // length of 1 is used instead), so ordinary symbols index with
            // v - 1.
            let b = mtf.decode(usize::from(v) - 1);
            if buf_index >= self.block_size {
                return Err(Error::Structural("data exceeds block size".into()));
            }
            self.tt[buf_index] = u32::from(b);
            c[usize::from(b)] += 1;
            buf_index += 1;
        }

        if orig_ptr >= buf_index {
            return Err(Error::Structural("origPtr out of bounds".into()));
        }

        // Entropy decoding is complete; invert the BWT and set up the RLE
        // state.
        self.tt.truncate(buf_index);
        self.pre_rle_len = buf_index;
        self.pre_rle_used = 0;
        self.t_pos = inverse_bwt(&mut self.tt, orig_ptr, &mut c);
        self.last_byte = -1;
        self.byte_repeats = 0;
        self.repeats = 0;
        Ok(())
    }
}

impl Read for BlockReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.decode(buf).map_err(io::Error::other)
    }
}

// The inverse Burrows-Wheeler transform using the single-array method from
// the bzip2 source: the output, still shuffled, stays in the bottom 8 bits
// of tt with the index of the next byte in the top 24. `c` is the byte
// count array from the entropy decoding pass. Returns the index of the
// first output byte.
fn inverse_bwt(tt: &mut [u32], orig_ptr: usize, c: &mut [u32; 256]) -> u32 {
    let mut sum = 0u32;
    for count in c.iter_mut() {
        sum += *count;
        *count = sum - *count;
    }

    for i in 0..tt.len() {
        let b = (tt[i] & 0xff) as usize;
        tt[c[b] as usize] |= (i as u32) << 8;
        c[b] += 1;
    }

    tt[orig_ptr] >> 8
}

/// Decodes one whole block into a freshly allocated buffer. An empty
/// `data` yields empty output, which is how terminal descriptors of empty
/// streams decode.
pub fn decompress_block(block_size: usize, data: &[u8], bit_offset: usize) -> Result<Vec<u8>> {
    let mut rd = BlockReader::new(block_size, data, bit_offset);
    let mut out = Vec::new();
    let mut chunk = [0u8; 32 * 1024];
    loop {
        let n = rd.decode(&mut chunk)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&chunk[..n]);
    }
}
