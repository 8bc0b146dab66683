/// Reads values bit-by-bit from a byte slice, most significant bit first.
///
/// Reads past the end of the data return zero rather than failing: the
/// block decode loop relies on its structural checks (and ultimately the
/// block checksum) to reject truncated payloads, which is what lets a
/// false-positive block half fail cleanly and be retried as a merge.
pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    n: u64,
    bits: u32,
    exhausted: bool,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BitReader {
            data,
            pos: 0,
            n: 0,
            bits: 0,
            exhausted: false,
        }
    }

    /// Reads the given number of bits (at most 57 per call) and returns
    /// them in the least-significant part of a u64.
    pub fn read_bits64(&mut self, bits: u32) -> u64 {
        if self.exhausted {
            return 0;
        }
        while bits > self.bits {
            match self.data.get(self.pos) {
                Some(&b) => {
                    self.pos += 1;
                    self.n = (self.n << 8) | u64::from(b);
                    self.bits += 8;
                }
                None => {
                    self.exhausted = true;
                    return 0;
                }
            }
        }
        let n = (self.n >> (self.bits - bits)) & ((1u64 << bits) - 1);
        self.bits -= bits;
        n
    }

    pub fn read_bits(&mut self, bits: u32) -> u32 {
        self.read_bits64(bits) as u32
    }

    pub fn read_bit(&mut self) -> bool {
        self.read_bits(1) != 0
    }
}
