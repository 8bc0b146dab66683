/// Move-to-front decoder: symbols are re-encoded as positions in a list
/// that is reordered on each access, so recently used symbols take small
/// values.
pub(crate) struct MoveToFrontDecoder {
    symbols: Vec<u8>,
}

impl MoveToFrontDecoder {
    /// Decoder over an explicit symbol list, most recently used first.
    pub fn new(symbols: &[u8]) -> Self {
        MoveToFrontDecoder {
            symbols: symbols.to_vec(),
        }
    }

    /// Decoder over the symbols `0..n`.
    pub fn new_with_range(n: usize) -> Self {
        MoveToFrontDecoder {
            symbols: (0..n as u8).collect(),
        }
    }

    pub fn decode(&mut self, n: usize) -> u8 {
        let b = self.symbols[n];
        self.symbols.copy_within(..n, 1);
        self.symbols[0] = b;
        b
    }

    /// The symbol at the front of the list.
    pub fn first(&self) -> u8 {
        self.symbols[0]
    }
}
