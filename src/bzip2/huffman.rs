use crate::bzip2::bit_reader::BitReader;
use crate::error::{Error, Result};

// A canonical Huffman tree navigated bit-by-bit to reach a symbol. The
// symbols are u16 because bzip2 encodes not only MTF indexes but also the
// two run-length metasymbols and an EOF symbol, so there can be more than
// 256 of them.
pub(crate) struct HuffmanTree {
    // All non-leaf nodes; nodes[0] is the root.
    nodes: Vec<HuffmanNode>,
    next_node: usize,
}

// If left or right is INVALID_NODE the child is a leaf and its value is in
// left_value/right_value.
#[derive(Clone, Copy, Default)]
struct HuffmanNode {
    left: u16,
    right: u16,
    left_value: u16,
    right_value: u16,
}

const INVALID_NODE: u16 = 0xffff;

struct HuffmanCode {
    code: u32,
    value: u16,
}

impl HuffmanTree {
    /// Builds the canonical tree from the code length of each symbol. The
    /// tree shape is fully determined by the sorted lengths, with the
    /// shortest codes on the left.
    pub fn new(lengths: &[u8]) -> Result<HuffmanTree> {
        // Sort the code length assignments by ascending code length, using
        // the symbol value to break ties.
        let mut pairs: Vec<(u8, u16)> = lengths
            .iter()
            .enumerate()
            .map(|(i, &length)| (length, i as u16))
            .collect();
        pairs.sort();

        // Assign codes starting with the longest, packed into a u32 at the
        // most-significant end so that branches are taken from the MSB
        // downwards and the codes sort into tree order.
        let mut code = 0u32;
        let mut length = 32u8;
        let mut codes: Vec<HuffmanCode> = Vec::with_capacity(lengths.len());
        codes.resize_with(lengths.len(), || HuffmanCode { code: 0, value: 0 });
        for i in (0..pairs.len()).rev() {
            if length > pairs[i].0 {
                length = pairs[i].0;
            }
            codes[i].code = code;
            codes[i].value = pairs[i].1;
            // 'Increment' the code, treating it as a `length` bit number.
            code = code.wrapping_add(1u32 << (32 - u32::from(length)));
        }
        codes.sort_by_key(|c| c.code);

        let mut tree = HuffmanTree {
            nodes: vec![HuffmanNode::default(); codes.len()],
            next_node: 0,
        };
        tree.build_node(&codes, 0)?;
        Ok(tree)
    }

    /// Reads bits and navigates the tree until a symbol is found.
    pub fn decode(&self, br: &mut BitReader) -> u16 {
        let mut node_index = 0usize;
        loop {
            let node = &self.nodes[node_index];
            let bit = br.read_bit();
            let next = if bit { node.left } else { node.right };
            if next == INVALID_NODE {
                return if bit { node.left_value } else { node.right_value };
            }
            node_index = next as usize;
        }
    }

    // Builds a node from a slice of code-sorted entries at the given level
    // and returns its index.
    fn build_node(&mut self, codes: &[HuffmanCode], level: u32) -> Result<u16> {
        let test = 1u32 << (31 - level);
        let first_right = codes
            .iter()
            .position(|c| c.code & test != 0)
            .unwrap_or(codes.len());
        let (left, right) = codes.split_at(first_right);

        if left.is_empty() || right.is_empty() {
            // A superfluous level in the tree indicates a bug in the
            // encoder, but it has been observed in the wild so it is
            // tolerated as long as it terminates.
            if codes.len() < 2 {
                return Err(Error::Structural("empty Huffman tree".into()));
            }
            if level == 31 {
                return Err(Error::Structural("equal symbols in Huffman tree".into()));
            }
            if left.is_empty() {
                return self.build_node(right, level + 1);
            }
            return self.build_node(left, level + 1);
        }

        let node_index = self.next_node;
        self.next_node += 1;

        if left.len() == 1 {
            self.nodes[node_index].left = INVALID_NODE;
            self.nodes[node_index].left_value = left[0].value;
        } else {
            let child = self.build_node(left, level + 1)?;
            self.nodes[node_index].left = child;
        }

        if right.len() == 1 {
            self.nodes[node_index].right = INVALID_NODE;
            self.nodes[node_index].right_value = right[0].value;
        } else {
            let child = self.build_node(right, level + 1)?;
            self.nodes[node_index].right = child;
        }

        Ok(node_index as u16)
    }
}
