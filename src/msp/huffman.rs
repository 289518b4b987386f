// src/msp/huffman.rs
//
// =============================================================================
// BBSYNCER: HUFFMAN DECODER
// =============================================================================
//
// Betaflight optionally compresses MSP_DATAFLASH_READ payloads with a static
// canonical Huffman code: 256 byte symbols plus an explicit EOF marker.
// The code table below mirrors the firmware's table; both sides must agree
// bit-for-bit or the dump is garbage.
//
// Decoding walks a binary trie, MSB-first. The trie is built once per
// process from the table.

use std::sync::OnceLock;

use thiserror::Error;

/// Symbol index of the end-of-stream marker (one past the byte values).
pub const HUFFMAN_EOF: u16 = 256;

/// One row of the static code table, indexed by symbol value.
#[derive(Debug, Clone, Copy)]
pub struct HuffmanEntry {
    pub code_len: u8,
    pub code: u16,
}

const fn e(code_len: u8, code: u16) -> HuffmanEntry {
    HuffmanEntry { code_len, code }
}

/// Canonical code table shared with the firmware. Code lengths span 2..=11
/// bits; shorter codes map to the byte values that dominate blackbox data.
#[rustfmt::skip]
pub static HUFFMAN_TABLE: [HuffmanEntry; 257] = [
    e(2, 0x000), e(2, 0x001), e(4, 0x008), e(4, 0x009), e(4, 0x00A), e(4, 0x00B), // 0x00-0x05
    e(6, 0x030), e(6, 0x031), e(9, 0x190), e(9, 0x191), e(9, 0x192), e(9, 0x193), // 0x06-0x0B
    e(9, 0x194), e(9, 0x195), e(9, 0x196), e(9, 0x197), e(9, 0x198), e(9, 0x199), // 0x0C-0x11
    e(9, 0x19A), e(9, 0x19B), e(9, 0x19C), e(9, 0x19D), e(9, 0x19E), e(9, 0x19F), // 0x12-0x17
    e(9, 0x1A0), e(9, 0x1A1), e(9, 0x1A2), e(9, 0x1A3), e(9, 0x1A4), e(9, 0x1A5), // 0x18-0x1D
    e(9, 0x1A6), e(9, 0x1A7), e(9, 0x1A8), e(9, 0x1A9), e(9, 0x1AA), e(9, 0x1AB), // 0x1E-0x23
    e(9, 0x1AC), e(9, 0x1AD), e(9, 0x1AE), e(9, 0x1AF), e(9, 0x1B0), e(10, 0x362), // 0x24-0x29
    e(10, 0x363), e(10, 0x364), e(10, 0x365), e(10, 0x366), e(10, 0x367), e(10, 0x368), // 0x2A-0x2F
    e(10, 0x369), e(10, 0x36A), e(10, 0x36B), e(10, 0x36C), e(10, 0x36D), e(10, 0x36E), // 0x30-0x35
    e(10, 0x36F), e(10, 0x370), e(10, 0x371), e(10, 0x372), e(10, 0x373), e(10, 0x374), // 0x36-0x3B
    e(10, 0x375), e(10, 0x376), e(10, 0x377), e(10, 0x378), e(10, 0x379), e(10, 0x37A), // 0x3C-0x41
    e(10, 0x37B), e(10, 0x37C), e(10, 0x37D), e(10, 0x37E), e(10, 0x37F), e(10, 0x380), // 0x42-0x47
    e(10, 0x381), e(10, 0x382), e(10, 0x383), e(10, 0x384), e(10, 0x385), e(10, 0x386), // 0x48-0x4D
    e(10, 0x387), e(10, 0x388), e(10, 0x389), e(10, 0x38A), e(10, 0x38B), e(10, 0x38C), // 0x4E-0x53
    e(10, 0x38D), e(10, 0x38E), e(10, 0x38F), e(10, 0x390), e(10, 0x391), e(10, 0x392), // 0x54-0x59
    e(10, 0x393), e(10, 0x394), e(10, 0x395), e(10, 0x396), e(10, 0x397), e(10, 0x398), // 0x5A-0x5F
    e(10, 0x399), e(10, 0x39A), e(10, 0x39B), e(10, 0x39C), e(10, 0x39D), e(10, 0x39E), // 0x60-0x65
    e(10, 0x39F), e(10, 0x3A0), e(10, 0x3A1), e(10, 0x3A2), e(10, 0x3A3), e(10, 0x3A4), // 0x66-0x6B
    e(10, 0x3A5), e(10, 0x3A6), e(10, 0x3A7), e(10, 0x3A8), e(10, 0x3A9), e(10, 0x3AA), // 0x6C-0x71
    e(10, 0x3AB), e(10, 0x3AC), e(10, 0x3AD), e(10, 0x3AE), e(10, 0x3AF), e(10, 0x3B0), // 0x72-0x77
    e(10, 0x3B1), e(10, 0x3B2), e(10, 0x3B3), e(10, 0x3B4), e(10, 0x3B5), e(10, 0x3B6), // 0x78-0x7D
    e(10, 0x3B7), e(10, 0x3B8), e(10, 0x3B9), e(10, 0x3BA), e(10, 0x3BB), e(10, 0x3BC), // 0x7E-0x83
    e(10, 0x3BD), e(10, 0x3BE), e(10, 0x3BF), e(10, 0x3C0), e(10, 0x3C1), e(10, 0x3C2), // 0x84-0x89
    e(10, 0x3C3), e(10, 0x3C4), e(10, 0x3C5), e(11, 0x78C), e(11, 0x78D), e(11, 0x78E), // 0x8A-0x8F
    e(11, 0x78F), e(11, 0x790), e(11, 0x791), e(11, 0x792), e(11, 0x793), e(11, 0x794), // 0x90-0x95
    e(11, 0x795), e(11, 0x796), e(11, 0x797), e(11, 0x798), e(11, 0x799), e(11, 0x79A), // 0x96-0x9B
    e(11, 0x79B), e(11, 0x79C), e(11, 0x79D), e(11, 0x79E), e(11, 0x79F), e(11, 0x7A0), // 0x9C-0xA1
    e(11, 0x7A1), e(11, 0x7A2), e(11, 0x7A3), e(11, 0x7A4), e(11, 0x7A5), e(11, 0x7A6), // 0xA2-0xA7
    e(11, 0x7A7), e(11, 0x7A8), e(11, 0x7A9), e(11, 0x7AA), e(11, 0x7AB), e(11, 0x7AC), // 0xA8-0xAD
    e(11, 0x7AD), e(11, 0x7AE), e(11, 0x7AF), e(11, 0x7B0), e(11, 0x7B1), e(11, 0x7B2), // 0xAE-0xB3
    e(11, 0x7B3), e(11, 0x7B4), e(11, 0x7B5), e(11, 0x7B6), e(11, 0x7B7), e(11, 0x7B8), // 0xB4-0xB9
    e(11, 0x7B9), e(11, 0x7BA), e(11, 0x7BB), e(11, 0x7BC), e(11, 0x7BD), e(11, 0x7BE), // 0xBA-0xBF
    e(11, 0x7BF), e(11, 0x7C0), e(11, 0x7C1), e(11, 0x7C2), e(11, 0x7C3), e(11, 0x7C4), // 0xC0-0xC5
    e(11, 0x7C5), e(11, 0x7C6), e(11, 0x7C7), e(11, 0x7C8), e(11, 0x7C9), e(11, 0x7CA), // 0xC6-0xCB
    e(11, 0x7CB), e(11, 0x7CC), e(11, 0x7CD), e(11, 0x7CE), e(11, 0x7CF), e(11, 0x7D0), // 0xCC-0xD1
    e(11, 0x7D1), e(11, 0x7D2), e(11, 0x7D3), e(11, 0x7D4), e(11, 0x7D5), e(11, 0x7D6), // 0xD2-0xD7
    e(11, 0x7D7), e(11, 0x7D8), e(11, 0x7D9), e(11, 0x7DA), e(11, 0x7DB), e(11, 0x7DC), // 0xD8-0xDD
    e(11, 0x7DD), e(11, 0x7DE), e(11, 0x7DF), e(11, 0x7E0), e(11, 0x7E1), e(11, 0x7E2), // 0xDE-0xE3
    e(11, 0x7E3), e(11, 0x7E4), e(11, 0x7E5), e(11, 0x7E6), e(11, 0x7E7), e(11, 0x7E8), // 0xE4-0xE9
    e(11, 0x7E9), e(11, 0x7EA), e(11, 0x7EB), e(11, 0x7EC), e(11, 0x7ED), e(11, 0x7EE), // 0xEA-0xEF
    e(11, 0x7EF), e(11, 0x7F0), e(11, 0x7F1), e(11, 0x7F2), e(11, 0x7F3), e(11, 0x7F4), // 0xF0-0xF5
    e(11, 0x7F5), e(11, 0x7F6), e(11, 0x7F7), e(11, 0x7F8), e(11, 0x7F9), e(11, 0x7FA), // 0xF6-0xFB
    e(11, 0x7FB), e(11, 0x7FC), e(11, 0x7FD), e(11, 0x7FE), e(11, 0x7FF), // 0xFC-EOF
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HuffmanError {
    /// Input bits ran out in the middle of a code word.
    #[error("huffman input exhausted mid-code")]
    TruncatedCode,

    /// A bit path led outside the code trie.
    #[error("huffman bit sequence matches no code")]
    InvalidCode,
}

// -----------------------------------------------------------------------------
// Decoding trie
// -----------------------------------------------------------------------------

const NO_NODE: u16 = u16::MAX;
const NO_SYMBOL: u16 = u16::MAX;

struct TrieNode {
    child: [u16; 2],
    symbol: u16,
}

impl TrieNode {
    fn empty() -> Self {
        TrieNode {
            child: [NO_NODE, NO_NODE],
            symbol: NO_SYMBOL,
        }
    }
}

fn decode_trie() -> &'static Vec<TrieNode> {
    static TRIE: OnceLock<Vec<TrieNode>> = OnceLock::new();
    TRIE.get_or_init(|| {
        let mut nodes = vec![TrieNode::empty()];
        for (symbol, entry) in HUFFMAN_TABLE.iter().enumerate() {
            let mut at = 0usize;
            for bit_pos in (0..entry.code_len).rev() {
                let bit = ((entry.code >> bit_pos) & 1) as usize;
                if nodes[at].child[bit] == NO_NODE {
                    nodes.push(TrieNode::empty());
                    let idx = (nodes.len() - 1) as u16;
                    nodes[at].child[bit] = idx;
                }
                at = nodes[at].child[bit] as usize;
            }
            nodes[at].symbol = symbol as u16;
        }
        nodes
    })
}

// -----------------------------------------------------------------------------
// Decode
// -----------------------------------------------------------------------------

/// Decode a Huffman bitstream into at most `char_count` bytes.
///
/// Stops early at the EOF symbol or when the input ends on a code boundary;
/// running out of bits inside a code word is an error, as is a bit path not
/// present in the trie.
pub fn huffman_decode(input: &[u8], char_count: u16) -> Result<Vec<u8>, HuffmanError> {
    let trie = decode_trie();
    let mut out = Vec::with_capacity(char_count as usize);
    let total_bits = input.len() * 8;
    let mut bit_idx = 0usize;

    while out.len() < char_count as usize {
        let mut at = 0usize;
        loop {
            if bit_idx >= total_bits {
                if at == 0 {
                    // Clean boundary: the stream simply ended short.
                    return Ok(out);
                }
                return Err(HuffmanError::TruncatedCode);
            }
            let byte = input[bit_idx / 8];
            let bit = ((byte >> (7 - (bit_idx % 8))) & 1) as usize;
            bit_idx += 1;

            let next = trie[at].child[bit];
            if next == NO_NODE {
                return Err(HuffmanError::InvalidCode);
            }
            at = next as usize;

            let symbol = trie[at].symbol;
            if symbol != NO_SYMBOL {
                if symbol == HUFFMAN_EOF {
                    return Ok(out);
                }
                out.push(symbol as u8);
                break;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert_eq!(huffman_decode(b"", 0).unwrap(), b"");
        assert_eq!(huffman_decode(&[0xFF, 0xFF, 0xFF], 0).unwrap(), b"");
    }

    #[test]
    fn shortest_codes() {
        // 0x00 -> bits 00, 0x01 -> bits 01
        assert_eq!(huffman_decode(&[0x00], 1).unwrap(), vec![0x00]);
        // 00 01 xxxx -> 0x10
        assert_eq!(huffman_decode(&[0x10], 2).unwrap(), vec![0x00, 0x01]);
    }

    #[test]
    fn char_count_caps_output() {
        // A full byte of zeros decodes to four 0x00 symbols, but the
        // advertised count wins.
        assert_eq!(huffman_decode(&[0x00], 2).unwrap(), vec![0x00, 0x00]);
    }

    #[test]
    fn truncated_mid_code_is_error() {
        // 1111 1111 is a prefix of the 11-bit EOF code; the byte ends
        // mid-walk with more output still owed.
        assert_eq!(
            huffman_decode(&[0xFF], 1).unwrap_err(),
            HuffmanError::TruncatedCode
        );
    }

    #[test]
    fn table_is_complete() {
        assert_eq!(HUFFMAN_TABLE.len(), 257);
        for entry in HUFFMAN_TABLE.iter() {
            assert!((2..=11).contains(&entry.code_len));
            assert!(entry.code < (1 << entry.code_len));
        }
    }
}
