// ============================================================
// Layer 3 — Layout Token Types
// ============================================================
// A layout is a fixed-length sequence of integer tokens made of
// repeating element blocks:
//
//   [type, g0a, g0b, g1a, g1b, g2a, g2b] [type, ...] ... <eos> <pad>...
//    └──────────── BLOCK_WIDTH = 7 ───────┘
//
// The first token of a block is the element type, the remaining
// six are geometry tokens grouped in pairs (GEOMETRY_WIDTH = 2).
// Exactly one <eos> terminates the layout; everything after it
// up to the maximum length is <pad>.

use serde::{Deserialize, Serialize};

/// Number of tokens encoding one layout element (type + geometry).
pub const BLOCK_WIDTH: usize = 7;

/// Number of tokens per geometry attribute inside a block.
pub const GEOMETRY_WIDTH: usize = 2;

/// The three process-wide special tokens supplied by the dataset.
/// They never overlap the ordinary vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub pad:  u32,
    pub eos:  u32,
    pub mask: u32,
}

impl SpecialTokens {
    pub fn new(pad: u32, eos: u32, mask: u32) -> Self {
        Self { pad, eos, mask }
    }

    /// Pad and eos positions are never eligible for masking.
    pub fn is_maskable(&self, token: u32) -> bool {
        token != self.pad && token != self.eos
    }

    /// Index of the first eos token, or the full length when absent.
    pub fn valid_len(&self, sequence: &[u32]) -> usize {
        sequence
            .iter()
            .position(|&t| t == self.eos)
            .unwrap_or(sequence.len())
    }
}

/// One batch of training examples after masking.
///
/// All three matrices share the same `[rows, seq_len]` shape:
///   inputs  — tokens with masked positions replaced by the mask token
///   targets — the original, unmasked tokens
///   mask    — true exactly where `inputs` holds a substituted mask token
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedBatch {
    pub inputs:  Vec<Vec<u32>>,
    pub targets: Vec<Vec<u32>>,
    pub mask:    Vec<Vec<bool>>,
}

impl MaskedBatch {
    pub fn rows(&self) -> usize {
        self.inputs.len()
    }

    pub fn seq_len(&self) -> usize {
        self.inputs.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Number of masked positions per row.
    pub fn masked_counts(&self) -> Vec<usize> {
        self.mask
            .iter()
            .map(|row| row.iter().filter(|&&m| m).count())
            .collect()
    }

    /// Split the rows into at most `parts` contiguous shards of near-equal size.
    /// Used to partition a batch across replicas.
    pub fn shards(&self, parts: usize) -> Vec<MaskedBatch> {
        let rows = self.rows();
        if rows == 0 {
            return Vec::new();
        }
        let parts = parts.clamp(1, rows);
        let base  = rows / parts;
        let extra = rows % parts;

        let mut out   = Vec::with_capacity(parts);
        let mut start = 0;
        for i in 0..parts {
            let len = base + usize::from(i < extra);
            let end = start + len;
            out.push(MaskedBatch {
                inputs:  self.inputs[start..end].to_vec(),
                targets: self.targets[start..end].to_vec(),
                mask:    self.mask[start..end].to_vec(),
            });
            start = end;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKENS: SpecialTokens = SpecialTokens { pad: 0, eos: 1, mask: 2 };

    fn batch(rows: usize) -> MaskedBatch {
        let inputs: Vec<Vec<u32>> = (0..rows).map(|r| vec![r as u32 + 10; 4]).collect();
        MaskedBatch {
            targets: inputs.clone(),
            mask:    vec![vec![false; 4]; rows],
            inputs,
        }
    }

    #[test]
    fn test_valid_len_stops_at_first_eos() {
        assert_eq!(TOKENS.valid_len(&[5, 6, 1, 0, 0]), 2);
        assert_eq!(TOKENS.valid_len(&[5, 6, 7]), 3);
    }

    #[test]
    fn test_pad_and_eos_not_maskable() {
        assert!(!TOKENS.is_maskable(0));
        assert!(!TOKENS.is_maskable(1));
        assert!(TOKENS.is_maskable(9));
    }

    #[test]
    fn test_shards_cover_all_rows_in_order() {
        let shards = batch(5).shards(2);
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].rows(), 3);
        assert_eq!(shards[1].rows(), 2);
        assert_eq!(shards[1].inputs[0][0], 13);
    }

    #[test]
    fn test_shards_never_exceed_rows() {
        assert_eq!(batch(2).shards(8).len(), 2);
        assert!(batch(0).shards(3).is_empty());
    }
}
