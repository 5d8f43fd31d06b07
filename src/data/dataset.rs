// ============================================================
// Layer 4 — Layout Dataset
// ============================================================
// Implements Burn's Dataset trait over padded layout sequences so
// the DataLoader can index, shuffle and batch them.
//
// What is stored per layout?
//   One Vec<u32> of exactly max_len tokens:
//   [type, geometry x6] [type, geometry x6] ... <eos> <pad> ...
//
// Why keep the special tokens here?
//   pad, eos and mask ids come from the data file, not from the
//   code. Masking, rendering and vocabulary sizing all need them,
//   so they travel with the sequences they describe.
//
// render() turns a sequence into text, one element block per
// line, for the qualitative samples written during training.
//
// Reference: Burn Book §4 (Datasets)

use std::ops::Range;

use burn::data::dataset::Dataset;

use crate::domain::layout::{SpecialTokens, BLOCK_WIDTH, GEOMETRY_WIDTH};

/// Fixed-length layout token sequences sharing one set of special tokens.
#[derive(Debug, Clone)]
pub struct LayoutDataset {
    /// Token rows, each already padded to `max_len`
    sequences: Vec<Vec<u32>>,
    /// pad / eos / mask ids shared by every row
    tokens:    SpecialTokens,
    /// Fixed row length; also the model's positional range
    max_len:   usize,
}

impl LayoutDataset {
    /// Build from sequences that are already padded to `max_len`.
    pub fn new(sequences: Vec<Vec<u32>>, tokens: SpecialTokens, max_len: usize) -> Self {
        Self { sequences, tokens, max_len }
    }

    pub fn tokens(&self) -> SpecialTokens { self.tokens }

    pub fn max_len(&self) -> usize { self.max_len }

    pub fn sequences(&self) -> &[Vec<u32>] { &self.sequences }

    pub fn into_sequences(self) -> Vec<Vec<u32>> { self.sequences }

    /// Rows in `range`, clamped to the dataset bounds.
    pub fn slice(&self, range: Range<usize>) -> Vec<Vec<u32>> {
        let end   = range.end.min(self.sequences.len());
        let start = range.start.min(end);
        self.sequences[start..end].to_vec()
    }

    /// Smallest vocabulary that covers every stored token and the specials.
    pub fn vocab_size(&self) -> usize {
        let data_max = self.sequences.iter().flatten().copied().max().unwrap_or(0);
        let special  = self.tokens.pad.max(self.tokens.eos).max(self.tokens.mask);
        data_max.max(special) as usize + 1
    }

    /// Textual rendering: one line per element block before eos,
    /// `type | g0a g0b | g1a g1b | ...`.
    pub fn render(&self, sequence: &[u32]) -> String {
        render_layout(sequence, &self.tokens)
    }
}

pub fn render_layout(sequence: &[u32], tokens: &SpecialTokens) -> String {
    let valid = &sequence[..tokens.valid_len(sequence)];
    let mut lines = Vec::with_capacity(valid.len() / BLOCK_WIDTH + 1);

    for block in valid.chunks(BLOCK_WIDTH) {
        let token_str = |t: u32| {
            if t == tokens.mask { "_".to_string() } else { t.to_string() }
        };
        let mut line = token_str(block[0]);
        for pair in block[1..].chunks(GEOMETRY_WIDTH) {
            line.push_str(" |");
            for &t in pair {
                line.push(' ');
                line.push_str(&token_str(t));
            }
        }
        lines.push(line);
    }
    lines.join("\n")
}

impl Dataset<Vec<u32>> for LayoutDataset {
    fn get(&self, index: usize) -> Option<Vec<u32>> {
        self.sequences.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.sequences.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> LayoutDataset {
        let tokens = SpecialTokens::new(0, 1, 2);
        let seqs = vec![
            vec![5, 11, 12, 13, 16, 17, 18, 1, 0, 0],
            vec![6, 20, 21, 22, 23, 24, 25, 1, 0, 0],
            vec![7, 30, 31, 32, 33, 34, 35, 1, 0, 0],
        ];
        LayoutDataset::new(seqs, tokens, 10)
    }

    #[test]
    fn test_slice_is_clamped() {
        let ds = dataset();
        assert_eq!(ds.slice(1..10).len(), 2);
        assert!(ds.slice(100..120).is_empty());
    }

    #[test]
    fn test_vocab_covers_data_and_specials() {
        assert_eq!(dataset().vocab_size(), 36);
    }

    #[test]
    fn test_render_groups_blocks_and_geometry_pairs() {
        let ds = dataset();
        assert_eq!(ds.render(&ds.sequences()[0]), "5 | 11 12 | 13 16 | 17 18");
        assert_eq!(ds.render(&[5, 2, 2, 13, 16, 17, 18, 1]), "5 | _ _ | 13 16 | 17 18");
    }

    #[test]
    fn test_burn_dataset_access() {
        let ds = dataset();
        assert_eq!(Dataset::len(&ds), 3);
        assert_eq!(ds.get(2).map(|s| s[0]), Some(7));
        assert!(ds.get(3).is_none());
    }
}
