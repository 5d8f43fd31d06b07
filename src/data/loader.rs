// ============================================================
// Layer 4 — Layout File Loader
// ============================================================
// Reads a JSON layout file of the form:
//
//   {
//     "pad_token": 0, "eos_token": 1, "mask_token": 2,
//     "max_length": 50,                 ← optional
//     "sequences": [[5, 11, 12, ...], ...]
//   }
//
// Every sequence is right-padded with pad_token up to max_length
// (or the longest sequence when max_length is absent). A sequence
// longer than max_length is an error; nothing is silently cut.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::data::dataset::LayoutDataset;
use crate::domain::layout::SpecialTokens;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutFile {
    pub pad_token:  u32,
    pub eos_token:  u32,
    pub mask_token: u32,
    #[serde(default)]
    pub max_length: Option<usize>,
    pub sequences:  Vec<Vec<u32>>,
}

impl LayoutFile {
    /// Pad every sequence and wrap them in a LayoutDataset.
    pub fn into_dataset(self) -> Result<LayoutDataset> {
        let tokens  = SpecialTokens::new(self.pad_token, self.eos_token, self.mask_token);
        let longest = self.sequences.iter().map(Vec::len).max().unwrap_or(0);
        let max_len = self.max_length.unwrap_or(longest);

        let mut sequences = self.sequences;
        for (i, seq) in sequences.iter_mut().enumerate() {
            if seq.len() > max_len {
                bail!("Sequence {} has {} tokens, more than max_length {}", i, seq.len(), max_len);
            }
            seq.resize(max_len, tokens.pad);
        }

        Ok(LayoutDataset::new(sequences, tokens, max_len))
    }
}

/// Load a layout dataset from a JSON file.
pub fn load_layouts(path: impl AsRef<Path>) -> Result<LayoutDataset> {
    let path = path.as_ref();
    let json = fs::read_to_string(path)
        .with_context(|| format!("Cannot read layout file '{}'", path.display()))?;
    let file: LayoutFile = serde_json::from_str(&json)
        .with_context(|| format!("Malformed layout file '{}'", path.display()))?;

    let dataset = file.into_dataset()?;
    tracing::info!(
        "Loaded {} layouts (max_len={}) from '{}'",
        dataset.sequences().len(),
        dataset.max_len(),
        path.display()
    );
    Ok(dataset)
}
