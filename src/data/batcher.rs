// ============================================================
// Layer 4 — Layout Batcher
// ============================================================
// Implements Burn's Batcher trait so a LayoutDataset can be fed
// through Burn's DataLoader.
//
// What does this Batcher produce?
//   Unlike a tensor batcher, it hands back the raw token rows:
//
//   Input:  Vec of N sequences, each of length S
//   Output: Vec<Vec<u32>> of shape [N][S], still on the host
//
// Why keep rows on the host?
//   Masking draws per-position random scores and needs the token
//   values themselves. The masked batch is turned into tensors
//   later, inside the learner, on whichever device it trains on.
//   The loader's backend parameter is therefore only a formality,
//   and the CPU backend is used for it.
//
// Loaders built here:
//   train_loader → shuffled with a seed; each pass draws a new order,
//                  the same sequence of orders for the same seed
//   eval_loader  → dataset order
//
// One worker thread prefetches batches while the loop trains.
// A single worker keeps the batch order reproducible.
//
// Reference: Burn Book §4 (Batcher, DataLoader)

use std::sync::Arc;

use burn::{
    backend::NdArray,
    data::dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
    prelude::*,
};

use crate::data::dataset::LayoutDataset;

/// Backend named by the row loaders. Rows never become tensors here.
pub type HostBackend = NdArray;

/// A batch of padded token rows, one inner Vec per layout.
pub type RowBatch = Vec<Vec<u32>>;

/// Shared handle to a Burn DataLoader yielding row batches.
pub type RowLoader = Arc<dyn DataLoader<HostBackend, RowBatch>>;

// ─── LayoutBatcher ────────────────────────────────────────────────────────────
/// Stateless batcher: the DataLoader decides which rows go together,
/// this only collects them.
#[derive(Clone, Debug, Default)]
pub struct LayoutBatcher;

impl<B: Backend> Batcher<B, Vec<u32>, RowBatch> for LayoutBatcher {
    fn batch(&self, items: Vec<Vec<u32>>, _device: &B::Device) -> RowBatch {
        items
    }
}

// ─── Loaders ──────────────────────────────────────────────────────────────────

/// Training loader: shuffled under `seed`, last partial batch kept.
pub fn train_loader(dataset: LayoutDataset, batch_size: usize, seed: u64) -> RowLoader {
    DataLoaderBuilder::<HostBackend, Vec<u32>, RowBatch>::new(LayoutBatcher)
        .batch_size(batch_size.max(1))
        .shuffle(seed)
        .num_workers(1)
        .build(dataset)
}

/// Evaluation loader: dataset order, last partial batch kept.
pub fn eval_loader(dataset: LayoutDataset, batch_size: usize) -> RowLoader {
    DataLoaderBuilder::<HostBackend, Vec<u32>, RowBatch>::new(LayoutBatcher)
        .batch_size(batch_size.max(1))
        .num_workers(1)
        .build(dataset)
}
