// ============================================================
// Layer 5 — Masking Engine
// ============================================================
// Turns a batch of token sequences into masked training examples.
//
// Three calling modes:
//
//   mask_batch        — stochastic, rate-driven (training)
//   mask_batch_seeded — same draw under a fixed seed, with the
//                       engine's own RNG restored afterwards
//                       (held-out loss passes)
//   mask_geometry     — deterministic geometric slice, rate-free
//                       (qualitative sampling)
//
// Stochastic masking, per sequence:
//   1. maskable = positions holding neither pad nor eos
//   2. target   = ceil(count(maskable) * mask_rate)
//   3. score every maskable position with U[0,1), every other
//      position with 2.0, then append one sentinel scored -1.0
//      so that index `target` is always inside the sorted array
//   4. cutoff = sorted[target]; a cutoff of 2.0 is clamped to 1.0
//   5. mask position i iff maskable(i) && score(i) <= cutoff
//
// The lookup uses the raw target as the index. With the -1.0
// sentinel sitting at index 0 this masks `target` positions when
// scores are distinct; ties at the cutoff can add more.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::domain::layout::{MaskedBatch, SpecialTokens, BLOCK_WIDTH};

/// Seed forced for reproducible (non-training) stochastic masking.
pub const FIXED_MASK_SEED: u64 = 0;

/// Score given to positions that can never be masked.
const UNMASKABLE_SCORE: f64 = 2.0;

/// Score of the extra sentinel appended before sorting.
const SENTINEL_SCORE: f64 = -1.0;

/// Offsets within each element block masked in evaluation mode.
const GEOMETRY_SLICE: [usize; 2] = [1, 2];

/// Mask one sequence with the stochastic algorithm.
/// Returns (masked tokens, mask indicator).
pub fn mask_sequence<R: Rng + ?Sized>(
    sequence:  &[u32],
    tokens:    &SpecialTokens,
    mask_rate: f64,
    rng:       &mut R,
) -> (Vec<u32>, Vec<bool>) {
    let maskable: Vec<bool> = sequence.iter().map(|&t| tokens.is_maskable(t)).collect();
    let count  = maskable.iter().filter(|&&m| m).count();
    let target = (count as f64 * mask_rate).ceil().max(0.0) as usize;

    // Every position draws, so the stream advances by the sequence
    // length regardless of content.
    let scores: Vec<f64> = maskable
        .iter()
        .map(|&m| {
            let u: f64 = rng.gen();
            if m { u } else { UNMASKABLE_SCORE }
        })
        .collect();

    let mut sorted = Vec::with_capacity(scores.len() + 1);
    sorted.extend_from_slice(&scores);
    sorted.push(SENTINEL_SCORE);
    sorted.sort_by(f64::total_cmp);

    let mut cutoff = sorted[target.min(sorted.len() - 1)];
    if cutoff == UNMASKABLE_SCORE {
        cutoff = 1.0;
    }

    let mask: Vec<bool> = maskable
        .iter()
        .zip(&scores)
        .map(|(&m, &score)| m && score <= cutoff)
        .collect();

    let masked = sequence
        .iter()
        .zip(&mask)
        .map(|(&t, &m)| if m { tokens.mask } else { t })
        .collect();

    (masked, mask)
}

/// Mask the fixed geometric slice (block offsets 1 and 2) of every element
/// block before the first eos. Does not depend on any mask rate.
pub fn mask_geometry_sequence(sequence: &[u32], tokens: &SpecialTokens) -> (Vec<u32>, Vec<bool>) {
    let valid_len = tokens.valid_len(sequence);

    let mask: Vec<bool> = (0..sequence.len())
        .map(|i| i < valid_len && GEOMETRY_SLICE.contains(&(i % BLOCK_WIDTH)))
        .collect();

    let masked = sequence
        .iter()
        .zip(&mask)
        .map(|(&t, &m)| if m { tokens.mask } else { t })
        .collect();

    (masked, mask)
}

// ─── MaskingEngine ────────────────────────────────────────────────────────────
/// Owns the special tokens and the random stream used for masking draws.
pub struct MaskingEngine {
    tokens: SpecialTokens,
    rng:    StdRng,
}

impl MaskingEngine {
    pub fn new(tokens: SpecialTokens, seed: u64) -> Self {
        Self { tokens, rng: StdRng::seed_from_u64(seed) }
    }

    /// Training-mode masking: each row is masked independently at `mask_rate`.
    pub fn mask_batch(&mut self, batch: &[Vec<u32>], mask_rate: f64) -> MaskedBatch {
        let mut inputs = Vec::with_capacity(batch.len());
        let mut mask   = Vec::with_capacity(batch.len());
        for sequence in batch {
            let (masked, indicator) = mask_sequence(sequence, &self.tokens, mask_rate, &mut self.rng);
            inputs.push(masked);
            mask.push(indicator);
        }
        MaskedBatch { inputs, targets: batch.to_vec(), mask }
    }

    /// Stochastic masking under FIXED_MASK_SEED. The engine's random stream
    /// is the same afterwards as it was before the call.
    pub fn mask_batch_seeded(&mut self, batch: &[Vec<u32>], mask_rate: f64) -> MaskedBatch {
        let mut scoped = SeedGuard::fixed(self, FIXED_MASK_SEED);
        scoped.mask_batch(batch, mask_rate)
    }

    /// Evaluation-mode masking: geometric slice of every block.
    pub fn mask_geometry(&self, batch: &[Vec<u32>]) -> MaskedBatch {
        let (inputs, mask) = batch
            .iter()
            .map(|sequence| mask_geometry_sequence(sequence, &self.tokens))
            .unzip();
        MaskedBatch { inputs, targets: batch.to_vec(), mask }
    }

    /// Fresh U[0,1) draw from the engine's stream.
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen()
    }
}

// ─── SeedGuard ────────────────────────────────────────────────────────────────
/// Swaps a fixed-seed stream into the engine for its lifetime and puts the
/// saved stream back on drop, on every exit path.
struct SeedGuard<'a> {
    engine: &'a mut MaskingEngine,
    saved:  Option<StdRng>,
}

impl<'a> SeedGuard<'a> {
    fn fixed(engine: &'a mut MaskingEngine, seed: u64) -> Self {
        let saved = std::mem::replace(&mut engine.rng, StdRng::seed_from_u64(seed));
        Self { engine, saved: Some(saved) }
    }
}

impl std::ops::Deref for SeedGuard<'_> {
    type Target = MaskingEngine;

    fn deref(&self) -> &MaskingEngine {
        &*self.engine
    }
}

impl std::ops::DerefMut for SeedGuard<'_> {
    fn deref_mut(&mut self) -> &mut MaskingEngine {
        &mut *self.engine
    }
}

impl Drop for SeedGuard<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.engine.rng = saved;
        }
    }
}
