// ============================================================
// Layer 4 — Train/Validation Splitter
// ============================================================
// Shuffles layouts with a seeded RNG and splits them into a
// training set and a held-out set for checkpoint selection.
// Only used when no separate evaluation file is supplied.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// Shuffle `samples` with `seed` and split into (train, validation).
///
/// `train_fraction` = 0.8 keeps 80% for training. The split index is
/// clamped so tiny inputs never panic.
pub fn split_train_val<T>(mut samples: Vec<T>, train_fraction: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    let mut rng = StdRng::seed_from_u64(seed);
    samples.shuffle(&mut rng);

    let total    = samples.len();
    let split_at = ((total as f64) * train_fraction).round() as usize;
    let split_at = split_at.min(total);

    let val = samples.split_off(split_at);

    tracing::debug!(
        "Dataset split: {} training, {} validation",
        samples.len(),
        val.len(),
    );

    (samples, val)
}
