// ============================================================
// Layer 3 — Collaborator Traits
// ============================================================
// The training loop is written against these traits only:
//
//   LayoutModel        → forward/backward, gradient scan, update
//   ParameterSnapshot  → write/read the canonical parameter set
//   Sampler            → reconstruct masked batches for inspection
//   TelemetrySink      → per-iteration scalar emission
//   ContinuationPolicy → operator decision at epoch exhaustion
//
// The Burn-backed implementations live in the ml and infra
// layers; tests drive the loop with small in-memory stand-ins.

use anyhow::Result;
use std::path::Path;

use crate::domain::continuation::ContinuationDecision;
use crate::domain::layout::MaskedBatch;

// ─── LayoutModel ──────────────────────────────────────────────────────────────
/// The trainable model plus its optimizer.
pub trait LayoutModel {
    /// Gradient set produced by one backward pass.
    type Gradients;

    /// Forward the masked batch against its targets with gradients enabled
    /// and backpropagate. The batch rows are partitioned into `replicas`
    /// shards; the returned vector holds one loss per shard.
    fn forward_backward(
        &self,
        batch:    &MaskedBatch,
        replicas: usize,
    ) -> Result<(Vec<f64>, Self::Gradients)>;

    /// Per-shard losses with gradients disabled.
    fn evaluate(&self, batch: &MaskedBatch, replicas: usize) -> Result<Vec<f64>>;

    /// Identifiers of every parameter whose gradient holds a non-finite value.
    fn non_finite_gradients(&self, grads: &Self::Gradients) -> Vec<String>;

    /// Apply one optimizer step at learning rate `lr`.
    /// Gradients are clipped to the configured global norm first.
    fn apply_step(&mut self, lr: f64, grads: Self::Gradients);
}

// ─── ParameterSnapshot ────────────────────────────────────────────────────────
/// Anything whose parameter values can be written to and restored from disk.
/// Optimizer state is never part of a snapshot.
pub trait ParameterSnapshot {
    fn save_parameters(&self, path: &Path) -> Result<()>;

    fn load_parameters(&mut self, path: &Path) -> Result<()>;
}

// ─── Sampler ──────────────────────────────────────────────────────────────────
/// Decoding options for reconstructing masked positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeConfig {
    pub temperature: f64,
    /// Nucleus threshold; None keeps the whole distribution.
    pub top_p:       Option<f64>,
    /// Take the arg-max instead of sampling.
    pub greedy:      bool,
    /// Refill one position per row per forward pass instead of all at once.
    pub iterative:   bool,
}

impl DecodeConfig {
    pub fn single_pass_greedy() -> Self {
        Self { temperature: 1.0, top_p: None, greedy: true, iterative: false }
    }

    pub fn iterative_nucleus(p: f64) -> Self {
        Self { temperature: 1.0, top_p: Some(p), greedy: false, iterative: true }
    }

    pub fn iterative_greedy() -> Self {
        Self { temperature: 1.0, top_p: None, greedy: true, iterative: true }
    }
}

pub trait Sampler {
    /// Return `batch.inputs` with every masked position filled in.
    fn sample(&mut self, batch: &MaskedBatch, config: &DecodeConfig) -> Result<Vec<Vec<u32>>>;
}

// ─── TelemetrySink ────────────────────────────────────────────────────────────
/// One optimizer step's scalars.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainStepRecord {
    pub loss:      f64,
    pub lr:        f64,
    pub epoch:     usize,
    pub mask_rate: f64,
}

/// Summary of one evaluation pass. The first and last batches sit at the
/// low and high ends of the mask-rate ramp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalPassRecord {
    pub mean_loss:        f64,
    pub first_batch_loss: f64,
    pub last_batch_loss:  f64,
}

/// Rendered layouts from one qualitative sampling round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSet {
    pub epoch:         usize,
    pub input:         Vec<String>,
    pub recon:         Vec<String>,
    pub sample_random: Vec<String>,
    pub sample_det:    Vec<String>,
}

pub trait TelemetrySink {
    fn log_train_step(&mut self, iteration: u64, record: &TrainStepRecord) -> Result<()>;

    fn log_eval_pass(&mut self, iteration: u64, record: &EvalPassRecord) -> Result<()>;

    fn log_samples(&mut self, iteration: u64, samples: &SampleSet) -> Result<()>;
}

// ─── ContinuationPolicy ───────────────────────────────────────────────────────
/// Decides whether to keep training once `epoch` reaches the maximum.
pub trait ContinuationPolicy {
    fn decide(&mut self, epoch: usize) -> Result<ContinuationDecision>;
}
