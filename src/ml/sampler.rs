// ============================================================
// Layer 5 — Qualitative Sampling
// ============================================================
// Periodic visual check of what the model reconstructs.
//
//   EvaluationSampler — takes a fixed slice of held-out layouts,
//                       masks the geometric slice of every block,
//                       asks the model for three reconstructions
//                       and renders all four sets for telemetry
//
//   refill            — backend-agnostic decoding loop; the model
//                       only supplies per-position probabilities
//
// Decoding modes:
//   single pass → every masked position filled from one forward
//   iterative   → one position per row fixed per forward pass,
//                 the most confident one first

use anyhow::{ensure, Result};
use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};
use std::ops::Range;

use crate::data::dataset::LayoutDataset;
use crate::domain::layout::MaskedBatch;
use crate::domain::traits::{DecodeConfig, SampleSet, Sampler};
use crate::ml::masking::MaskingEngine;

/// Rows of the evaluation set used for every sampling round.
pub const SAMPLE_ROWS: Range<usize> = 100..120;

/// Nucleus threshold for the stochastic reconstruction.
pub const SAMPLE_TOP_P: f64 = 0.95;

// ─── Token choice ─────────────────────────────────────────────────────────────
/// Pick a token from one probability row. Returns (token, its probability).
pub fn choose_token<R: Rng + ?Sized>(probs: &[f32], cfg: &DecodeConfig, rng: &mut R) -> (u32, f32) {
    let argmax = probs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, &p)| (i as u32, p))
        .unwrap_or((0, 0.0));
    if cfg.greedy {
        return argmax;
    }

    let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    if let Some(p) = cfg.top_p {
        let mut cumulative = 0.0f64;
        let mut keep       = 0;
        for &(_, prob) in &ranked {
            keep += 1;
            cumulative += f64::from(prob);
            if cumulative >= p {
                break;
            }
        }
        ranked.truncate(keep.max(1));
    }

    match WeightedIndex::new(ranked.iter().map(|&(_, prob)| prob.max(0.0))) {
        Ok(dist) => {
            let (token, prob) = ranked[dist.sample(rng)];
            (token as u32, prob)
        }
        Err(_) => argmax,
    }
}

// ─── Refill loop ──────────────────────────────────────────────────────────────
/// Fill every masked position of `batch`.
///
/// `probs_of` maps the current token rows to a flat probability buffer of
/// shape [rows, seq_len, vocab].
pub fn refill<R, F>(
    batch:    &MaskedBatch,
    cfg:      &DecodeConfig,
    rng:      &mut R,
    mut probs_of: F,
) -> Result<Vec<Vec<u32>>>
where
    R: Rng + ?Sized,
    F: FnMut(&[Vec<u32>]) -> Result<Vec<f32>>,
{
    let mut tokens  = batch.inputs.clone();
    let mut pending = batch.mask.clone();
    let seq_len     = batch.seq_len();

    while pending.iter().flatten().any(|&m| m) {
        let probs = probs_of(&tokens)?;
        let cells = tokens.len() * seq_len;
        ensure!(cells > 0 && probs.len() % cells == 0, "Probability buffer does not match batch shape");
        let vocab = probs.len() / cells;

        for (row, (row_tokens, row_pending)) in tokens.iter_mut().zip(pending.iter_mut()).enumerate() {
            let mut best: Option<(usize, u32, f32)> = None;
            for pos in 0..seq_len {
                if !row_pending[pos] {
                    continue;
                }
                let offset = (row * seq_len + pos) * vocab;
                let (token, conf) = choose_token(&probs[offset..offset + vocab], cfg, rng);
                if cfg.iterative {
                    if best.map_or(true, |(_, _, c)| conf > c) {
                        best = Some((pos, token, conf));
                    }
                } else {
                    row_tokens[pos]  = token;
                    row_pending[pos] = false;
                }
            }
            if let Some((pos, token, _)) = best {
                row_tokens[pos]  = token;
                row_pending[pos] = false;
            }
        }
    }

    Ok(tokens)
}

// ─── EvaluationSampler ────────────────────────────────────────────────────────
/// Builds the four render collections for one sampling round.
pub struct EvaluationSampler;

impl EvaluationSampler {
    pub fn run<M: Sampler>(
        model:   &mut M,
        dataset: &LayoutDataset,
        masking: &MaskingEngine,
        epoch:   usize,
    ) -> Result<SampleSet> {
        let rows = dataset.slice(SAMPLE_ROWS);
        if rows.is_empty() {
            tracing::debug!("No rows in {:?} to sample from", SAMPLE_ROWS);
            return Ok(SampleSet { epoch, ..SampleSet::default() });
        }

        let render_all = |seqs: &[Vec<u32>]| -> Vec<String> {
            seqs.iter().map(|s| dataset.render(s)).collect()
        };

        let masked = masking.mask_geometry(&rows);

        let recon         = model.sample(&masked, &DecodeConfig::single_pass_greedy())?;
        let sample_random = model.sample(&masked, &DecodeConfig::iterative_nucleus(SAMPLE_TOP_P))?;
        let sample_det    = model.sample(&masked, &DecodeConfig::iterative_greedy())?;

        Ok(SampleSet {
            epoch,
            input:         render_all(&rows),
            recon:         render_all(&recon),
            sample_random: render_all(&sample_random),
            sample_det:    render_all(&sample_det),
        })
    }
}
