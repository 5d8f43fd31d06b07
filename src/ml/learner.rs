// ============================================================
// Layer 5 — Burn Learner
// ============================================================
// Binds a LayoutTransformer to its optimizer and exposes it to
// the training loop through the domain traits.
//
//   forward_backward → shard losses on the autodiff backend,
//                      mean-reduced into one scalar, one backward
//   evaluate         → model.valid() on the inner backend
//   gradient scan    → NaN or ±inf in any float parameter gradient
//                      marks that parameter
//   apply_step       → global-norm clip, then the optimizer step
//   snapshots        → full-precision named MessagePack, gzipped
//
// Key Burn insight:
//   - Training uses B (Autodiff<..>) for gradients
//   - model.valid() returns the model on B::InnerBackend
//   - optim.step() consumes the module and returns the updated one

use anyhow::{anyhow, bail, Context, Result};
use burn::{
    module::{AutodiffModule, ModuleVisitor, Param},
    optim::{GradientsParams, Optimizer},
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Recorder},
    tensor::{activation, backend::AutodiffBackend},
};
use rand::{rngs::StdRng, SeedableRng};
use std::path::Path;

use crate::domain::layout::{MaskedBatch, SpecialTokens};
use crate::domain::traits::{DecodeConfig, LayoutModel, ParameterSnapshot, Sampler};
use crate::ml::model::LayoutTransformer;
use crate::ml::sampler::refill;

type SnapshotRecorder = NamedMpkGzFileRecorder<FullPrecisionSettings>;

pub struct LayoutLearner<B: AutodiffBackend, O> {
    model:  LayoutTransformer<B>,
    optim:  O,
    tokens: SpecialTokens,
    device: B::Device,
    rng:    StdRng,
    /// Ceiling on the global gradient norm; None leaves gradients as they are.
    grad_norm_clip: Option<f64>,
}

impl<B, O> LayoutLearner<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<LayoutTransformer<B>, B>,
{
    pub fn new(
        model:  LayoutTransformer<B>,
        optim:  O,
        tokens: SpecialTokens,
        device: B::Device,
        seed:   u64,
    ) -> Self {
        Self {
            model, optim, tokens, device,
            rng:            StdRng::seed_from_u64(seed),
            grad_norm_clip: None,
        }
    }

    pub fn with_grad_norm_clip(mut self, max_norm: f64) -> Self {
        self.grad_norm_clip = Some(max_norm);
        self
    }
}

#[cfg(test)]
impl<B: AutodiffBackend, O> LayoutLearner<B, O> {
    pub fn model(&self) -> &LayoutTransformer<B> {
        &self.model
    }
}

// ─── Tensor helpers ───────────────────────────────────────────────────────────

fn token_tensor<B: Backend>(rows: &[Vec<u32>], device: &B::Device) -> Tensor<B, 2, Int> {
    let shape = [rows.len(), rows.first().map_or(0, Vec::len)];
    let flat: Vec<i64> = rows.iter().flatten().map(|&t| i64::from(t)).collect();
    Tensor::from_data(TensorData::new(flat, shape), device)
}

fn weight_tensor<B: Backend>(mask: &[Vec<bool>], device: &B::Device) -> Tensor<B, 2> {
    let shape = [mask.len(), mask.first().map_or(0, Vec::len)];
    let flat: Vec<f32> = mask.iter().flatten().map(|&m| if m { 1.0 } else { 0.0 }).collect();
    Tensor::from_data(TensorData::new(flat, shape), device)
}

fn to_f64s<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f64>> {
    tensor
        .into_data()
        .convert::<f64>()
        .to_vec::<f64>()
        .map_err(|e| anyhow!("Cannot read tensor data: {e:?}"))
}

/// One loss per shard, stacked into a [shards] tensor.
fn shard_losses<B: Backend>(
    model:    &LayoutTransformer<B>,
    batch:    &MaskedBatch,
    replicas: usize,
    pad:      u32,
    device:   &B::Device,
) -> Result<Tensor<B, 1>> {
    let shards = batch.shards(replicas);
    if shards.is_empty() {
        bail!("Cannot compute a loss for an empty batch");
    }

    let losses: Vec<Tensor<B, 1>> = shards
        .iter()
        .map(|shard| {
            let inputs   = token_tensor::<B>(&shard.inputs, device);
            let targets  = token_tensor::<B>(&shard.targets, device);
            let weights  = weight_tensor::<B>(&shard.mask, device);
            let pad_mask = inputs.clone().equal_elem(i64::from(pad));
            model.masked_loss(inputs, targets, weights, pad_mask)
        })
        .collect();

    Ok(Tensor::cat(losses, 0))
}

// ─── Gradient health ──────────────────────────────────────────────────────────
// Both checks read the raw gradients, before any clipping.
//
//   NaN   → is_nan().any() over the tensor
//   ±inf  → abs().max() is infinite
//
// Values are tested directly. A squared sum would overflow to inf in
// f32 for large but finite gradients, which clipping is meant to handle.

fn has_nan<B: Backend, const D: usize>(grad: Tensor<B, D>) -> bool {
    grad.is_nan().any().int().into_scalar().elem::<i64>() > 0
}

/// Largest absolute value in the tensor, read back as f64.
fn max_abs<B: Backend, const D: usize>(grad: Tensor<B, D>) -> f64 {
    grad.abs().max().into_scalar().elem::<f64>()
}

struct NonFiniteScan<'a> {
    grads:   &'a GradientsParams,
    flagged: Vec<String>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for NonFiniteScan<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let Some(grad) = self.grads.get::<B::InnerBackend, D>(param.id) else {
            return;
        };
        if has_nan(grad.clone()) || max_abs(grad).is_infinite() {
            self.flagged.push(param.id.to_string());
        }
    }
}

/// Ids of every parameter of `module` whose gradient holds NaN or ±inf.
pub fn non_finite_params<B, M>(module: &M, grads: &GradientsParams) -> Vec<String>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut scan = NonFiniteScan { grads, flagged: Vec::new() };
    module.visit(&mut scan);
    scan.flagged
}

// ─── Global-norm clipping ─────────────────────────────────────────────────────
// Burn's GradientClippingConfig::Norm clips every tensor on its own.
// The ceiling here applies to the whole gradient set:
//
//   norm  = sqrt( Σ_params ‖g‖² )
//   scale = clip / (norm + eps)     only when norm > clip
//   g     = g * scale               for every parameter
//
// Each tensor norm is taken on g / max|g| and rescaled in f64, so
// large gradients do not overflow f32 on the way.

const CLIP_EPS: f64 = 1e-6;

struct GradNormScan<'a> {
    grads:  &'a GradientsParams,
    sum_sq: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradNormScan<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let Some(grad) = self.grads.get::<B::InnerBackend, D>(param.id) else {
            return;
        };
        let peak = max_abs(grad.clone());
        if peak == 0.0 {
            return;
        }
        let unit = grad.div_scalar(peak);
        let ss: f64 = (unit.clone() * unit).sum().into_scalar().elem::<f64>();
        self.sum_sq += peak * peak * ss;
    }
}

struct GradScale<'a> {
    grads:  &'a mut GradientsParams,
    factor: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradScale<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(param.id) {
            self.grads.register::<B::InnerBackend, D>(param.id, grad.mul_scalar(self.factor));
        }
    }
}

/// Global L2 norm of every gradient that belongs to `module`.
pub fn global_grad_norm<B, M>(module: &M, grads: &GradientsParams) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut scan = GradNormScan { grads, sum_sq: 0.0 };
    module.visit(&mut scan);
    scan.sum_sq.sqrt()
}

/// Scale all gradients so their global norm does not exceed `max_norm`.
/// Returns the norm measured before scaling.
pub fn clip_global_norm<B, M>(module: &M, grads: &mut GradientsParams, max_norm: f64) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let norm = global_grad_norm::<B, M>(module, grads);
    if norm > max_norm {
        let mut scale = GradScale { grads, factor: max_norm / (norm + CLIP_EPS) };
        module.visit(&mut scale);
    }
    norm
}

// ─── Domain trait implementations ─────────────────────────────────────────────

impl<B, O> LayoutModel for LayoutLearner<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<LayoutTransformer<B>, B>,
{
    type Gradients = GradientsParams;

    fn forward_backward(&self, batch: &MaskedBatch, replicas: usize) -> Result<(Vec<f64>, GradientsParams)> {
        let per_replica = shard_losses(&self.model, batch, replicas, self.tokens.pad, &self.device)?;
        let values      = to_f64s(per_replica.clone())?;

        let grads = per_replica.mean().backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        Ok((values, grads))
    }

    fn evaluate(&self, batch: &MaskedBatch, replicas: usize) -> Result<Vec<f64>> {
        let model = self.model.valid();
        let losses = shard_losses(&model, batch, replicas, self.tokens.pad, &self.device)?;
        to_f64s(losses)
    }

    fn non_finite_gradients(&self, grads: &GradientsParams) -> Vec<String> {
        non_finite_params::<B, _>(&self.model, grads)
    }

    fn apply_step(&mut self, lr: f64, mut grads: GradientsParams) {
        if let Some(max_norm) = self.grad_norm_clip {
            let norm = clip_global_norm::<B, _>(&self.model, &mut grads, max_norm);
            if norm > max_norm {
                tracing::debug!("Clipped gradient norm {:.4} to {}", norm, max_norm);
            }
        }
        self.model = self.optim.step(lr, self.model.clone(), grads);
    }
}

impl<B, O> ParameterSnapshot for LayoutLearner<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<LayoutTransformer<B>, B>,
{
    fn save_parameters(&self, path: &Path) -> Result<()> {
        SnapshotRecorder::new()
            .record(self.model.clone().into_record(), path.to_path_buf())
            .with_context(|| format!("Failed to save parameters to '{}'", path.display()))
    }

    fn load_parameters(&mut self, path: &Path) -> Result<()> {
        let record = SnapshotRecorder::new()
            .load(path.to_path_buf(), &self.device)
            .with_context(|| format!("Cannot load parameters from '{}'", path.display()))?;
        self.model = self.model.clone().load_record(record);
        Ok(())
    }
}

impl<B, O> Sampler for LayoutLearner<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<LayoutTransformer<B>, B>,
{
    fn sample(&mut self, batch: &MaskedBatch, config: &DecodeConfig) -> Result<Vec<Vec<u32>>> {
        let model  = self.model.valid();
        let device = self.device.clone();
        let pad    = self.tokens.pad;
        let temperature = config.temperature.max(1e-6);

        refill(batch, config, &mut self.rng, |rows| {
            let tokens   = token_tensor::<B::InnerBackend>(rows, &device);
            let pad_mask = tokens.clone().equal_elem(i64::from(pad));
            let logits   = model.forward(tokens, pad_mask).div_scalar(temperature);
            activation::softmax(logits, 2)
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| anyhow!("Cannot read probabilities: {e:?}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::masking::MaskingEngine;
    use crate::ml::model::LayoutTransformerConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamWConfig;

    type TestBackend = Autodiff<NdArray>;

    const TOKENS: SpecialTokens = SpecialTokens { pad: 0, eos: 1, mask: 2 };

    fn learner() -> LayoutLearner<TestBackend, impl Optimizer<LayoutTransformer<TestBackend>, TestBackend>> {
        let device = Default::default();
        let model: LayoutTransformer<TestBackend> =
            LayoutTransformerConfig::new(24, 15, 8, 2, 1, 16, 0.0).init(&device);
        let optim = AdamWConfig::new().init::<TestBackend, LayoutTransformer<TestBackend>>();
        LayoutLearner::new(model, optim, TOKENS, device, 0)
    }

    /// Two free parameters whose gradients the tests set by hand.
    #[derive(Module, Debug)]
    struct Pair<B: Backend> {
        a: Param<Tensor<B, 1>>,
        b: Param<Tensor<B, 1>>,
    }

    fn pair() -> Pair<TestBackend> {
        let device = Default::default();
        Pair {
            a: Param::from_tensor(Tensor::zeros([2], &device)),
            b: Param::from_tensor(Tensor::zeros([2], &device)),
        }
    }

    fn grads_for(p: &Pair<TestBackend>, a: [f32; 2], b: [f32; 2]) -> GradientsParams {
        let device = Default::default();
        let mut grads = GradientsParams::new();
        grads.register::<NdArray, 1>(p.a.id, Tensor::from_floats(a, &device));
        grads.register::<NdArray, 1>(p.b.id, Tensor::from_floats(b, &device));
        grads
    }

    fn grad_of(grads: &GradientsParams, param: &Param<Tensor<TestBackend, 1>>) -> Vec<f32> {
        grads
            .get::<NdArray, 1>(param.id)
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    fn batch() -> MaskedBatch {
        let rows = vec![
            vec![5, 10, 11, 12, 13, 14, 15, 1, 0, 0, 0, 0, 0, 0, 0],
            vec![6, 16, 17, 18, 19, 20, 21, 7, 10, 11, 12, 13, 14, 15, 1],
            vec![5, 12, 13, 14, 15, 16, 17, 1, 0, 0, 0, 0, 0, 0, 0],
        ];
        MaskingEngine::new(TOKENS, 1).mask_batch(&rows, 0.5)
    }

    #[test]
    fn test_one_loss_per_replica() {
        let l = learner();
        let (losses, _) = l.forward_backward(&batch(), 2).unwrap();
        assert_eq!(losses.len(), 2);
        assert!(losses.iter().all(|v| v.is_finite()));
        assert_eq!(l.evaluate(&batch(), 1).unwrap().len(), 1);
    }

    #[test]
    fn test_healthy_gradients_pass_scan_and_step_changes_params() {
        let mut l = learner();
        let (_, grads) = l.forward_backward(&batch(), 1).unwrap();
        assert!(l.non_finite_gradients(&grads).is_empty());

        let before = l.model().lm_head.weight.val().into_data();
        l.apply_step(1e-2, grads);
        let after = l.model().lm_head.weight.val().into_data();
        assert_ne!(before, after);
    }

    #[test]
    fn test_sampling_keeps_unmasked_positions() {
        let mut l   = learner();
        let masked  = batch();
        let out     = l.sample(&masked, &DecodeConfig::iterative_nucleus(0.95)).unwrap();
        assert_eq!(out.len(), masked.rows());
        for ((row, mask), target) in out.iter().zip(&masked.mask).zip(&masked.targets) {
            assert_eq!(row.len(), target.len());
            for ((&t, &m), &orig) in row.iter().zip(mask).zip(target) {
                if !m {
                    assert_eq!(t, orig);
                }
                assert!((t as usize) < 24);
            }
        }
    }

    #[test]
    fn test_clip_scales_whole_gradient_set() {
        let p = pair();
        let mut grads = grads_for(&p, [0.6, 0.8], [0.8, 0.6]);

        let norm = clip_global_norm::<TestBackend, _>(&p, &mut grads, 1.0);
        assert!((norm - 2f64.sqrt()).abs() < 1e-6);

        let scale = 1.0 / 2f32.sqrt();
        for (got, want) in grad_of(&grads, &p.a).iter().zip([0.6 * scale, 0.8 * scale]) {
            assert!((got - want).abs() < 1e-4, "{got} vs {want}");
        }
        for (got, want) in grad_of(&grads, &p.b).iter().zip([0.8 * scale, 0.6 * scale]) {
            assert!((got - want).abs() < 1e-4, "{got} vs {want}");
        }
        assert!((global_grad_norm::<TestBackend, _>(&p, &grads) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_clip_leaves_small_gradients_alone() {
        let p = pair();
        let mut grads = grads_for(&p, [0.3, 0.4], [0.0, 0.0]);
        let norm = clip_global_norm::<TestBackend, _>(&p, &mut grads, 1.0);
        assert!((norm - 0.5).abs() < 1e-6);
        assert_eq!(grad_of(&grads, &p.a), vec![0.3, 0.4]);
    }

    #[test]
    fn test_large_finite_gradient_is_healthy_and_clipped() {
        let p = pair();
        let mut grads = grads_for(&p, [1.0e20, -1.0e20], [1.0, 1.0]);
        assert!(non_finite_params::<TestBackend, _>(&p, &grads).is_empty());

        clip_global_norm::<TestBackend, _>(&p, &mut grads, 1.0);
        assert!(grad_of(&grads, &p.a).iter().all(|g| g.is_finite() && g.abs() <= 1.0));
    }

    #[test]
    fn test_nan_and_inf_gradients_are_flagged() {
        let p = pair();
        let grads = grads_for(&p, [f32::NAN, 0.0], [0.0, f32::INFINITY]);
        let flagged = non_finite_params::<TestBackend, _>(&p, &grads);
        assert_eq!(flagged, vec![p.a.id.to_string(), p.b.id.to_string()]);
    }
}
