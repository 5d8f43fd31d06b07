// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates a full training run in order:
//
//   Step 1: Load training layouts            (Layer 4 - data)
//   Step 2: Load or split the held-out set   (Layer 4 - data)
//   Step 3: Build model + optimizer          (Layer 5 - ml)
//   Step 4: Save config, restore checkpoint  (Layer 6 - infra)
//   Step 5: Run the training loop            (Layer 5 - ml)

use anyhow::Result;
use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};
use serde::{Deserialize, Serialize};

use crate::data::{dataset::LayoutDataset, loader::load_layouts, splitter::split_train_val};
use crate::domain::{replication::ModelHandle, traits::ContinuationPolicy};
use crate::infra::{checkpoint::CheckpointManager, metrics::MetricsLogger};
use crate::ml::{
    learner::LayoutLearner,
    model::{optimizer_config, LayoutTransformer, LayoutTransformerConfig},
    trainer::Trainer,
};

type MyBackend = Autodiff<Wgpu>;

// ─── Training Configuration ──────────────────────────────────────────────────
// Every hyper-parameter of a run. Written to train_config.json
// next to the checkpoints before training starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    // data
    pub train_data:      String,
    pub eval_data:       Option<String>,
    pub val_fraction:    f64,
    pub checkpoint_dir:  String,
    pub samples_dir:     Option<String>,
    pub load:            Option<String>,

    // optimisation
    pub max_epochs:      usize,
    pub batch_size:      usize,
    pub learning_rate:   f64,
    pub beta1:           f64,
    pub beta2:           f64,
    pub grad_norm_clip:  f64,
    pub weight_decay:    f64,
    pub lr_decay:        bool,
    pub warmup_iters:    u64,
    pub final_iters:     u64,

    // masking
    pub start_mask_rate: f64,
    pub end_mask_rate:   f64,

    // loop
    pub sample_every:    usize,
    pub log_every:       usize,
    pub replicas:        usize,
    pub seed:            u64,

    // model
    pub d_model:         usize,
    pub num_heads:       usize,
    pub num_layers:      usize,
    pub d_ff:            usize,
    pub dropout:         f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_data:      "data/train.json".to_string(),
            eval_data:       None,
            val_fraction:    0.0,
            checkpoint_dir:  "checkpoints".to_string(),
            samples_dir:     None,
            load:            None,

            max_epochs:      10,
            batch_size:      64,
            learning_rate:   3e-4,
            beta1:           0.9,
            beta2:           0.98,
            grad_norm_clip:  1.0,
            weight_decay:    0.1,
            lr_decay:        true,
            warmup_iters:    5000,
            final_iters:     25000,

            start_mask_rate: 0.15,
            end_mask_rate:   0.7,

            sample_every:    1,
            log_every:       50,
            replicas:        1,
            seed:            42,

            d_model:         256,
            num_heads:       8,
            num_layers:      6,
            d_ff:            1024,
            dropout:         0.1,
        }
    }
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Execute the full training run. The continuation policy decides what
    /// happens once the epoch budget is spent.
    pub fn execute(&self, continuation: Box<dyn ContinuationPolicy>) -> Result<()> {
        let cfg = &self.config;

        // ── Step 1 + 2: datasets ──────────────────────────────────────────────
        let (train_set, eval_set) = self.load_datasets()?;
        tracing::info!(
            "Training on {} layouts, {} held out",
            train_set.sequences().len(),
            eval_set.as_ref().map_or(0, |d| d.sequences().len()),
        );

        // ── Step 3: model + optimizer ─────────────────────────────────────────
        let device = WgpuDevice::default();
        tracing::info!("Using WGPU device: {:?}", device);

        let vocab_size = eval_set
            .as_ref()
            .map_or(0, LayoutDataset::vocab_size)
            .max(train_set.vocab_size());
        let max_seq_len = eval_set
            .as_ref()
            .map_or(0, LayoutDataset::max_len)
            .max(train_set.max_len());

        let model_cfg = LayoutTransformerConfig::new(
            vocab_size, max_seq_len, cfg.d_model,
            cfg.num_heads, cfg.num_layers, cfg.d_ff, cfg.dropout,
        );
        let model: LayoutTransformer<MyBackend> = model_cfg.init(&device);
        let optim = optimizer_config(cfg).init::<MyBackend, LayoutTransformer<MyBackend>>();
        tracing::info!(
            "Model ready: {} layers, d_model={}, vocab={}",
            cfg.num_layers, cfg.d_model, vocab_size
        );

        let learner = LayoutLearner::new(model, optim, train_set.tokens(), device, cfg.seed)
            .with_grad_norm_clip(cfg.grad_norm_clip);
        let mut handle = ModelHandle::new(learner, cfg.replicas);
        if handle.is_replicated() {
            tracing::info!("Splitting every batch across {} replicas", handle.replicas());
        }

        // ── Step 4: persistence ───────────────────────────────────────────────
        let checkpoints = CheckpointManager::new(&cfg.checkpoint_dir)?;
        checkpoints.save_config(cfg)?;
        if let Some(name) = &cfg.load {
            checkpoints.load(&mut handle, name)?;
        }

        let telemetry = MetricsLogger::new(
            &cfg.checkpoint_dir,
            cfg.samples_dir.as_ref().map(Into::into),
        )?;

        // ── Step 5: train ─────────────────────────────────────────────────────
        let mut trainer = Trainer::new(
            handle,
            train_set,
            eval_set,
            cfg.clone(),
            checkpoints,
            Box::new(telemetry),
            continuation,
        );
        let summary = trainer.train()?;
        tracing::info!(
            "Training finished after {} epochs, {} iterations, best held-out loss {:.5}",
            summary.epochs, summary.iterations, summary.best_loss,
        );
        Ok(())
    }

    fn load_datasets(&self) -> Result<(LayoutDataset, Option<LayoutDataset>)> {
        let cfg   = &self.config;
        let train = load_layouts(&cfg.train_data)?;

        if let Some(path) = &cfg.eval_data {
            return Ok((train, Some(load_layouts(path)?)));
        }
        if cfg.val_fraction <= 0.0 {
            return Ok((train, None));
        }

        let tokens  = train.tokens();
        let max_len = train.max_len();
        let (train_rows, val_rows) =
            split_train_val(train.into_sequences(), 1.0 - cfg.val_fraction, cfg.seed);
        Ok((
            LayoutDataset::new(train_rows, tokens, max_len),
            Some(LayoutDataset::new(val_rows, tokens, max_len)),
        ))
    }
}
