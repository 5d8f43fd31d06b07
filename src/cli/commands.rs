// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the `train` subcommand and all its flags.
//
// clap's derive macros generate the --help text, the errors for
// bad values and the string → number conversions.

use clap::{Args, Subcommand};
use crate::application::train_use_case::TrainConfig;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train the masked layout model
    Train(TrainArgs),
}

/// All arguments for the `train` command.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// JSON file with the training layouts
    #[arg(long, default_value = "data/train.json")]
    pub train_data: String,

    /// JSON file with held-out layouts (overrides --val-fraction)
    #[arg(long)]
    pub eval_data: Option<String>,

    /// Fraction of the training file held out when no --eval-data is given
    #[arg(long, default_value_t = 0.0)]
    pub val_fraction: f64,

    /// Directory for checkpoints, train_config.json and metric CSVs
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: String,

    /// Directory for rendered samples; sampling is off when unset
    #[arg(long)]
    pub samples_dir: Option<String>,

    /// Checkpoint name inside --checkpoint-dir to start from
    #[arg(long)]
    pub load: Option<String>,

    /// Stop at --max-epochs instead of asking for more
    #[arg(long)]
    pub no_prompt: bool,

    #[arg(long, default_value_t = 10)]
    pub max_epochs: usize,

    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    /// Base learning rate, scaled by the warmup/cosine multiplier
    #[arg(long, default_value_t = 3e-4)]
    pub lr: f64,

    #[arg(long, default_value_t = 0.9)]
    pub beta1: f64,

    #[arg(long, default_value_t = 0.98)]
    pub beta2: f64,

    /// Global gradient norm ceiling
    #[arg(long, default_value_t = 1.0)]
    pub grad_norm_clip: f64,

    #[arg(long, default_value_t = 0.1)]
    pub weight_decay: f64,

    /// Keep the learning rate fixed at --lr
    #[arg(long)]
    pub no_lr_decay: bool,

    #[arg(long, default_value_t = 5000)]
    pub warmup_iters: u64,

    #[arg(long, default_value_t = 25000)]
    pub final_iters: u64,

    /// Lower end of the mask-rate range
    #[arg(long, default_value_t = 0.15)]
    pub start_mask_rate: f64,

    /// Upper end of the mask-rate range
    #[arg(long, default_value_t = 0.7)]
    pub end_mask_rate: f64,

    /// Sample when (epoch + 1) is a multiple of this
    #[arg(long, default_value_t = 1)]
    pub sample_every: usize,

    /// Log progress every N training batches
    #[arg(long, default_value_t = 50)]
    pub log_every: usize,

    /// Data-parallel replicas the batch is split across
    #[arg(long, default_value_t = 1)]
    pub replicas: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Hidden dimension of the transformer
    #[arg(long, default_value_t = 256)]
    pub d_model: usize,

    /// d_model must be divisible by num_heads
    #[arg(long, default_value_t = 8)]
    pub num_heads: usize,

    #[arg(long, default_value_t = 6)]
    pub num_layers: usize,

    #[arg(long, default_value_t = 1024)]
    pub d_ff: usize,

    #[arg(long, default_value_t = 0.1)]
    pub dropout: f64,
}

/// Convert CLI TrainArgs into the application-layer TrainConfig.
/// The application layer never sees clap types.
impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        TrainConfig {
            train_data:      a.train_data,
            eval_data:       a.eval_data,
            val_fraction:    a.val_fraction,
            checkpoint_dir:  a.checkpoint_dir,
            samples_dir:     a.samples_dir,
            load:            a.load,
            max_epochs:      a.max_epochs,
            batch_size:      a.batch_size,
            learning_rate:   a.lr,
            beta1:           a.beta1,
            beta2:           a.beta2,
            grad_norm_clip:  a.grad_norm_clip,
            weight_decay:    a.weight_decay,
            lr_decay:        !a.no_lr_decay,
            warmup_iters:    a.warmup_iters,
            final_iters:     a.final_iters,
            start_mask_rate: a.start_mask_rate,
            end_mask_rate:   a.end_mask_rate,
            sample_every:    a.sample_every,
            log_every:       a.log_every,
            replicas:        a.replicas,
            seed:            a.seed,
            d_model:         a.d_model,
            num_heads:       a.num_heads,
            num_layers:      a.num_layers,
            d_ff:            a.d_ff,
            dropout:         a.dropout,
        }
    }
}
