// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Entry point for all user interaction. Parses arguments with
// clap and hands off to Layer 2 (application).
//
// The operator prompt at epoch exhaustion also belongs here:
// the CLI picks the continuation policy, the loop only calls it.

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, TrainArgs};

use crate::domain::traits::ContinuationPolicy;
use crate::infra::continuation::{NoContinuation, StdinContinuation};

#[derive(Parser, Debug)]
#[command(
    name = "layout-mask-trainer",
    version = "0.1.0",
    about = "Train a masked-token model over layout sequences."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Route to the matching use case. No computation happens here.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args) => run_train(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    tracing::info!("Starting training on layouts in: {}", args.train_data);

    let continuation: Box<dyn ContinuationPolicy> = if args.no_prompt {
        Box::new(NoContinuation)
    } else {
        Box::new(StdinContinuation::stdin())
    };

    TrainUseCase::new(args.into()).execute(continuation)?;

    println!("Training complete. Checkpoints saved.");
    Ok(())
}
