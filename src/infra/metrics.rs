// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// Telemetry sink backed by plain files:
//
//   {dir}/train_steps.csv   iteration,loss,lr,epoch,mask_rate
//   {dir}/eval_passes.csv   iteration,mean_loss,first_batch_loss,last_batch_loss
//   {samples_dir}/{kind}_{epoch:02}_{i:02}.txt
//
// Rows are appended, so a resumed run keeps extending the same
// files. Every row is keyed by the optimizer-step counter.

use anyhow::{Context, Result};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use crate::domain::traits::{EvalPassRecord, SampleSet, TelemetrySink, TrainStepRecord};

const TRAIN_HEADER: &str = "iteration,loss,lr,epoch,mask_rate";
const EVAL_HEADER:  &str = "iteration,mean_loss,first_batch_loss,last_batch_loss";

pub struct MetricsLogger {
    train_csv:   PathBuf,
    eval_csv:    PathBuf,
    samples_dir: Option<PathBuf>,
}

impl MetricsLogger {
    /// Create the metric files (headers only) if they do not exist yet.
    pub fn new(dir: impl Into<PathBuf>, samples_dir: Option<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create metrics directory '{}'", dir.display()))?;
        if let Some(samples) = &samples_dir {
            fs::create_dir_all(samples)
                .with_context(|| format!("Cannot create samples directory '{}'", samples.display()))?;
        }

        let train_csv = dir.join("train_steps.csv");
        let eval_csv  = dir.join("eval_passes.csv");
        write_header_once(&train_csv, TRAIN_HEADER)?;
        write_header_once(&eval_csv, EVAL_HEADER)?;

        Ok(Self { train_csv, eval_csv, samples_dir })
    }
}

fn write_header_once(path: &Path, header: &str) -> Result<()> {
    if !path.exists() {
        let mut f = fs::File::create(path)
            .with_context(|| format!("Cannot create '{}'", path.display()))?;
        writeln!(f, "{header}")?;
        tracing::debug!("Created metrics CSV: '{}'", path.display());
    }
    Ok(())
}

fn append_row(path: &Path, row: std::fmt::Arguments<'_>) -> Result<()> {
    let mut f = OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("Cannot append to '{}'", path.display()))?;
    f.write_fmt(row)?;
    writeln!(f)?;
    Ok(())
}

impl TelemetrySink for MetricsLogger {
    fn log_train_step(&mut self, iteration: u64, r: &TrainStepRecord) -> Result<()> {
        append_row(
            &self.train_csv,
            format_args!("{},{:.6},{:e},{},{:.4}", iteration, r.loss, r.lr, r.epoch, r.mask_rate),
        )
    }

    fn log_eval_pass(&mut self, iteration: u64, r: &EvalPassRecord) -> Result<()> {
        tracing::info!(
            "iter {}: test loss {:.5} (first batch {:.5}, last batch {:.5})",
            iteration, r.mean_loss, r.first_batch_loss, r.last_batch_loss,
        );
        append_row(
            &self.eval_csv,
            format_args!(
                "{},{:.6},{:.6},{:.6}",
                iteration, r.mean_loss, r.first_batch_loss, r.last_batch_loss
            ),
        )
    }

    fn log_samples(&mut self, iteration: u64, samples: &SampleSet) -> Result<()> {
        let Some(dir) = &self.samples_dir else {
            return Ok(());
        };
        let sets = [
            ("input",         &samples.input),
            ("recon",         &samples.recon),
            ("sample_random", &samples.sample_random),
            ("sample_det",    &samples.sample_det),
        ];
        for (kind, renders) in sets {
            for (i, render) in renders.iter().enumerate() {
                let path = dir.join(format!("{kind}_{:02}_{:02}.txt", samples.epoch, i));
                fs::write(&path, render)
                    .with_context(|| format!("Cannot write sample '{}'", path.display()))?;
            }
        }
        tracing::info!("iter {}: wrote samples for epoch {}", iteration, samples.epoch);
        Ok(())
    }
}
