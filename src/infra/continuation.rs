// ============================================================
// Layer 6 — Continuation Policies
// ============================================================
// Implementations of ContinuationPolicy. The training loop never
// touches the terminal itself; the CLI picks one of these:
//
//   StdinContinuation → prompts the operator and reads one line
//   NoContinuation    → always stops (unattended runs)

use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};

use crate::domain::continuation::ContinuationDecision;
use crate::domain::traits::ContinuationPolicy;

/// Reads the decision from any line source; stdin in production.
pub struct StdinContinuation<R> {
    input: R,
}

impl StdinContinuation<io::StdinLock<'static>> {
    pub fn stdin() -> Self {
        Self::from_reader(io::stdin().lock())
    }
}

impl<R: BufRead> StdinContinuation<R> {
    pub fn from_reader(input: R) -> Self {
        Self { input }
    }
}

impl<R: BufRead> ContinuationPolicy for StdinContinuation<R> {
    fn decide(&mut self, epoch: usize) -> Result<ContinuationDecision> {
        eprintln!(
            "Reached epoch {epoch}. Enter a positive integer to train that many more epochs, anything else to stop:"
        );
        io::stderr().flush().ok();

        let mut line = String::new();
        self.input
            .read_line(&mut line)
            .context("Cannot read continuation input")?;

        let decision = ContinuationDecision::parse(&line);
        if decision == ContinuationDecision::Stop {
            tracing::info!("Stopping after epoch {}", epoch);
        }
        Ok(decision)
    }
}

/// Stops as soon as the epoch budget is spent.
pub struct NoContinuation;

impl ContinuationPolicy for NoContinuation {
    fn decide(&mut self, _epoch: usize) -> Result<ContinuationDecision> {
        Ok(ContinuationDecision::Stop)
    }
}
