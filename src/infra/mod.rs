// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Concerns that touch the filesystem or the terminal:
//
//   checkpoint.rs   — parameter snapshots + train_config.json
//   metrics.rs      — CSV telemetry and rendered sample files
//   continuation.rs — operator prompt at epoch exhaustion
//
// Reference: Rust Book §9 (Error Handling with anyhow)
//            Burn Book §5 (Checkpointing)

/// Model checkpoint saving and loading
pub mod checkpoint;

/// Training metrics CSV logger
pub mod metrics;

/// Continuation policies for the training loop
pub mod continuation;
