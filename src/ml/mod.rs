// ============================================================
// Layer 5 — ML Layer
// ============================================================
// All Burn-specific code lives here, next to the backend-free
// algorithms the training loop is built from.
//
//   masking.rs  — stochastic and geometric masking of token rows
//   schedule.rs — lr multiplier and mask-rate schedules
//   model.rs    — transformer encoder + masked-token loss
//   learner.rs  — model + optimizer behind the domain traits
//   sampler.rs  — decoding loop and qualitative sampling rounds
//   trainer.rs  — the epoch state machine
//
// Reference: Burn Book §3 (Building Blocks), §5 (Training)

pub mod masking;

pub mod schedule;

/// Transformer encoder predicting masked tokens
pub mod model;

pub mod learner;

pub mod sampler;

/// Training loop with evaluation, checkpointing and continuation
pub mod trainer;
