// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Pure Rust types and traits that describe layout sequences,
// masked training examples and the collaborators the training
// loop talks to.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O
//   - Only plain Rust structs, enums, and traits
//
// Everything in here can be unit tested without a tensor
// backend; the ml and infra layers provide the implementations.

// Token layout constants, special tokens and masked batches
pub mod layout;

// Canonical-model accessor over the replication wrapper
pub mod replication;

// Operator decision at max-epoch exhaustion
pub mod continuation;

// Collaborator traits (model, checkpoints, telemetry, sampling)
pub mod traits;
