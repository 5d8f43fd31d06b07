// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// From a JSON file of layouts to batches of token rows:
//
//   layouts.json
//       │
//       ▼
//   loader        → reads the file, pads every sequence
//       │
//       ▼
//   splitter      → optional seeded train/held-out split
//       │
//       ▼
//   LayoutDataset → implements Burn's Dataset trait, renders rows
//       │
//       ▼
//   LayoutBatcher → Burn Batcher; DataLoader yields row batches
//                   (shuffled for training, in order for evaluation)
//
// Masking happens after batching, in the ml layer.

/// Reads layout JSON files
pub mod loader;

/// Burn Dataset over padded token sequences
pub mod dataset;

/// Burn Batcher + DataLoader construction for row batches
pub mod batcher;

/// Seeded shuffle + split into train/held-out sets
pub mod splitter;
