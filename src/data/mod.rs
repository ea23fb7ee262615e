// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Pre-tokenized JSONL records all the way to padded tensor
// batches.
//
//   *.jsonl files
//       │
//       ▼
//   JsonlLoader          → parses input_ids / labels per line
//       │
//       ▼
//   InstructionDataset   → implements Burn's Dataset trait
//       │
//       ▼
//   DataCollator         → pads and masks labels
//       │
//       ▼
//   DataLoader           → shuffles and feeds batches to the trainer
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

/// Reads pre-tokenized examples from JSONL files
pub mod loader;

/// Implements Burn's Dataset trait for tokenized examples
pub mod dataset;

/// Implements Burn's Batcher trait: padding and label masking
pub mod collator;
