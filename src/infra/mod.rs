// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Cross-cutting concerns that don't belong in any specific
// business layer:
//
//   checkpoint.rs
//       Periodic checkpoints and the final
//       adapter export. Weights go out as
//       safetensors, configs as JSON.
//
//   tokenizer_store.rs
//       Loads the base model's tokenizer.json
//       and resolves the pad token id.
//
//   metrics.rs
//       Step-level metrics (loss, learning
//       rate, rank budget) written to CSV.
//
// Reference: Rust Book §9 (Error Handling with anyhow)

/// Checkpoint and adapter saving
pub mod checkpoint;

/// Tokenizer loading and pad id resolution
pub mod tokenizer_store;

/// Training metrics CSV logger
pub mod metrics;
