// ============================================================
// Layer 3: Core Traits (Abstractions)
// ============================================================
// The application layer only talks to these traits, so a new
// on-disk dataset format means a new implementation here and
// no change to the orchestration code.

use anyhow::Result;
use crate::domain::example::TokenizedExample;

// ─── ExampleSource ────────────────────────────────────────────────────────────
/// Any component that can produce pre-tokenized training examples.
///
/// Implementations:
///   - JsonlLoader → reads `*.jsonl` files from a dataset directory
pub trait ExampleSource {
    /// Load every example this source holds.
    fn load_all(&self) -> Result<Vec<TokenizedExample>>;
}
