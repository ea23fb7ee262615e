// ============================================================
// Layer 3: Domain Layer
// ============================================================
// Plain Rust types describing what a fine-tuning run works on.
//
// Rules for this layer:
//   - NO Burn framework types
//   - NO file I/O
//   - Only plain structs, enums and traits
//
// Keeping it framework-free means the collation and masking
// rules can be unit tested without building a backend.

// One pre-tokenized training example
pub mod example;

// Core abstractions (traits) that other layers implement
pub mod traits;
