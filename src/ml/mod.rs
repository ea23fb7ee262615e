// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// All Burn model, optimizer and autodiff code lives here.
//
//   model.rs
//       ChatGLM2 decoder (RMSNorm, rotary, multi-
//       query attention, SwiGLU), weight loading,
//       adapter attachment, gradient clipping
//
//   head.rs
//       Output projection that upcasts logits
//       to f32
//
//   adalora.rs
//       AdaLoRA config, SVD-form adapter and the
//       adapted linear layer
//
//   rank_allocator.rs
//       Importance scores and the rank budget
//       schedule that prunes singular values
//
//   schedule.rs
//       Linear warm-up / decay learning rate
//
//   weights.rs
//       safetensors read/write (single or sharded)
//       and host tensors
//
//   trainer.rs
//       The training loop: accumulation, AdamW,
//       rank allocation, logging, checkpoints
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)
//            Zhang et al. (2023) AdaLoRA

/// ChatGLM2 causal language model
pub mod model;

/// Float-casting LM head
pub mod head;

/// AdaLoRA adapters
pub mod adalora;

/// Budget schedule and importance-based rank allocation
pub mod rank_allocator;

/// Learning rate schedule
pub mod schedule;

/// safetensors weight I/O
pub mod weights;

/// Training loop
pub mod trainer;
