// ============================================================
// Layer 6: Checkpoint Manager
// ============================================================
// Writes adapter checkpoints. Frozen base weights are never
// written; only parameters whose trainable flag is set.
//
// What gets saved per trainer save (`save_model`):
//   1. training_args.json   the full training configuration
//   2. adapter_model.bin    trainable parameters, safetensors
//                           byte layout, f32, model-path names
//
// What gets saved once at the end (`save_pretrained`):
//   1. adapter_config.json        AdaLoRA config incl. rank pattern
//   2. adapter_model.safetensors  trainable parameters named
//                                 `base_model.model.<path>.lora_*`,
//                                 pruned triplets dropped
//
// File naming convention:
//   output/
//     checkpoint-500/
//       training_args.json
//       adapter_model.bin
//     checkpoint-1000/
//       ...
//     training_args.json
//     adapter_model.bin
//     adapter_config.json
//     adapter_model.safetensors

use anyhow::{Context, Result};
use burn::prelude::*;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use crate::application::finetune_use_case::TrainingConfig;
use crate::ml::{
    adalora::{resize_by_rank_pattern, AdaLoraConfig},
    model::CausalLm,
    weights::{trainable_state, write_safetensors},
};

pub const TRAINING_ARGS_NAME:       &str = "training_args.json";
pub const ADAPTER_WEIGHTS_NAME:     &str = "adapter_model.bin";
pub const ADAPTER_CONFIG_NAME:      &str = "adapter_config.json";
pub const ADAPTER_SAFETENSORS_NAME: &str = "adapter_model.safetensors";

const STATE_DICT_PREFIX: &str = "base_model.model.";

/// Manages adapter checkpoints under one output directory.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn output_dir(&self) -> &Path {
        &self.dir
    }

    /// `{output_dir}/checkpoint-{step}`
    pub fn step_dir(&self, step: usize) -> PathBuf {
        self.dir.join(format!("checkpoint-{step}"))
    }

    /// Write the training arguments and every trainable parameter
    /// into `output_dir`, creating it if needed.
    pub fn save_model<B: Backend>(
        &self,
        output_dir: &Path,
        args:       &TrainingConfig,
        model:      &CausalLm<B>,
    ) -> Result<()> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("Cannot create '{}'", output_dir.display()))?;

        let args_path = output_dir.join(TRAINING_ARGS_NAME);
        fs::write(&args_path, serde_json::to_string_pretty(args)?)
            .with_context(|| format!("Cannot write '{}'", args_path.display()))?;

        let tensors = trainable_state(model.named_parameters())?;
        let weights_path = output_dir.join(ADAPTER_WEIGHTS_NAME);
        write_safetensors(&weights_path, &tensors, HashMap::new())?;

        tracing::info!(
            "Saved {} trainable tensors to '{}'",
            tensors.len(),
            weights_path.display()
        );
        Ok(())
    }

    /// Write the adapter config and adapter weights at their final
    /// ranks into the output directory.
    pub fn save_pretrained<B: Backend>(&self, model: &CausalLm<B>, config: &AdaLoraConfig) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Cannot create '{}'", self.dir.display()))?;

        let config_path = self.dir.join(ADAPTER_CONFIG_NAME);
        fs::write(&config_path, serde_json::to_string_pretty(config)?)
            .with_context(|| format!("Cannot write '{}'", config_path.display()))?;

        let tensors: Vec<_> = trainable_state(model.named_parameters())?
            .into_iter()
            .map(|(name, t)| (format!("{STATE_DICT_PREFIX}{name}"), t))
            .collect();
        let tensors = match &config.rank_pattern {
            Some(pattern) => resize_by_rank_pattern(tensors, pattern)?,
            None => tensors,
        };

        let metadata = HashMap::from([("format".to_string(), "pt".to_string())]);
        let weights_path = self.dir.join(ADAPTER_SAFETENSORS_NAME);
        write_safetensors(&weights_path, &tensors, metadata)?;

        tracing::info!("Saved adapter to '{}'", self.dir.display());
        Ok(())
    }
}
