// ============================================================
// Layer 1: CLI Arguments
// ============================================================
// Two argument groups flattened into one command:
//   FinetuneArgs  what to train on, where the adapter goes
//   TrainingArgs  generic trainer hyperparameters
//
// clap's derive macros automatically generate:
//   - help text (--help)
//   - error messages for bad values
//   - type conversion (string → usize, f64, enums)

use clap::{Args, ValueEnum};

use crate::application::finetune_use_case::{FinetuneConfig, SaveStrategy, TrainingConfig};
use crate::data::collator::LabelMasking;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelMaskingArg {
    /// Mask every label equal to the pad id
    PadValue,
    /// Mask only positions added by padding
    PaddingOnly,
}

impl From<LabelMaskingArg> for LabelMasking {
    fn from(a: LabelMaskingArg) -> Self {
        match a {
            LabelMaskingArg::PadValue    => LabelMasking::PadValue,
            LabelMaskingArg::PaddingOnly => LabelMasking::PaddingOnly,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStrategyArg {
    No,
    Steps,
    Epoch,
}

impl From<SaveStrategyArg> for SaveStrategy {
    fn from(a: SaveStrategyArg) -> Self {
        match a {
            SaveStrategyArg::No    => SaveStrategy::No,
            SaveStrategyArg::Steps => SaveStrategy::Steps,
            SaveStrategyArg::Epoch => SaveStrategy::Epoch,
        }
    }
}

/// Dataset, adapter and base-model locations.
#[derive(Args, Debug)]
pub struct FinetuneArgs {
    /// Directory of *.jsonl files (or one .jsonl file) with
    /// pre-tokenized `input_ids` / `labels`
    #[arg(long, default_value = "data/alpaca")]
    pub dataset_path: String,

    /// Accepted for compatibility and unused; the adapter is saved
    /// to --output-dir
    #[arg(long, default_value = "output")]
    pub model_path: String,

    /// Average adapter rank after budget allocation
    #[arg(long, default_value_t = 8)]
    pub lora_rank: usize,

    /// Directory holding config.json and model.safetensors (or a
    /// sharded model.safetensors.index.json)
    #[arg(long, default_value = "../../model/")]
    pub base_model_dir: String,

    /// Which label positions are excluded from the loss
    #[arg(long, value_enum, default_value_t = LabelMaskingArg::PadValue)]
    pub label_masking: LabelMaskingArg,
}

impl From<FinetuneArgs> for FinetuneConfig {
    fn from(a: FinetuneArgs) -> Self {
        FinetuneConfig {
            dataset_path:   a.dataset_path,
            model_path:     a.model_path,
            lora_rank:      a.lora_rank,
            base_model_dir: a.base_model_dir,
            label_masking:  a.label_masking.into(),
        }
    }
}

/// Trainer hyperparameters.
#[derive(Args, Debug)]
pub struct TrainingArgs {
    /// Checkpoints and the final adapter go here
    #[arg(long, default_value = "output")]
    pub output_dir: String,

    #[arg(long, default_value_t = 8)]
    pub per_device_train_batch_size: usize,

    /// Micro-batches summed into one optimizer step
    #[arg(long, default_value_t = 1)]
    pub gradient_accumulation_steps: usize,

    /// Peak learning rate, reached after warm-up
    #[arg(long, default_value_t = 5e-5)]
    pub learning_rate: f64,

    #[arg(long, default_value_t = 0.0)]
    pub weight_decay: f64,

    #[arg(long, default_value_t = 0.9)]
    pub adam_beta1: f64,

    #[arg(long, default_value_t = 0.999)]
    pub adam_beta2: f64,

    #[arg(long, default_value_t = 1e-8)]
    pub adam_epsilon: f64,

    /// Global gradient-norm clip; 0 disables clipping
    #[arg(long, default_value_t = 1.0)]
    pub max_grad_norm: f64,

    #[arg(long, default_value_t = 3.0)]
    pub num_train_epochs: f64,

    /// Overrides the epoch count when set
    #[arg(long)]
    pub max_steps: Option<usize>,

    #[arg(long, default_value_t = 0)]
    pub warmup_steps: usize,

    /// metrics.csv is written here
    #[arg(long, default_value = "runs")]
    pub logging_dir: String,

    #[arg(long, default_value_t = 500)]
    pub logging_steps: usize,

    #[arg(long, value_enum, default_value_t = SaveStrategyArg::Steps)]
    pub save_strategy: SaveStrategyArg,

    #[arg(long, default_value_t = 500)]
    pub save_steps: usize,

    /// Seeds the backend RNG and data-loader shuffling
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = 1)]
    pub dataloader_num_workers: usize,

    /// Run the model in half precision
    #[arg(long)]
    pub fp16: bool,

    /// gpu:N (or cuda:N), cpu, or default
    #[arg(long, default_value = "gpu:0")]
    pub device: String,
}

/// Convert CLI args into the application-layer config.
/// The application layer never sees clap types.
impl From<TrainingArgs> for TrainingConfig {
    fn from(a: TrainingArgs) -> Self {
        TrainingConfig {
            output_dir:                  a.output_dir,
            per_device_train_batch_size: a.per_device_train_batch_size,
            gradient_accumulation_steps: a.gradient_accumulation_steps,
            learning_rate:               a.learning_rate,
            weight_decay:                a.weight_decay,
            adam_beta1:                  a.adam_beta1,
            adam_beta2:                  a.adam_beta2,
            adam_epsilon:                a.adam_epsilon,
            max_grad_norm:               a.max_grad_norm,
            num_train_epochs:            a.num_train_epochs,
            max_steps:                   a.max_steps,
            warmup_steps:                a.warmup_steps,
            logging_dir:                 a.logging_dir,
            logging_steps:               a.logging_steps,
            save_strategy:               a.save_strategy.into(),
            save_steps:                  a.save_steps,
            seed:                        a.seed,
            dataloader_num_workers:      a.dataloader_num_workers,
            fp16:                        a.fp16,
            device:                      a.device,
        }
    }
}
