// ============================================================
// Layer 2: FinetuneUseCase
// ============================================================
// Orchestrates the full fine-tuning run in order:
//
//   Step 1: Select device and backend        (this layer)
//   Step 2: Load base model                  (Layer 5 - ml)
//   Step 3: Resolve pad id                   (Layer 6 - infra)
//   Step 4: Attach AdaLoRA adapters          (Layer 5 - ml)
//   Step 5: Load tokenized dataset           (Layer 4 - data)
//   Step 6: Run training loop                (Layer 5 - ml)
//   Step 7: Save final adapter               (Layer 6 - infra)
//
// Every output (checkpoints and the final adapter) goes under
// `output_dir`. `model_path` is accepted for compatibility and unused.
//
// Precision and memory flags map onto the backend type:
//   - gradient checkpointing: Autodiff<_, BalancedCheckpointing>
//   - --fp16: Wgpu<f16> instead of Wgpu<f32>
// The output head always upcasts logits to f32.

use anyhow::{bail, Context, Result};
use burn::{
    backend::{
        wgpu::{Wgpu, WgpuDevice},
        Autodiff,
    },
    tensor::{backend::AutodiffBackend, f16},
};
use burn::backend::autodiff::checkpoint::strategy::BalancedCheckpointing;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::data::{
    collator::{DataCollator, LabelMasking},
    dataset::InstructionDataset,
    loader::JsonlLoader,
};
use crate::domain::traits::ExampleSource;
use crate::infra::{
    checkpoint::CheckpointManager,
    metrics::MetricsLogger,
    tokenizer_store::TokenizerStore,
};
use crate::ml::{
    adalora::AdaLoraConfig,
    model::CausalLm,
    trainer::AdapterTrainer,
};

type F32Backend = Autodiff<Wgpu<f32>, BalancedCheckpointing>;
type F16Backend = Autodiff<Wgpu<f16>, BalancedCheckpointing>;

// ─── Finetune Configuration ──────────────────────────────────────────────────
// What to fine-tune on and where the result goes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinetuneConfig {
    pub dataset_path:   String,
    pub model_path:     String,
    pub lora_rank:      usize,
    pub base_model_dir: String,
    pub label_masking:  LabelMasking,
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            dataset_path:   "data/alpaca".to_string(),
            model_path:     "output".to_string(),
            lora_rank:      8,
            base_model_dir: "../../model/".to_string(),
            label_masking:  LabelMasking::PadValue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStrategy {
    No,
    Steps,
    Epoch,
}

// ─── Training Configuration ──────────────────────────────────────────────────
// Generic trainer hyperparameters. Written to training_args.json
// with every checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub output_dir:                  String,
    pub per_device_train_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate:               f64,
    pub weight_decay:                f64,
    pub adam_beta1:                  f64,
    pub adam_beta2:                  f64,
    pub adam_epsilon:                f64,
    pub max_grad_norm:               f64,
    pub num_train_epochs:            f64,
    pub max_steps:                   Option<usize>,
    pub warmup_steps:                usize,
    pub logging_dir:                 String,
    pub logging_steps:               usize,
    pub save_strategy:               SaveStrategy,
    pub save_steps:                  usize,
    pub seed:                        u64,
    pub dataloader_num_workers:      usize,
    pub fp16:                        bool,
    pub device:                      String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir:                  "output".to_string(),
            per_device_train_batch_size: 8,
            gradient_accumulation_steps: 1,
            learning_rate:               5e-5,
            weight_decay:                0.0,
            adam_beta1:                  0.9,
            adam_beta2:                  0.999,
            adam_epsilon:                1e-8,
            max_grad_norm:               1.0,
            num_train_epochs:            3.0,
            max_steps:                   None,
            warmup_steps:                0,
            logging_dir:                 "runs".to_string(),
            logging_steps:               500,
            save_strategy:               SaveStrategy::Steps,
            save_steps:                  500,
            seed:                        42,
            dataloader_num_workers:      1,
            fp16:                        false,
            device:                      "gpu:0".to_string(),
        }
    }
}

/// Parse `gpu:N` / `cuda:N`, `cpu` or `default` into a WGPU device.
pub fn parse_device(spec: &str) -> Result<WgpuDevice> {
    let spec = spec.trim().to_ascii_lowercase();
    match spec.as_str() {
        "default" => return Ok(WgpuDevice::DefaultDevice),
        "cpu"     => return Ok(WgpuDevice::Cpu),
        "gpu" | "cuda" => return Ok(WgpuDevice::DiscreteGpu(0)),
        _ => {}
    }
    if let Some((kind, index)) = spec.split_once(':') {
        if kind == "gpu" || kind == "cuda" {
            let index: usize = index
                .parse()
                .with_context(|| format!("Invalid device index in '{spec}'"))?;
            return Ok(WgpuDevice::DiscreteGpu(index));
        }
    }
    bail!("Unknown device '{spec}', expected gpu:N, cuda:N, cpu or default")
}

// ─── FinetuneUseCase ─────────────────────────────────────────────────────────
pub struct FinetuneUseCase {
    finetune: FinetuneConfig,
    training: TrainingConfig,
}

impl FinetuneUseCase {
    pub fn new(finetune: FinetuneConfig, training: TrainingConfig) -> Self {
        Self { finetune, training }
    }

    /// Execute the full fine-tuning run end to end
    pub fn execute(&self) -> Result<()> {
        let device = parse_device(&self.training.device)?;
        tracing::info!("Using WGPU device: {:?}", device);

        if self.training.fp16 {
            tracing::info!("Half precision enabled, logits are upcast to f32");
            self.run::<F16Backend>(device)
        } else {
            self.run::<F32Backend>(device)
        }
    }

    fn run<B: AutodiffBackend>(&self, device: B::Device) -> Result<()> {
        let ft = &self.finetune;
        B::seed(self.training.seed);

        if ft.model_path != self.training.output_dir {
            tracing::warn!(
                "model_path '{}' is not used, the adapter is saved to output_dir '{}'",
                ft.model_path, self.training.output_dir
            );
        }

        // ── Step 2: Base model ────────────────────────────────────────────────
        let model_dir = PathBuf::from(&ft.base_model_dir);
        let (model, model_config) = CausalLm::<B>::from_pretrained(&model_dir, &device)?;

        // ── Step 3: Pad id ────────────────────────────────────────────────────
        let pad_token_id = TokenizerStore::new(&model_dir).resolve_pad_token_id(model_config.pad_token_id)?;
        tracing::info!(
            "Base model ready: {} layers, hidden={}, kv groups={}, pad_token_id={}",
            model_config.num_layers, model_config.hidden_size, model_config.num_kv_groups(), pad_token_id
        );

        // ── Step 4: Adapters ──────────────────────────────────────────────────
        let adapter_config = AdaLoraConfig::for_rank(ft.lora_rank);
        let model = model.attach_adapters(&adapter_config, &device)?;
        let (trainable, total) = model.parameter_counts();
        tracing::info!(
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            trainable, total, 100.0 * trainable as f64 / total.max(1) as f64
        );

        // ── Step 5: Dataset ───────────────────────────────────────────────────
        let examples = JsonlLoader::new(&ft.dataset_path).load_all()?;
        let dataset  = InstructionDataset::new(examples);
        tracing::info!("len(dataset)={}", burn::data::dataset::Dataset::len(&dataset));

        // ── Step 6: Train ─────────────────────────────────────────────────────
        let collator    = DataCollator::<B>::new(device.clone(), pad_token_id, ft.label_masking);
        let checkpoints = CheckpointManager::new(&self.training.output_dir);
        let metrics     = MetricsLogger::new(&self.training.logging_dir)?;

        let trainer = AdapterTrainer::new(
            model, self.training.clone(), adapter_config, collator, checkpoints, metrics,
        );
        let outcome = trainer.train(dataset)?;

        // ── Step 7: Final adapter ─────────────────────────────────────────────
        let final_dir = CheckpointManager::new(&self.training.output_dir);
        final_dir.save_pretrained(&outcome.model, &outcome.adapter_config)?;
        tracing::info!(
            "Training finished after {} steps, adapter saved to '{}'",
            outcome.global_step, self.training.output_dir
        );
        Ok(())
    }
}
