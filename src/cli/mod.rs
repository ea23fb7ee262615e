// ============================================================
// Layer 1: CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All business logic is delegated to Layer 2 (application).
//
// One command, no subcommands: every flag of FinetuneArgs and
// TrainingArgs is accepted at the top level, e.g.
//
//   adalora-finetune --dataset-path data/alpaca \
//       --per-device-train-batch-size 4 --fp16

pub mod args;

use anyhow::Result;
use clap::Parser;
use args::{FinetuneArgs, TrainingArgs};

#[derive(Parser, Debug)]
#[command(
    name = "adalora-finetune",
    version = "0.1.0",
    about = "Fine-tune a causal language model with AdaLoRA adapters on a pre-tokenized dataset."
)]
pub struct Cli {
    #[command(flatten)]
    pub finetune: FinetuneArgs,

    #[command(flatten)]
    pub training: TrainingArgs,
}

impl Cli {
    /// Convert the parsed args and hand off to Layer 2.
    pub fn run(self) -> Result<()> {
        use crate::application::finetune_use_case::FinetuneUseCase;

        tracing::info!("Fine-tuning on dataset: {}", self.finetune.dataset_path);
        let output_dir = self.training.output_dir.clone();

        let use_case = FinetuneUseCase::new(self.finetune.into(), self.training.into());
        use_case.execute()?;

        println!("Training complete. Adapter saved to '{output_dir}'.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::finetune_use_case::{FinetuneConfig, SaveStrategy, TrainingConfig};
    use crate::data::collator::LabelMasking;

    #[test]
    fn test_defaults_match_config_defaults() {
        let cli = Cli::try_parse_from(["adalora-finetune"]).unwrap();
        let finetune: FinetuneConfig = cli.finetune.into();
        let training: TrainingConfig = cli.training.into();

        assert_eq!(finetune.dataset_path, "data/alpaca");
        assert_eq!(finetune.model_path, "output");
        assert_eq!(finetune.lora_rank, 8);
        assert_eq!(finetune.label_masking, LabelMasking::PadValue);

        let expected = TrainingConfig::default();
        assert_eq!(
            serde_json::to_value(&training).unwrap(),
            serde_json::to_value(&expected).unwrap()
        );
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "adalora-finetune",
            "--lora-rank", "4",
            "--label-masking", "padding-only",
            "--save-strategy", "epoch",
            "--max-steps", "100",
            "--fp16",
        ])
        .unwrap();
        let finetune: FinetuneConfig = cli.finetune.into();
        let training: TrainingConfig = cli.training.into();

        assert_eq!(finetune.lora_rank, 4);
        assert_eq!(finetune.label_masking, LabelMasking::PaddingOnly);
        assert_eq!(training.save_strategy, SaveStrategy::Epoch);
        assert_eq!(training.max_steps, Some(100));
        assert!(training.fp16);
    }

    #[test]
    fn test_unknown_masking_is_rejected() {
        assert!(Cli::try_parse_from(["adalora-finetune", "--label-masking", "none"]).is_err());
    }
}
