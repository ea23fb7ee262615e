// ============================================================
// Layer 5: Adapter Training Loop
// ============================================================
// Trains only the adapter parameters of a frozen base model with
// Burn's DataLoader and AdamW.
//
// One optimizer step:
//   1. forward + backward on `gradient_accumulation_steps`
//      micro-batches, gradients summed in a GradientsAccumulator
//   2. scale the summed gradients so their global norm is at most
//      `max_grad_norm`, then copy them to host (the optimizer
//      consumes them)
//   3. AdamW step
//   4. rank allocator: update importance from post-step values and
//      the copied gradients, then mask E down to the step's budget
//   5. log / checkpoint on schedule
//
// A trailing group shorter than the accumulation still takes a step
// at the end of every epoch. With the epoch strategy a checkpoint is
// written whenever an epoch ends, including one cut short by max_steps.
//
// Key Burn insights:
//   - Only parameters with require_grad get gradients, so the
//     frozen base never reaches the optimizer
//   - Masking E keeps its ParamId, so AdamW state carries over
//   - The learning rate is passed per step, no scheduler object
//
// Reference: Loshchilov & Hutter (2019) Decoupled Weight Decay
//            Zhang et al. (2023) AdaLoRA

use anyhow::{ensure, Result};
use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    optim::{AdamWConfig, GradientsAccumulator, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::application::finetune_use_case::{SaveStrategy, TrainingConfig};
use crate::data::{
    collator::{CausalLmBatch, DataCollator},
    dataset::InstructionDataset,
};
use crate::infra::{
    checkpoint::CheckpointManager,
    metrics::{MetricsLogger, StepMetrics},
};
use crate::ml::{
    adalora::AdaLoraConfig,
    model::CausalLm,
    rank_allocator::{Allocation, RankAllocator},
    schedule::LinearWarmupSchedule,
};

/// Optimizer steps for a run: `max_steps` when set, otherwise
/// `ceil(epochs × ceil(batches_per_epoch / accumulation))`.
pub fn total_steps(args: &TrainingConfig, batches_per_epoch: usize) -> usize {
    if let Some(max_steps) = args.max_steps.filter(|&s| s > 0) {
        return max_steps;
    }
    let accumulation = args.gradient_accumulation_steps.max(1);
    let per_epoch = batches_per_epoch.div_ceil(accumulation).max(1);
    ((args.num_train_epochs * per_epoch as f64).ceil() as usize).max(1)
}

/// What training hands back: the adapted model and the adapter
/// config with its final rank pattern.
pub struct TrainOutcome<B: AutodiffBackend> {
    pub model:          CausalLm<B>,
    pub adapter_config: AdaLoraConfig,
    pub global_step:    usize,
}

pub struct AdapterTrainer<B: AutodiffBackend> {
    model:          CausalLm<B>,
    args:           TrainingConfig,
    adapter_config: AdaLoraConfig,
    collator:       DataCollator<B>,
    checkpoints:    CheckpointManager,
    metrics:        MetricsLogger,
}

impl<B: AutodiffBackend> AdapterTrainer<B> {
    pub fn new(
        model:          CausalLm<B>,
        args:           TrainingConfig,
        adapter_config: AdaLoraConfig,
        collator:       DataCollator<B>,
        checkpoints:    CheckpointManager,
        metrics:        MetricsLogger,
    ) -> Self {
        Self { model, args, adapter_config, collator, checkpoints, metrics }
    }

    /// The model sees only input ids and labels; logits are dropped.
    pub fn compute_loss(model: &CausalLm<B>, batch: CausalLmBatch<B>) -> Tensor<B, 1> {
        model.forward_loss(batch.input_ids, batch.labels).loss
    }

    pub fn train(self, dataset: InstructionDataset) -> Result<TrainOutcome<B>> {
        let Self { mut model, args, adapter_config, collator, checkpoints, mut metrics } = self;

        ensure!(!dataset.is_empty(), "Training dataset is empty");
        ensure!(
            dataset.max_len() <= model.max_sequence_length,
            "Longest example has {} tokens, the model accepts at most {}",
            dataset.max_len(), model.max_sequence_length
        );

        // ── Schedule ──────────────────────────────────────────────────────────
        let batch_size        = args.per_device_train_batch_size.max(1);
        let accumulation      = args.gradient_accumulation_steps.max(1);
        let batches_per_epoch = dataset.len().div_ceil(batch_size);
        let max_steps         = total_steps(&args, batches_per_epoch);

        let mut adapter_config = adapter_config.with_total_step(max_steps);
        adapter_config.validate()?;
        let mut allocator = RankAllocator::new(&adapter_config, model.adapter_count(), max_steps);
        let schedule = LinearWarmupSchedule::new(args.learning_rate, args.warmup_steps, max_steps);

        tracing::info!(
            "Training: {} examples, {} batches/epoch, {} optimizer steps, budget {} → {}",
            dataset.len(), batches_per_epoch, max_steps,
            allocator.init_budget(), allocator.target_budget()
        );

        // ── AdamW optimiser ───────────────────────────────────────────────────
        let mut optim = AdamWConfig::new()
            .with_beta_1(args.adam_beta1 as f32)
            .with_beta_2(args.adam_beta2 as f32)
            .with_epsilon(args.adam_epsilon as f32)
            .with_weight_decay(args.weight_decay as f32)
            .init::<B, CausalLm<B>>();

        // ── Data loader ───────────────────────────────────────────────────────
        let loader = DataLoaderBuilder::new(collator)
            .batch_size(batch_size)
            .shuffle(args.seed)
            .num_workers(args.dataloader_num_workers)
            .build(dataset);

        // ── Step loop ─────────────────────────────────────────────────────────
        let mut accumulator = GradientsAccumulator::new();
        let mut global_step = 0usize;
        let mut pending     = 0usize;
        let mut budget      = allocator.init_budget();
        let mut lr          = schedule.lr(0);
        let mut loss_sum    = 0.0f64;
        let mut loss_count  = 0usize;
        let mut grad_norm   = 0.0f64;
        let mut epoch       = 0usize;
        let mut finished    = false;

        while !finished {
            for (index, batch) in loader.iter().enumerate() {
                let loss = Self::compute_loss(&model, batch);
                loss_sum   += loss.clone().into_scalar().elem::<f64>();
                loss_count += 1;

                let grads = loss.div_scalar(accumulation as f64).backward();
                accumulator.accumulate(&model, GradientsParams::from_grads(grads, &model));
                pending += 1;

                let last_in_epoch = index + 1 == batches_per_epoch;
                if pending < accumulation && !last_in_epoch {
                    continue;
                }
                pending = 0;

                // ── Optimizer step ────────────────────────────────────────────
                let (grads, norm) = model.clip_grad_norm(accumulator.grads(), args.max_grad_norm);
                grad_norm = norm;
                let adapter_grads = model.adapter_grads(&grads)?;
                lr = schedule.lr(global_step);
                model = optim.step(lr, model, grads);
                global_step += 1;

                let snapshots = model.adapter_snapshots(&adapter_grads)?;
                let allocation = allocator.update_and_allocate(global_step, &snapshots);
                if let Allocation::Mask { pattern, .. } = &allocation {
                    model.apply_rank_pattern(pattern);
                }
                budget = allocation.budget();

                // ── Logging ───────────────────────────────────────────────────
                if args.logging_steps > 0 && global_step % args.logging_steps == 0 {
                    let row = StepMetrics {
                        step:          global_step,
                        epoch:         epoch as f64 + (index + 1) as f64 / batches_per_epoch as f64,
                        loss:          loss_sum / loss_count.max(1) as f64,
                        grad_norm,
                        learning_rate: lr,
                        budget,
                    };
                    tracing::info!(
                        "step {:>6}/{} | epoch {:.2} | loss={:.4} | grad_norm={:.4} | lr={:.3e} | budget={}",
                        row.step, max_steps, row.epoch, row.loss, row.grad_norm, row.learning_rate, row.budget
                    );
                    metrics.log(&row)?;
                    loss_sum   = 0.0;
                    loss_count = 0;
                }

                // ── Checkpoint ────────────────────────────────────────────────
                if args.save_strategy == SaveStrategy::Steps
                    && args.save_steps > 0
                    && global_step % args.save_steps == 0
                {
                    checkpoints.save_model(&checkpoints.step_dir(global_step), &args, &model)?;
                }

                if global_step >= max_steps {
                    finished = true;
                    break;
                }
            }

            epoch += 1;
            if args.save_strategy == SaveStrategy::Epoch {
                checkpoints.save_model(&checkpoints.step_dir(global_step), &args, &model)?;
            }
        }

        if loss_count > 0 {
            tracing::info!(
                "final | loss={:.4} | lr={:.3e} | budget={}",
                loss_sum / loss_count as f64, lr, budget
            );
        }
        metrics.close()?;

        checkpoints.save_model(checkpoints.output_dir(), &args, &model)?;
        adapter_config.rank_pattern = allocator.rank_pattern().cloned();

        tracing::info!("Training complete!");
        Ok(TrainOutcome { model, adapter_config, global_step })
    }
}
