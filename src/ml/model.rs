// ============================================================
// Layer 5: ChatGLM2 Causal Language Model
// ============================================================
// Decoder-only transformer in the ChatGLM2 layout, loadable from a
// HuggingFace model directory (config.json + safetensors weights).
//
// Per block:
//   input_layernorm (RMSNorm)
//     → self_attention: fused query_key_value projection,
//       rotary position embedding on half of every head,
//       multi-query attention (K/V shared by head groups),
//       causal mask, dense output projection
//     → residual
//   post_attention_layernorm (RMSNorm)
//     → mlp: dense_h_to_4h (2 × ffn wide) → SwiGLU → dense_4h_to_h
//     → residual
//
// After the last block: final_layernorm, then the output layer
// wrapped so logits are always f32.
//
// Any projection can carry an AdaLoRA adapter; the base weights
// are frozen when adapters are attached.

use anyhow::{anyhow, ensure, Context, Result};
use burn::{
    module::{Param, ParamId},
    nn::{
        attention::generate_autoregressive_mask,
        Embedding, EmbeddingConfig,
        Linear, LinearConfig,
    },
    prelude::*,
    tensor::{
        activation::{log_softmax, silu, softmax},
        backend::AutodiffBackend,
        FloatDType,
    },
    optim::GradientsParams,
};
use std::{collections::{BTreeMap, HashMap}, path::Path};

use super::adalora::{AdaLoraConfig, AdaptedLinear, SvdAdapter};
use super::head::CastOutputToFloat;
use super::rank_allocator::{AdapterGrads, AdapterSnapshot};
use super::weights::{read_pretrained_weights, to_host_vec, NamedParam, WeightMap};
use crate::domain::example::IGNORE_INDEX;

/// Value written into masked attention scores. Stays finite in f16.
const MASK_FILL: f32 = -1e4;

/// Base of the rotary frequencies before `rope_ratio` scaling.
const ROPE_BASE: f64 = 10_000.0;

/// Rotary frequencies stored in checkpoints; recomputed here.
const INV_FREQ_BUFFER: &str = "transformer.rotary_pos_emb.inv_freq";

/// Projections an adapter can be attached to, per block.
pub const ADAPTABLE_MODULES: [&str; 4] =
    ["query_key_value", "dense", "dense_h_to_4h", "dense_4h_to_h"];

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize
// internally, do NOT add them again or you get conflicting impls.
// Field names are the keys of a ChatGLM2 config.json.
#[derive(Config, Debug)]
pub struct CausalLmConfig {
    pub padded_vocab_size:   usize,
    pub hidden_size:         usize,
    pub num_layers:          usize,
    pub num_attention_heads: usize,
    pub ffn_hidden_size:     usize,
    pub seq_length:          usize,
    /// Width of one attention head; hidden_size / heads when absent
    #[config(default = "None")]
    pub kv_channels:           Option<usize>,
    #[config(default = false)]
    pub multi_query_attention: bool,
    /// K/V head groups when multi_query_attention is set
    #[config(default = 1)]
    pub multi_query_group_num: usize,
    #[config(default = 1e-5)]
    pub layernorm_epsilon:     f64,
    #[config(default = true)]
    pub rmsnorm:               bool,
    #[config(default = true)]
    pub add_qkv_bias:          bool,
    #[config(default = false)]
    pub add_bias_linear:       bool,
    #[config(default = true)]
    pub post_layer_norm:       bool,
    #[config(default = false)]
    pub apply_residual_connection_post_layernorm: bool,
    #[config(default = 1.0)]
    pub rope_ratio:            f64,
    #[config(default = "None")]
    pub pad_token_id:          Option<u32>,
}

impl CausalLmConfig {
    pub fn head_dim(&self) -> usize {
        self.kv_channels
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    /// Number of K/V heads. Every query head has its own without MQA.
    pub fn num_kv_groups(&self) -> usize {
        if self.multi_query_attention {
            self.multi_query_group_num
        } else {
            self.num_attention_heads
        }
    }

    /// Output width of the fused query_key_value projection.
    pub fn qkv_width(&self) -> usize {
        (self.num_attention_heads + 2 * self.num_kv_groups()) * self.head_dim()
    }

    /// Rotary embedding covers the first half of every head.
    pub fn rotary_dim(&self) -> usize {
        self.head_dim() / 2
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_attention_heads > 0, "num_attention_heads must be positive");
        if self.kv_channels.is_none() {
            ensure!(
                self.hidden_size % self.num_attention_heads == 0,
                "hidden_size {} is not divisible by {} heads",
                self.hidden_size, self.num_attention_heads
            );
        }
        ensure!(
            self.head_dim() > 0 && self.head_dim() % 4 == 0,
            "head width {} must be a positive multiple of 4 for rotary pairs",
            self.head_dim()
        );
        let groups = self.num_kv_groups();
        ensure!(
            groups > 0 && self.num_attention_heads % groups == 0,
            "{} attention heads cannot be split into {} K/V groups",
            self.num_attention_heads, groups
        );
        ensure!(self.rmsnorm, "only RMSNorm checkpoints are supported");
        ensure!(self.post_layer_norm, "checkpoints without final_layernorm are not supported");
        ensure!(
            !self.apply_residual_connection_post_layernorm,
            "post-layernorm residual connections are not supported"
        );
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> CausalLm<B> {
        let word_embeddings = EmbeddingConfig::new(self.padded_vocab_size, self.hidden_size).init(device);
        let layers: Vec<GlmBlock<B>> = (0..self.num_layers)
            .map(|_| self.build_block(device))
            .collect();
        let final_layernorm = RmsNorm::new(self.hidden_size, self.layernorm_epsilon, device);
        let output_layer    = CastOutputToFloat::new(self.hidden_size, self.padded_vocab_size, device);
        CausalLm {
            word_embeddings, layers,
            final_layernorm, output_layer,
            rotary_dim:          self.rotary_dim(),
            rope_base:           ROPE_BASE * self.rope_ratio,
            max_sequence_length: self.seq_length,
            orth_reg_weight:     0.0,
        }
    }

    fn build_block<B: Backend>(&self, device: &B::Device) -> GlmBlock<B> {
        let h       = self.hidden_size;
        let ffn     = self.ffn_hidden_size;
        let q_width = self.num_attention_heads * self.head_dim();
        let bias    = self.add_bias_linear;
        let linear = |d_in, d_out, bias| -> AdaptedLinear<B> {
            AdaptedLinear::new(LinearConfig::new(d_in, d_out).with_bias(bias).init(device))
        };
        GlmBlock {
            input_layernorm: RmsNorm::new(h, self.layernorm_epsilon, device),
            self_attention:  SelfAttention {
                query_key_value: linear(h, self.qkv_width(), self.add_qkv_bias),
                dense:           linear(q_width, h, bias),
                num_heads:       self.num_attention_heads,
                num_kv_groups:   self.num_kv_groups(),
                head_dim:        self.head_dim(),
            },
            post_attention_layernorm: RmsNorm::new(h, self.layernorm_epsilon, device),
            mlp: Mlp {
                dense_h_to_4h: linear(h, 2 * ffn, bias),
                dense_4h_to_h: linear(ffn, h, bias),
            },
        }
    }
}

// ─── RmsNorm ──────────────────────────────────────────────────────────────────
// Own implementation so the weight is reachable by name.
#[derive(Module, Debug)]
pub struct RmsNorm<B: Backend> {
    pub weight:  Param<Tensor<B, 1>>,
    pub epsilon: f64,
}

impl<B: Backend> RmsNorm<B> {
    pub fn new(d_model: usize, epsilon: f64, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::ones([d_model], device)),
            epsilon,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [_, _, d_model] = x.dims();
        // squares of x / √d sum to the mean square and stay finite in f16
        let mean_square = x
            .clone()
            .div_scalar((d_model as f64).sqrt())
            .powi_scalar(2)
            .sum_dim(2);
        x.div(mean_square.add_scalar(self.epsilon).sqrt()) * self.weight.val().unsqueeze()
    }

    fn named_parameters(&self, prefix: &str) -> Vec<NamedParam<B>> {
        vec![NamedParam::vector(format!("{prefix}.weight"), &self.weight)]
    }

    fn load(&mut self, weights: &mut WeightMap, prefix: &str, device: &B::Device) -> Result<()> {
        let [d] = self.weight.shape().dims::<1>();
        let w = weights.take(&format!("{prefix}.weight"), &[d])?;
        self.weight = Param::from_tensor(w.to_tensor(device));
        Ok(())
    }
}

// ─── Rotary position embedding ────────────────────────────────────────────────
/// cos / sin tables for one sequence length, shaped [1, 1, seq_len, dim / 2, 1]
/// so they broadcast over batch and heads.
pub struct RotaryTables<B: Backend> {
    cos: Tensor<B, 5>,
    sin: Tensor<B, 5>,
    dim: usize,
}

impl<B: Backend> RotaryTables<B> {
    /// Position p, pair i rotates by p · base^(-2i / dim).
    pub fn new(seq_len: usize, dim: usize, base: f64, device: &B::Device) -> Self {
        let half = dim / 2;
        let mut cos = Vec::with_capacity(seq_len * half);
        let mut sin = Vec::with_capacity(seq_len * half);
        for pos in 0..seq_len {
            for i in 0..half {
                let angle = pos as f64 * base.powf(-((2 * i) as f64) / dim as f64);
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }
        let shape = vec![1, 1, seq_len, half, 1];
        Self {
            cos: Tensor::from_data(TensorData::new(cos, shape.clone()), device),
            sin: Tensor::from_data(TensorData::new(sin, shape), device),
            dim,
        }
    }

    /// x: [batch, heads, seq_len, head_dim]. Rotates adjacent channel
    /// pairs of the first `dim` channels; the rest pass through.
    pub fn apply(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, heads, seq_len, head_dim] = x.dims();
        let half = self.dim / 2;

        let pairs = x.clone().narrow(3, 0, self.dim).reshape([batch, heads, seq_len, half, 2]);
        let x0 = pairs.clone().narrow(4, 0, 1);
        let x1 = pairs.narrow(4, 1, 1);
        let r0 = x0.clone() * self.cos.clone() - x1.clone() * self.sin.clone();
        let r1 = x1 * self.cos.clone() + x0 * self.sin.clone();
        let rotated = Tensor::cat(vec![r0, r1], 4).reshape([batch, heads, seq_len, self.dim]);

        if self.dim == head_dim {
            rotated
        } else {
            Tensor::cat(vec![rotated, x.narrow(3, self.dim, head_dim - self.dim)], 3)
        }
    }
}

// ─── Transformer block ────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct SelfAttention<B: Backend> {
    pub query_key_value: AdaptedLinear<B>,
    pub dense:           AdaptedLinear<B>,
    pub num_heads:       usize,
    pub num_kv_groups:   usize,
    pub head_dim:        usize,
}

impl<B: Backend> SelfAttention<B> {
    /// x: [batch, seq_len, hidden], mask: [batch, seq_len, seq_len] (true = hidden)
    pub fn forward(&self, x: Tensor<B, 3>, mask: Tensor<B, 3, Bool>, rope: &RotaryTables<B>) -> Tensor<B, 3> {
        let [batch, seq_len, _] = x.dims();
        let (heads, groups, head_dim) = (self.num_heads, self.num_kv_groups, self.head_dim);
        let q_width  = heads * head_dim;
        let kv_width = groups * head_dim;

        // [batch, seq_len, (heads + 2 * groups) * head_dim]
        let qkv = self.query_key_value.forward(x);
        let split = |t: Tensor<B, 3>, n: usize| t.reshape([batch, seq_len, n, head_dim]).swap_dims(1, 2);
        let q = split(qkv.clone().narrow(2, 0, q_width), heads);
        let k = split(qkv.clone().narrow(2, q_width, kv_width), groups);
        let v = split(qkv.narrow(2, q_width + kv_width, kv_width), groups);

        let q = rope.apply(q);
        let k = repeat_kv(rope.apply(k), heads / groups);
        let v = repeat_kv(v, heads / groups);

        let scores = q.matmul(k.transpose()).div_scalar((head_dim as f64).sqrt());
        let mask   = mask.unsqueeze_dim::<4>(1).expand([batch, heads, seq_len, seq_len]);
        let probs  = softmax(scores.mask_fill(mask, MASK_FILL), 3);

        let context = probs.matmul(v).swap_dims(1, 2).reshape([batch, seq_len, q_width]);
        self.dense.forward(context)
    }
}

/// [batch, groups, seq, d] → [batch, groups × n_rep, seq, d]; query head
/// h reads K/V group h / n_rep.
fn repeat_kv<B: Backend>(x: Tensor<B, 4>, n_rep: usize) -> Tensor<B, 4> {
    if n_rep == 1 {
        return x;
    }
    let [batch, groups, seq_len, head_dim] = x.dims();
    x.unsqueeze_dim::<5>(2)
        .expand([batch, groups, n_rep, seq_len, head_dim])
        .reshape([batch, groups * n_rep, seq_len, head_dim])
}

#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    pub dense_h_to_4h: AdaptedLinear<B>,
    pub dense_4h_to_h: AdaptedLinear<B>,
}

impl<B: Backend> Mlp<B> {
    /// SwiGLU: the up projection holds gate and value halves.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let up = self.dense_h_to_4h.forward(x);
        let [_, _, width] = up.dims();
        let ffn = width / 2;
        let gate  = up.clone().narrow(2, 0, ffn);
        let value = up.narrow(2, ffn, ffn);
        self.dense_4h_to_h.forward(silu(gate) * value)
    }
}

#[derive(Module, Debug)]
pub struct GlmBlock<B: Backend> {
    pub input_layernorm:          RmsNorm<B>,
    pub self_attention:           SelfAttention<B>,
    pub post_attention_layernorm: RmsNorm<B>,
    pub mlp:                      Mlp<B>,
}

impl<B: Backend> GlmBlock<B> {
    pub fn forward(&self, x: Tensor<B, 3>, mask: Tensor<B, 3, Bool>, rope: &RotaryTables<B>) -> Tensor<B, 3> {
        let attn = self.self_attention.forward(self.input_layernorm.forward(x.clone()), mask, rope);
        let x = x + attn;
        let ffn = self.mlp.forward(self.post_attention_layernorm.forward(x.clone()));
        x + ffn
    }

    /// Every projection with its path inside the block.
    fn projections(&self) -> [(&'static str, &AdaptedLinear<B>); 4] {
        [
            ("self_attention.query_key_value", &self.self_attention.query_key_value),
            ("self_attention.dense",           &self.self_attention.dense),
            ("mlp.dense_h_to_4h",              &self.mlp.dense_h_to_4h),
            ("mlp.dense_4h_to_h",              &self.mlp.dense_4h_to_h),
        ]
    }

    fn projections_mut(&mut self) -> [(&'static str, &mut AdaptedLinear<B>); 4] {
        [
            ("self_attention.query_key_value", &mut self.self_attention.query_key_value),
            ("self_attention.dense",           &mut self.self_attention.dense),
            ("mlp.dense_h_to_4h",              &mut self.mlp.dense_h_to_4h),
            ("mlp.dense_4h_to_h",              &mut self.mlp.dense_4h_to_h),
        ]
    }
}

// ─── CausalLm ─────────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct CausalLm<B: Backend> {
    pub word_embeddings:     Embedding<B>,
    pub layers:              Vec<GlmBlock<B>>,
    pub final_layernorm:     RmsNorm<B>,
    pub output_layer:        CastOutputToFloat<B>,
    pub rotary_dim:          usize,
    pub rope_base:           f64,
    pub max_sequence_length: usize,
    pub orth_reg_weight:     f64,
}

pub struct CausalLmOutput<B: Backend> {
    pub loss:   Tensor<B, 1>,
    pub logits: Tensor<B, 3>,
}

impl<B: Backend> CausalLm<B> {
    /// Load `config.json` and the safetensors weights (single file or
    /// sharded with an index) from a model directory.
    pub fn from_pretrained(dir: &Path, device: &B::Device) -> Result<(Self, CausalLmConfig)> {
        let config_path = dir.join("config.json");
        let config = CausalLmConfig::load(&config_path)
            .map_err(|e| anyhow!("Cannot load '{}': {e}", config_path.display()))?;
        config.validate()?;

        let weights = read_pretrained_weights(dir)
            .with_context(|| format!("Cannot load base weights from '{}'", dir.display()))?;
        tracing::info!("Read {} tensors from '{}'", weights.len(), dir.display());

        let mut model: Self = config.init(device);
        model.load_weights(weights, device)?;
        Ok((model, config))
    }

    /// Replace every base parameter with the tensor of the same name.
    pub fn load_weights(&mut self, mut weights: WeightMap, device: &B::Device) -> Result<()> {
        let [vocab, hidden] = self.word_embeddings.weight.shape().dims::<2>();
        let word = weights.take("transformer.embedding.word_embeddings.weight", &[vocab, hidden])?;
        self.word_embeddings.weight = Param::from_tensor(word.to_tensor(device));
        weights.discard(INV_FREQ_BUFFER);

        for (i, layer) in self.layers.iter_mut().enumerate() {
            let prefix = format!("transformer.encoder.layers.{i}");
            layer.input_layernorm.load(&mut weights, &format!("{prefix}.input_layernorm"), device)?;
            layer.post_attention_layernorm.load(&mut weights, &format!("{prefix}.post_attention_layernorm"), device)?;
            for (path, proj) in layer.projections_mut() {
                load_linear(&mut proj.base, &mut weights, &format!("{prefix}.{path}"), device)?;
            }
        }

        self.final_layernorm.load(&mut weights, "transformer.encoder.final_layernorm", device)?;
        load_linear(&mut self.output_layer.inner, &mut weights, "transformer.output_layer", device)?;

        let unused = weights.remaining();
        if !unused.is_empty() {
            tracing::warn!("{} checkpoint tensors unused, first: '{}'", unused.len(), unused[0]);
        }
        Ok(())
    }

    /// input_ids: [batch, seq_len] → logits: [batch, seq_len, vocab] (f32)
    pub fn forward(&self, input_ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [batch_size, seq_len] = input_ids.dims();
        let device = input_ids.device();

        let rope  = RotaryTables::new(seq_len, self.rotary_dim, self.rope_base, &device);
        let mask  = generate_autoregressive_mask::<B>(batch_size, seq_len, &device);
        let mut x = self.word_embeddings.forward(input_ids);
        for layer in &self.layers {
            x = layer.forward(x, mask.clone(), &rope);
        }
        self.output_layer.forward(self.final_layernorm.forward(x))
    }

    /// Causal-LM loss: token t predicts label t+1, `-100` labels are skipped,
    /// mean over the remaining positions (0 when there are none).
    /// Adds the adapter orthogonality penalty when adapters are attached.
    pub fn forward_loss(&self, input_ids: Tensor<B, 2, Int>, labels: Tensor<B, 2, Int>) -> CausalLmOutput<B> {
        let logits = self.forward(input_ids);
        let [batch_size, seq_len, vocab] = logits.dims();

        let lm_loss = if seq_len < 2 {
            // nothing to predict; keep the graph and dtype of the logits
            logits.clone().sum().mul_scalar(0.0)
        } else {
            let shifted = logits.clone().slice([0..batch_size, 0..seq_len - 1, 0..vocab]);
            let targets = labels.slice([0..batch_size, 1..seq_len]);
            let ignored = targets.clone().equal_elem(IGNORE_INDEX);
            let count = ignored
                .clone()
                .bool_not()
                .int()
                .sum()
                .into_scalar()
                .elem::<i64>();

            let indices = targets.mask_fill(ignored.clone(), 0).unsqueeze_dim::<3>(2);
            let nll = log_softmax(shifted, 2)
                .gather(2, indices)
                .reshape([batch_size, seq_len - 1])
                .neg()
                .mask_fill(ignored, 0.0);
            nll.sum().div_scalar(count.max(1) as f64)
        };

        let loss = match self.orth_penalty() {
            Some(penalty) => lm_loss + penalty.cast(FloatDType::F32).mul_scalar(self.orth_reg_weight),
            None => lm_loss,
        };
        CausalLmOutput { loss, logits }
    }

    /// Mean ‖P Pᵀ − I‖_F over every adapter A and B matrix.
    fn orth_penalty(&self) -> Option<Tensor<B, 1>> {
        if self.orth_reg_weight <= 0.0 {
            return None;
        }
        let adapters = self.adapters();
        let count = adapters.len();
        adapters
            .into_iter()
            .map(|(_, adapter)| adapter.orth_penalty())
            .reduce(|acc, p| acc + p)
            .map(|sum| sum.div_scalar((2 * count) as f64))
    }

    // ─── Adapters ─────────────────────────────────────────────────────────────

    /// Freeze every base parameter, then attach new trainable adapters
    /// to the configured projections of the configured layers.
    pub fn attach_adapters(self, config: &AdaLoraConfig, device: &B::Device) -> Result<Self> {
        let num_layers = self.layers.len();
        for &layer in &config.layers_to_transform {
            ensure!(layer < num_layers, "Layer {layer} does not exist, the model has {num_layers} layers");
        }
        for module in &config.target_modules {
            ensure!(
                ADAPTABLE_MODULES.contains(&module.as_str()),
                "Unknown target module '{module}', expected one of {ADAPTABLE_MODULES:?}"
            );
        }

        let mut model = self.no_grad();
        for &layer in &config.layers_to_transform {
            for (path, proj) in model.layers[layer].projections_mut() {
                let module = path.rsplit('.').next().unwrap_or(path);
                if config.targets_module(module) {
                    proj.attach(config, device);
                }
            }
        }
        model.orth_reg_weight = config.orth_reg_weight;
        Ok(model)
    }

    /// Attached adapters, keyed by module path.
    pub fn adapters(&self) -> Vec<(String, &SvdAdapter<B>)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| {
                layer.projections().into_iter().filter_map(move |(path, proj)| {
                    proj.adapter
                        .as_ref()
                        .map(|a| (format!("transformer.encoder.layers.{i}.{path}"), a))
                })
            })
            .collect()
    }

    pub fn adapter_count(&self) -> usize {
        self.adapters().len()
    }

    /// Zero the pruned singular values. Pattern keys are `<module path>.lora_E`.
    pub fn apply_rank_pattern(&mut self, pattern: &BTreeMap<String, Vec<bool>>) {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            for (path, proj) in layer.projections_mut() {
                let key = format!("transformer.encoder.layers.{i}.{path}.lora_E");
                if let (Some(adapter), Some(keep)) = (proj.adapter.as_mut(), pattern.get(&key)) {
                    adapter.mask_singular_values(keep);
                }
            }
        }
    }

    /// Host copies of adapter values, paired with gradients captured earlier.
    pub fn adapter_snapshots(&self, grads: &HashMap<String, AdapterGrads>) -> Result<Vec<AdapterSnapshot>> {
        self.adapters()
            .into_iter()
            .map(|(path, adapter)| {
                let g = grads.get(&path).cloned().unwrap_or_default();
                Ok(AdapterSnapshot {
                    name:   format!("{path}.lora_E"),
                    rank:   adapter.rank(),
                    a:      to_host_vec(adapter.lora_a.val())?,
                    a_grad: g.a,
                    e:      to_host_vec(adapter.lora_e.val())?,
                    e_grad: g.e,
                    b:      to_host_vec(adapter.lora_b.val())?,
                    b_grad: g.b,
                })
            })
            .collect()
    }

    // ─── Parameters ───────────────────────────────────────────────────────────

    /// Every parameter with its checkpoint name and trainable flag.
    pub fn named_parameters(&self) -> Vec<NamedParam<B>> {
        let mut params = vec![
            NamedParam::matrix("transformer.embedding.word_embeddings.weight", &self.word_embeddings.weight),
        ];
        for (i, layer) in self.layers.iter().enumerate() {
            let prefix = format!("transformer.encoder.layers.{i}");
            params.extend(layer.input_layernorm.named_parameters(&format!("{prefix}.input_layernorm")));
            params.extend(layer.post_attention_layernorm.named_parameters(&format!("{prefix}.post_attention_layernorm")));
            for (path, proj) in layer.projections() {
                params.extend(proj.named_parameters(&format!("{prefix}.{path}")));
            }
        }
        params.extend(self.final_layernorm.named_parameters("transformer.encoder.final_layernorm"));
        params.push(NamedParam::linear_weight("transformer.output_layer.weight", &self.output_layer.inner.weight));
        params
    }

    /// (trainable, total) element counts.
    pub fn parameter_counts(&self) -> (usize, usize) {
        self.named_parameters().iter().fold((0, 0), |(trainable, total), p| {
            let n = p.num_elements();
            (trainable + if p.trainable { n } else { 0 }, total + n)
        })
    }
}

impl<B: AutodiffBackend> CausalLm<B> {
    /// Copy adapter gradients to host memory before the optimizer consumes them.
    pub fn adapter_grads(&self, grads: &GradientsParams) -> Result<HashMap<String, AdapterGrads>> {
        let read = |id: &ParamId| -> Result<Option<Vec<f32>>> {
            grads
                .get::<B::InnerBackend, 2>(id.clone())
                .map(to_host_vec)
                .transpose()
        };
        self.adapters()
            .into_iter()
            .map(|(path, adapter)| {
                let g = AdapterGrads {
                    a: read(&adapter.lora_a.id)?,
                    e: read(&adapter.lora_e.id)?,
                    b: read(&adapter.lora_b.id)?,
                };
                Ok((path, g))
            })
            .collect()
    }

    /// Scale every adapter gradient by min(1, max_norm / ‖g‖), where ‖g‖
    /// is the L2 norm over all of them together. `max_norm` 0 disables.
    /// Returns the gradients and the norm before clipping.
    pub fn clip_grad_norm(&self, mut grads: GradientsParams, max_norm: f64) -> (GradientsParams, f64) {
        let ids: Vec<ParamId> = self
            .adapters()
            .into_iter()
            .flat_map(|(_, a)| [a.lora_a.id.clone(), a.lora_e.id.clone(), a.lora_b.id.clone()])
            .collect();

        let mut taken = Vec::with_capacity(ids.len());
        let mut sum_sq = 0.0_f64;
        for id in ids {
            if let Some(g) = grads.remove::<B::InnerBackend, 2>(id.clone()) {
                let sq = g.clone().cast(FloatDType::F32).powi_scalar(2).sum().into_scalar().elem::<f64>();
                sum_sq += sq;
                taken.push((id, g));
            }
        }

        let norm = sum_sq.sqrt();
        let coef = max_norm / (norm + 1e-6);
        let clip = max_norm > 0.0 && coef < 1.0;
        for (id, g) in taken {
            let g = if clip { g.mul_scalar(coef) } else { g };
            grads.register::<B::InnerBackend, 2>(id, g);
        }
        (grads, norm)
    }
}

fn load_linear<B: Backend>(
    linear:  &mut Linear<B>,
    weights: &mut WeightMap,
    prefix:  &str,
    device:  &B::Device,
) -> Result<()> {
    let [d_input, d_output] = linear.weight.shape().dims::<2>();
    let w = weights.take(&format!("{prefix}.weight"), &[d_output, d_input])?;
    linear.weight = Param::from_tensor(w.to_tensor::<B, 2>(device).transpose());
    if linear.bias.is_some() {
        let b = weights.take(&format!("{prefix}.bias"), &[d_output])?;
        linear.bias = Some(Param::from_tensor(b.to_tensor(device)));
    }
    Ok(())
}
