// ============================================================
// Layer 5: AdaLoRA Adapter Modules
// ============================================================
// AdaLoRA parameterises the update of a frozen projection W as
// an SVD-like triplet:
//
//   ΔW = B · diag(E) · A     A: [r, in]   E: [r, 1]   B: [out, r]
//
//   y = W x + dropout(x) · (A ⊙ E)ᵀ · Bᵀ · alpha / (r + 1e-5)
//
// E starts at zero so the adapted model is exactly the base
// model at step 0. The rank allocator later zeroes entries of E
// whose triplet is unimportant, shrinking the effective rank
// from `init_r` towards `target_r` without resizing anything.
//
// Reference: Zhang et al. (2023) AdaLoRA: Adaptive Budget
//            Allocation for Parameter-Efficient Fine-Tuning

use anyhow::{bail, ensure, Result};
use burn::{
    module::Param,
    nn::{Dropout, DropoutConfig, Linear},
    prelude::*,
    tensor::Distribution,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, ops::Range};

use super::weights::{HostTensor, NamedParam};

/// Layers the adapters are attached to by default.
pub const DEFAULT_LAYERS: Range<usize> = 14..28;
pub const DEFAULT_TARGET_MODULE: &str = "query_key_value";

const INIT_STD: f64 = 0.02;
const RANKNUM_EPS: f64 = 1e-5;

// ─── Configuration ────────────────────────────────────────────────────────────
/// Adapter hyperparameters. Serialised as `adapter_config.json`
/// next to the final adapter weights.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdaLoraConfig {
    pub peft_type:           String,
    pub task_type:           String,
    pub init_r:              usize,
    pub target_r:            usize,
    pub lora_alpha:          f64,
    pub lora_dropout:        f64,
    pub tinit:               usize,
    pub tfinal:              usize,
    #[serde(rename = "deltaT")]
    pub delta_t:             usize,
    pub beta1:               f64,
    pub beta2:               f64,
    pub orth_reg_weight:     f64,
    pub target_modules:      Vec<String>,
    pub layers_to_transform: Vec<usize>,
    pub total_step:          Option<usize>,
    pub rank_pattern:        Option<BTreeMap<String, Vec<bool>>>,
    pub inference_mode:      bool,
}

impl Default for AdaLoraConfig {
    fn default() -> Self {
        Self {
            peft_type:           "ADALORA".to_string(),
            task_type:           "CAUSAL_LM".to_string(),
            init_r:              12,
            target_r:            8,
            lora_alpha:          32.0,
            lora_dropout:        0.05,
            tinit:               0,
            tfinal:              0,
            delta_t:             1,
            beta1:               0.85,
            beta2:               0.85,
            orth_reg_weight:     0.5,
            target_modules:      vec![DEFAULT_TARGET_MODULE.to_string()],
            layers_to_transform: DEFAULT_LAYERS.collect(),
            total_step:          None,
            rank_pattern:        None,
            inference_mode:      false,
        }
    }
}

impl AdaLoraConfig {
    /// Default configuration whose final average rank is `target_r`.
    pub fn for_rank(target_r: usize) -> Self {
        Self { target_r, ..Self::default() }
    }

    pub fn with_total_step(mut self, total_step: usize) -> Self {
        self.total_step = Some(total_step);
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.target_r > 0, "target_r must be positive");
        ensure!(
            self.init_r >= self.target_r,
            "init_r ({}) must be at least target_r ({})",
            self.init_r, self.target_r
        );
        ensure!(self.delta_t > 0, "deltaT must be positive");
        ensure!((0.0..1.0).contains(&self.beta1), "beta1 must lie in [0, 1)");
        ensure!((0.0..1.0).contains(&self.beta2), "beta2 must lie in [0, 1)");
        ensure!((0.0..1.0).contains(&self.lora_dropout), "lora_dropout must lie in [0, 1)");
        ensure!(!self.target_modules.is_empty(), "no target modules configured");
        ensure!(!self.layers_to_transform.is_empty(), "no layers to transform");

        let Some(total_step) = self.total_step else {
            bail!("total_step must be set before training");
        };
        ensure!(
            self.tinit + self.tfinal < total_step,
            "tinit ({}) + tfinal ({}) leaves no budgeting phase in {} steps",
            self.tinit, self.tfinal, total_step
        );
        Ok(())
    }

    pub fn targets_module(&self, module: &str) -> bool {
        self.target_modules.iter().any(|m| m == module)
    }
}

// ─── SvdAdapter ───────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct SvdAdapter<B: Backend> {
    pub lora_a:  Param<Tensor<B, 2>>,
    pub lora_e:  Param<Tensor<B, 2>>,
    pub lora_b:  Param<Tensor<B, 2>>,
    pub dropout: Dropout,
    pub scaling: f64,
    pub ranknum: f64,
}

impl<B: Backend> SvdAdapter<B> {
    pub fn new(d_input: usize, d_output: usize, config: &AdaLoraConfig, device: &B::Device) -> Self {
        let r    = config.init_r;
        let init = Distribution::Normal(0.0, INIT_STD);
        let lora_a = Tensor::random([r, d_input], init, device);
        let lora_e = Tensor::zeros([r, 1], device);
        let lora_b = Tensor::random([d_output, r], init, device);
        let scaling = if config.lora_alpha > 0.0 { config.lora_alpha } else { r as f64 };

        Self {
            lora_a:  Param::from_tensor(lora_a),
            lora_e:  Param::from_tensor(lora_e),
            lora_b:  Param::from_tensor(lora_b),
            dropout: DropoutConfig::new(config.lora_dropout).init(),
            scaling,
            ranknum: r as f64,
        }
    }

    pub fn rank(&self) -> usize {
        self.lora_e.shape().dims::<2>()[0]
    }

    pub fn d_input(&self) -> usize {
        self.lora_a.shape().dims::<2>()[1]
    }

    pub fn d_output(&self) -> usize {
        self.lora_b.shape().dims::<2>()[0]
    }

    /// x: [batch, seq_len, in] → Δy: [batch, seq_len, out]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let a_scaled = self.lora_a.val() * self.lora_e.val(); // [r, in]
        self.dropout
            .forward(x)
            .matmul(a_scaled.transpose().unsqueeze())
            .matmul(self.lora_b.val().transpose().unsqueeze())
            .mul_scalar(self.scaling / (self.ranknum + RANKNUM_EPS))
    }

    /// ‖A Aᵀ − I‖_F + ‖Bᵀ B − I‖_F
    pub fn orth_penalty(&self) -> Tensor<B, 1> {
        let a = self.lora_a.val();
        let b = self.lora_b.val();
        frobenius_from_identity(a.clone().matmul(a.transpose()))
            + frobenius_from_identity(b.clone().transpose().matmul(b))
    }

    /// Zero every entry of E whose `keep` flag is false.
    pub fn mask_singular_values(&mut self, keep: &[bool]) {
        let values: Vec<f32> = keep.iter().map(|&k| if k { 1.0 } else { 0.0 }).collect();
        let e = self.lora_e.val();
        let device = e.device();
        let mask = Tensor::<B, 1>::from_floats(values.as_slice(), &device).reshape([keep.len(), 1]);
        let masked = (e.detach() * mask).require_grad();
        self.lora_e = Param::initialized(self.lora_e.id.clone(), masked);
    }
}

fn frobenius_from_identity<B: Backend>(m: Tensor<B, 2>) -> Tensor<B, 1> {
    let [n, _] = m.dims();
    let eye = Tensor::<B, 2>::eye(n, &m.device());
    (m - eye).powf_scalar(2.0).sum().sqrt()
}

// ─── AdaptedLinear ────────────────────────────────────────────────────────────
/// A projection that may carry an adapter. Without one it is a plain `Linear`.
#[derive(Module, Debug)]
pub struct AdaptedLinear<B: Backend> {
    pub base:    Linear<B>,
    pub adapter: Option<SvdAdapter<B>>,
}

impl<B: Backend> AdaptedLinear<B> {
    pub fn new(base: Linear<B>) -> Self {
        Self { base, adapter: None }
    }

    /// [in, out] in Burn's layout
    pub fn dims(&self) -> [usize; 2] {
        self.base.weight.shape().dims::<2>()
    }

    pub fn attach(&mut self, config: &AdaLoraConfig, device: &B::Device) {
        let [d_input, d_output] = self.dims();
        self.adapter = Some(SvdAdapter::new(d_input, d_output, config, device));
    }

    /// `<prefix>.weight`, `<prefix>.bias`, then `<prefix>.lora_{A,E,B}`
    pub fn named_parameters(&self, prefix: &str) -> Vec<NamedParam<B>> {
        let mut params = vec![NamedParam::linear_weight(format!("{prefix}.weight"), &self.base.weight)];
        if let Some(bias) = &self.base.bias {
            params.push(NamedParam::vector(format!("{prefix}.bias"), bias));
        }
        if let Some(adapter) = &self.adapter {
            params.push(NamedParam::matrix(format!("{prefix}.lora_A"), &adapter.lora_a));
            params.push(NamedParam::matrix(format!("{prefix}.lora_E"), &adapter.lora_e));
            params.push(NamedParam::matrix(format!("{prefix}.lora_B"), &adapter.lora_b));
        }
        params
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match &self.adapter {
            Some(adapter) => self.base.forward(x.clone()) + adapter.forward(x),
            None => self.base.forward(x),
        }
    }
}

// ─── Rank-pattern resizing ────────────────────────────────────────────────────
/// Drop the pruned triplets from an adapter state dict so each
/// adapter is stored at its final rank. Tensors are matched to a
/// pattern entry `<module>.lora_E` by their `<module>.lora_{A,E,B}`
/// suffix; anything else passes through untouched.
pub fn resize_by_rank_pattern(
    tensors: Vec<(String, HostTensor)>,
    pattern: &BTreeMap<String, Vec<bool>>,
) -> Result<Vec<(String, HostTensor)>> {
    tensors
        .into_iter()
        .map(|(name, tensor)| {
            let Some((module, kind)) = split_adapter_name(&name) else {
                return Ok((name, tensor));
            };
            let keep = pattern.iter().find_map(|(key, keep)| {
                let target = key.trim_end_matches(".lora_E");
                let hit = module == target || module.ends_with(&format!(".{target}"));
                hit.then_some(keep)
            });
            let Some(keep) = keep else {
                return Ok((name, tensor));
            };
            let resized = match kind {
                "lora_A" | "lora_E" => keep_rows(&name, tensor, keep)?,
                _ => keep_cols(&name, tensor, keep)?,
            };
            Ok((name, resized))
        })
        .collect()
}

fn split_adapter_name(name: &str) -> Option<(&str, &str)> {
    let (module, kind) = name.rsplit_once('.')?;
    matches!(kind, "lora_A" | "lora_E" | "lora_B").then_some((module, kind))
}

fn keep_rows(name: &str, t: HostTensor, keep: &[bool]) -> Result<HostTensor> {
    ensure!(t.shape.len() == 2 && t.shape[0] == keep.len(), "'{name}' does not match its rank pattern");
    let cols = t.shape[1];
    let values: Vec<f32> = t
        .values
        .chunks_exact(cols)
        .zip(keep)
        .filter(|(_, &k)| k)
        .flat_map(|(row, _)| row.iter().copied())
        .collect();
    let rows = keep.iter().filter(|&&k| k).count();
    Ok(HostTensor { shape: vec![rows, cols], values })
}

fn keep_cols(name: &str, t: HostTensor, keep: &[bool]) -> Result<HostTensor> {
    ensure!(t.shape.len() == 2 && t.shape[1] == keep.len(), "'{name}' does not match its rank pattern");
    let cols = keep.iter().filter(|&&k| k).count();
    let values: Vec<f32> = t
        .values
        .chunks_exact(keep.len())
        .flat_map(|row| row.iter().zip(keep).filter(|(_, &k)| k).map(|(v, _)| *v))
        .collect();
    Ok(HostTensor { shape: vec![t.shape[0], cols], values })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::LinearConfig;

    type TestBackend = NdArray;

    #[test]
    fn test_default_config_targets_query_key_value_in_upper_layers() {
        let cfg = AdaLoraConfig::for_rank(8);
        assert_eq!(cfg.init_r, 12);
        assert_eq!(cfg.target_r, 8);
        assert_eq!(cfg.layers_to_transform, (14..28).collect::<Vec<_>>());
        assert!(cfg.targets_module("query_key_value"));
        assert!(!cfg.targets_module("dense"));
    }

    #[test]
    fn test_validate_requires_total_step() {
        let cfg = AdaLoraConfig::for_rank(8);
        assert!(cfg.validate().is_err());
        assert!(cfg.with_total_step(100).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_target_above_init() {
        let cfg = AdaLoraConfig::for_rank(16).with_total_step(100);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_json_uses_delta_t_key() {
        let json = serde_json::to_value(AdaLoraConfig::default()).unwrap();
        assert_eq!(json["deltaT"], 1);
        assert_eq!(json["peft_type"], "ADALORA");
    }

    #[test]
    fn test_fresh_adapter_leaves_output_unchanged() {
        let device = Default::default();
        let cfg = AdaLoraConfig { lora_dropout: 0.0, ..AdaLoraConfig::for_rank(2) };
        let mut linear = AdaptedLinear::<TestBackend>::new(LinearConfig::new(6, 4).init(&device));
        let x = Tensor::<TestBackend, 3>::random([2, 3, 6], Distribution::Default, &device);
        let before = linear.forward(x.clone());

        linear.attach(&cfg, &device);
        let adapter = linear.adapter.as_ref().unwrap();
        assert_eq!(adapter.rank(), 12);
        assert_eq!(adapter.d_input(), 6);
        assert_eq!(adapter.d_output(), 4);

        let after  = linear.forward(x).into_data().to_vec::<f32>().unwrap();
        let before = before.into_data().to_vec::<f32>().unwrap();
        for (a, b) in after.iter().zip(&before) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_orth_penalty_is_zero_for_orthonormal_factors() {
        let device = Default::default();
        let cfg = AdaLoraConfig { init_r: 2, target_r: 1, ..AdaLoraConfig::default() };
        let mut adapter = SvdAdapter::<TestBackend>::new(3, 3, &cfg, &device);
        adapter.lora_a = Param::from_tensor(Tensor::from_floats([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]], &device));
        adapter.lora_b = Param::from_tensor(Tensor::from_floats([[1.0, 0.0], [0.0, 1.0], [0.0, 0.0]], &device));
        let penalty: f32 = adapter.orth_penalty().into_scalar();
        assert!(penalty.abs() < 1e-6);
    }

    #[test]
    fn test_mask_zeroes_pruned_singular_values_and_keeps_param_id() {
        type B = Autodiff<NdArray>;
        let device = Default::default();
        let cfg = AdaLoraConfig { init_r: 3, target_r: 1, ..AdaLoraConfig::default() };
        let mut adapter = SvdAdapter::<B>::new(2, 2, &cfg, &device);
        adapter.lora_e = Param::from_tensor(Tensor::from_floats([[1.0], [2.0], [3.0]], &device));
        let id = adapter.lora_e.id.clone();

        adapter.mask_singular_values(&[true, false, true]);

        assert_eq!(adapter.lora_e.id, id);
        assert!(adapter.lora_e.val().is_require_grad());
        let values = adapter.lora_e.val().into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![1.0, 0.0, 3.0]);
    }

    #[test]
    fn test_resize_by_rank_pattern_drops_pruned_triplets() {
        let mut pattern = BTreeMap::new();
        pattern.insert("layers.0.qkv.lora_E".to_string(), vec![true, false, true]);

        let tensors = vec![
            ("base_model.model.layers.0.qkv.lora_A".to_string(),
             HostTensor { shape: vec![3, 2], values: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0] }),
            ("base_model.model.layers.0.qkv.lora_E".to_string(),
             HostTensor { shape: vec![3, 1], values: vec![0.1, 0.0, 0.3] }),
            ("base_model.model.layers.0.qkv.lora_B".to_string(),
             HostTensor { shape: vec![1, 3], values: vec![7.0, 8.0, 9.0] }),
        ];

        let resized = resize_by_rank_pattern(tensors, &pattern).unwrap();
        assert_eq!(resized[0].1, HostTensor { shape: vec![2, 2], values: vec![1.0, 2.0, 5.0, 6.0] });
        assert_eq!(resized[1].1, HostTensor { shape: vec![2, 1], values: vec![0.1, 0.3] });
        assert_eq!(resized[2].1, HostTensor { shape: vec![1, 2], values: vec![7.0, 9.0] });
    }
}
