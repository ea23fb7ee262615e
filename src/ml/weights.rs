// ============================================================
// Layer 5: Named Parameters and SafeTensors I/O
// ============================================================
// Burn records a module as one opaque tree. Base-model weights
// and adapter weights are exchanged with other tools by NAME
// instead (`transformer.encoder.layers.3.mlp.dense_h_to_4h.weight`),
// so this module gives every parameter a dotted name and reads /
// writes flat name → tensor maps in the safetensors format.
//
// Layout convention: on disk, linear weights are [out, in]
// (the layout HuggingFace checkpoints use). Burn's Linear stores
// [in, out], so linear weights are transposed at this boundary.
//
// Sharded checkpoints (`model.safetensors.index.json` naming one
// file per tensor) are merged into a single name → tensor map.
//
// Host transfer is lazy: a NamedParam holds a cheap tensor
// handle, and only `into_host` copies data off the device. That
// lets the caller filter on the trainable flag first so frozen
// base weights never leave the device when saving an adapter.

use anyhow::{anyhow, bail, ensure, Context, Result};
use burn::{module::Param, prelude::*, tensor::{bf16, f16}};
use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::Path,
};

pub const SAFETENSORS_NAME:       &str = "model.safetensors";
pub const SAFETENSORS_INDEX_NAME: &str = "model.safetensors.index.json";

// ─── NamedParam ───────────────────────────────────────────────────────────────
pub enum ParamTensor<B: Backend> {
    Vector(Tensor<B, 1>),
    Matrix(Tensor<B, 2>),
}

/// One model parameter with its dotted name and trainable flag.
pub struct NamedParam<B: Backend> {
    pub name:      String,
    pub trainable: bool,
    pub tensor:    ParamTensor<B>,
}

impl<B: Backend> NamedParam<B> {
    pub fn vector(name: impl Into<String>, param: &Param<Tensor<B, 1>>) -> Self {
        let tensor = param.val();
        Self {
            name:      name.into(),
            trainable: tensor.is_require_grad(),
            tensor:    ParamTensor::Vector(tensor),
        }
    }

    pub fn matrix(name: impl Into<String>, param: &Param<Tensor<B, 2>>) -> Self {
        let tensor = param.val();
        Self {
            name:      name.into(),
            trainable: tensor.is_require_grad(),
            tensor:    ParamTensor::Matrix(tensor),
        }
    }

    /// A Burn `Linear` weight, exposed in [out, in] layout.
    pub fn linear_weight(name: impl Into<String>, param: &Param<Tensor<B, 2>>) -> Self {
        let tensor = param.val();
        Self {
            name:      name.into(),
            trainable: tensor.is_require_grad(),
            tensor:    ParamTensor::Matrix(tensor.transpose()),
        }
    }

    pub fn num_elements(&self) -> usize {
        match &self.tensor {
            ParamTensor::Vector(t) => t.shape().num_elements(),
            ParamTensor::Matrix(t) => t.shape().num_elements(),
        }
    }

    /// Copy the parameter to host memory as f32.
    pub fn into_host(self) -> Result<(String, HostTensor)> {
        let data = match self.tensor {
            ParamTensor::Vector(t) => t.into_data(),
            ParamTensor::Matrix(t) => t.into_data(),
        };
        let shape  = data.shape.clone();
        let values = data
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("Cannot read parameter '{}': {e:?}", self.name))?;
        Ok((self.name, HostTensor { shape, values }))
    }
}

/// Copy any float tensor to host memory as f32.
pub fn to_host_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Cannot copy tensor to host: {e:?}"))
}

/// Keep only trainable parameters and copy them to host memory.
pub fn trainable_state<B: Backend>(params: Vec<NamedParam<B>>) -> Result<Vec<(String, HostTensor)>> {
    params
        .into_iter()
        .filter(|p| p.trainable)
        .map(NamedParam::into_host)
        .collect()
}

// ─── HostTensor ───────────────────────────────────────────────────────────────
/// A dense f32 tensor in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape:  Vec<usize>,
    pub values: Vec<f32>,
}

impl HostTensor {
    pub fn to_tensor<B: Backend, const D: usize>(&self, device: &B::Device) -> Tensor<B, D> {
        Tensor::from_data(TensorData::new(self.values.clone(), self.shape.clone()), device)
    }
}

// ─── Writing ──────────────────────────────────────────────────────────────────
/// Serialise `tensors` as safetensors (F32) to `path`.
pub fn write_safetensors(
    path:     &Path,
    tensors:  &[(String, HostTensor)],
    metadata: HashMap<String, String>,
) -> Result<()> {
    let bytes: Vec<(&str, &[u8], &[usize])> = tensors
        .iter()
        .map(|(name, t)| (name.as_str(), bytemuck::cast_slice::<f32, u8>(&t.values), t.shape.as_slice()))
        .collect();

    let mut views = Vec::with_capacity(bytes.len());
    for (name, data, shape) in bytes {
        let view = TensorView::new(Dtype::F32, shape.to_vec(), data)
            .map_err(|e| anyhow!("Invalid tensor '{name}': {e}"))?;
        views.push((name, view));
    }

    let serialized = safetensors::serialize(views, Some(metadata))
        .map_err(|e| anyhow!("SafeTensors serialisation failed: {e}"))?;

    fs::write(path, serialized)
        .with_context(|| format!("Cannot write '{}'", path.display()))?;
    Ok(())
}

// ─── Reading ──────────────────────────────────────────────────────────────────
/// Tensors read from a safetensors file, consumed by name.
#[derive(Debug, Default)]
pub struct WeightMap {
    tensors: HashMap<String, HostTensor>,
}

impl WeightMap {
    pub fn from_tensors(tensors: impl IntoIterator<Item = (String, HostTensor)>) -> Self {
        Self { tensors: tensors.into_iter().collect() }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Names not consumed yet, sorted.
    pub fn remaining(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tensors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop `name` if present. For checkpoint buffers the model recomputes.
    pub fn discard(&mut self, name: &str) -> bool {
        self.tensors.remove(name).is_some()
    }

    /// Remove and return `name`, checking its shape.
    pub fn take(&mut self, name: &str, expected: &[usize]) -> Result<HostTensor> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| anyhow!("Weight '{name}' missing from checkpoint"))?;
        if tensor.shape != expected {
            bail!("Weight '{name}' has shape {:?}, expected {:?}", tensor.shape, expected);
        }
        Ok(tensor)
    }
}

pub fn read_safetensors(path: &Path) -> Result<WeightMap> {
    let bytes = fs::read(path)
        .with_context(|| format!("Cannot read '{}'", path.display()))?;
    let st = SafeTensors::deserialize(&bytes)
        .map_err(|e| anyhow!("Cannot parse '{}': {e}", path.display()))?;

    let mut tensors = HashMap::new();
    for (name, view) in st.tensors() {
        let values = decode_f32(&name, &view)?;
        tensors.insert(name, HostTensor { shape: view.shape().to_vec(), values });
    }
    Ok(WeightMap { tensors })
}

/// `weight_map` of a sharded checkpoint: tensor name → shard file.
#[derive(Debug, Deserialize)]
struct ShardIndex {
    weight_map: BTreeMap<String, String>,
}

/// Read the base weights of a model directory: `model.safetensors`
/// when present, otherwise every shard listed in
/// `model.safetensors.index.json`.
pub fn read_pretrained_weights(dir: &Path) -> Result<WeightMap> {
    let single = dir.join(SAFETENSORS_NAME);
    if single.exists() {
        return read_safetensors(&single);
    }

    let index_path = dir.join(SAFETENSORS_INDEX_NAME);
    let text = fs::read_to_string(&index_path).with_context(|| {
        format!(
            "Neither '{SAFETENSORS_NAME}' nor '{SAFETENSORS_INDEX_NAME}' found in '{}'",
            dir.display()
        )
    })?;
    let index: ShardIndex = serde_json::from_str(&text)
        .with_context(|| format!("Cannot parse '{}'", index_path.display()))?;

    let shards: BTreeSet<&String> = index.weight_map.values().collect();
    let mut weights = WeightMap::default();
    for shard in shards {
        let part = read_safetensors(&dir.join(shard))?;
        tracing::info!("Read {} tensors from shard '{}'", part.len(), shard);
        weights.tensors.extend(part.tensors);
    }

    for name in index.weight_map.keys() {
        ensure!(
            weights.tensors.contains_key(name),
            "'{}' lists '{name}' but its shard does not contain it",
            index_path.display()
        );
    }
    Ok(weights)
}

fn decode_f32(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>> {
    let data = view.data();
    let values = match view.dtype() {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::BF16 => data
            .chunks_exact(2)
            .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        other => bail!("Weight '{name}' has unsupported dtype {other:?}"),
    };
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn test_trainable_state_filters_on_flag() {
        let device = Default::default();
        let frozen: Param<Tensor<TestBackend, 2>> =
            Param::from_tensor(Tensor::ones([2, 3], &device)).set_require_grad(false);
        let live: Param<Tensor<TestBackend, 1>> = Param::from_tensor(Tensor::zeros([4], &device));

        let params = vec![
            NamedParam::matrix("base.weight", &frozen),
            NamedParam::vector("adapter.lora_E", &live),
        ];
        assert!(!params[0].trainable);
        assert!(params[1].trainable);

        let state = trainable_state(params).unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].0, "adapter.lora_E");
        assert_eq!(state[0].1.shape, vec![4]);
    }

    #[test]
    fn test_linear_weight_is_exposed_out_by_in() {
        let device = Default::default();
        // Burn layout [in=2, out=3]
        let w: Param<Tensor<TestBackend, 2>> = Param::from_tensor(Tensor::from_floats(
            [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
            &device,
        ));
        let (_, host) = NamedParam::linear_weight("dense.weight", &w).into_host().unwrap();
        assert_eq!(host.shape, vec![3, 2]);
        assert_eq!(host.values, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_safetensors_file_preserves_names_and_shapes() {
        let tmp  = TempDir::new().unwrap();
        let path = tmp.path().join("weights.safetensors");

        let tensors = vec![
            ("a.lora_A".to_string(), HostTensor { shape: vec![2, 2], values: vec![0.5, -1.0, 2.0, 0.0] }),
            ("a.lora_E".to_string(), HostTensor { shape: vec![2, 1], values: vec![3.0, 0.0] }),
        ];
        write_safetensors(&path, &tensors, HashMap::new()).unwrap();

        let mut map = read_safetensors(&path).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.take("a.lora_E", &[2, 1]).unwrap().values, vec![3.0, 0.0]);
        assert!(map.take("a.lora_A", &[4]).is_err());
    }

    fn host(values: Vec<f32>) -> HostTensor {
        HostTensor { shape: vec![values.len()], values }
    }

    #[test]
    fn test_sharded_checkpoint_is_merged_through_index() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        write_safetensors(
            &dir.join("model-00001-of-00002.safetensors"),
            &[("transformer.embedding.word_embeddings.weight".to_string(), host(vec![1.0, 2.0]))],
            HashMap::new(),
        )
        .unwrap();
        write_safetensors(
            &dir.join("model-00002-of-00002.safetensors"),
            &[
                ("transformer.output_layer.weight".to_string(), host(vec![3.0])),
                ("transformer.rotary_pos_emb.inv_freq".to_string(), host(vec![1.0])),
            ],
            HashMap::new(),
        )
        .unwrap();
        let index = serde_json::json!({
            "metadata": { "total_size": 16 },
            "weight_map": {
                "transformer.embedding.word_embeddings.weight": "model-00001-of-00002.safetensors",
                "transformer.output_layer.weight": "model-00002-of-00002.safetensors",
                "transformer.rotary_pos_emb.inv_freq": "model-00002-of-00002.safetensors"
            }
        });
        fs::write(dir.join(SAFETENSORS_INDEX_NAME), index.to_string()).unwrap();

        let mut map = read_pretrained_weights(dir).unwrap();
        assert_eq!(map.len(), 3);
        assert!(map.discard("transformer.rotary_pos_emb.inv_freq"));
        assert!(!map.discard("transformer.rotary_pos_emb.inv_freq"));
        assert_eq!(map.take("transformer.output_layer.weight", &[1]).unwrap().values, vec![3.0]);
        assert_eq!(map.remaining(), vec!["transformer.embedding.word_embeddings.weight".to_string()]);
    }

    #[test]
    fn test_index_entry_without_tensor_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        write_safetensors(&dir.join("shard.safetensors"), &[("a".to_string(), host(vec![1.0]))], HashMap::new())
            .unwrap();
        let index = serde_json::json!({ "weight_map": { "a": "shard.safetensors", "b": "shard.safetensors" } });
        fs::write(dir.join(SAFETENSORS_INDEX_NAME), index.to_string()).unwrap();

        assert!(read_pretrained_weights(dir).is_err());
    }

    #[test]
    fn test_directory_without_weights_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(read_pretrained_weights(tmp.path()).is_err());
    }

    #[test]
    fn test_take_reports_missing_weight() {
        let mut map = WeightMap::default();
        let err = map.take("transformer.output_layer.weight", &[1]).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
