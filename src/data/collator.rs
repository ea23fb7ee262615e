// ============================================================
// Layer 4: Causal-LM Data Collator
// ============================================================
// Turns a list of variable-length tokenized examples into one
// rectangular batch.
//
// Padding policy:
//   - every row is right-padded with the pad-token id up to the
//     longest input_ids in THIS batch (dynamic padding, so short
//     batches stay short)
//   - label positions that must not contribute to the loss are
//     replaced by IGNORE_INDEX (-100)
//
// Which label positions are masked is a LabelMasking choice:
//   PadValue    → any label equal to the pad id is masked.
//                 A genuine token that shares the pad id is lost.
//   PaddingOnly → only positions added by padding are masked.
//
// Example (pad id 0, PadValue):
//   input_ids [5 6 7 8 9]  labels [0 0 7 8 9]
//   input_ids [1 2 3]      labels [0 2 3]
//   ─────────────────────────────────────────────
//   input_ids [[5 6 7 8 9] [1 2 3 0 0]]
//   labels    [[-100 -100 7 8 9] [-100 2 3 -100 -100]]
//
// The padding itself is a plain function over Vecs so it can be
// tested without a backend; DataCollator wraps it in Burn's
// Batcher trait and moves the result onto the training device.

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
};
use serde::{Deserialize, Serialize};

use crate::domain::example::{TokenizedExample, IGNORE_INDEX};

// ─── LabelMasking ─────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelMasking {
    /// Mask every label whose value equals the pad id.
    #[default]
    PadValue,
    /// Mask only the positions introduced by padding.
    PaddingOnly,
}

// ─── PaddedBatch ──────────────────────────────────────────────────────────────
/// Host-side padded batch. Rows all have length `seq_len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedBatch {
    pub input_ids: Vec<Vec<i64>>,
    pub labels:    Vec<Vec<i64>>,
    pub seq_len:   usize,
}

impl PaddedBatch {
    pub fn batch_size(&self) -> usize {
        self.input_ids.len()
    }

    /// Number of label positions that will contribute to the loss.
    pub fn supervised_positions(&self) -> usize {
        self.labels
            .iter()
            .flatten()
            .filter(|&&l| l != IGNORE_INDEX)
            .count()
    }
}

/// Pad `features` to the longest example and mask the labels.
pub fn collate(
    features:     &[TokenizedExample],
    pad_token_id: u32,
    masking:      LabelMasking,
) -> PaddedBatch {
    let longest = features.iter().map(TokenizedExample::len).max().unwrap_or(0);
    let pad     = pad_token_id as i64;

    let mut input_ids = Vec::with_capacity(features.len());
    let mut labels    = Vec::with_capacity(features.len());

    for f in features {
        let pad_len = longest - f.input_ids.len();

        let mut ids: Vec<i64> = f.input_ids.iter().map(|&t| t as i64).collect();
        ids.extend(std::iter::repeat(pad).take(pad_len));

        let label: Vec<i64> = match masking {
            LabelMasking::PadValue => f.labels
                .iter()
                .map(|&l| l as i64)
                .chain(std::iter::repeat(pad).take(pad_len))
                .map(|l| if l == pad { IGNORE_INDEX } else { l })
                .collect(),
            LabelMasking::PaddingOnly => f.labels
                .iter()
                .map(|&l| l as i64)
                .chain(std::iter::repeat(IGNORE_INDEX).take(pad_len))
                .collect(),
        };

        input_ids.push(ids);
        labels.push(label);
    }

    PaddedBatch { input_ids, labels, seq_len: longest }
}

// ─── CausalLmBatch ────────────────────────────────────────────────────────────
/// A collated batch on the training device.
#[derive(Debug, Clone)]
pub struct CausalLmBatch<B: Backend> {
    /// Token ids, shape [batch_size, seq_len]
    pub input_ids: Tensor<B, 2, Int>,

    /// Targets aligned with input_ids, -100 where the loss is skipped
    pub labels: Tensor<B, 2, Int>,
}

impl<B: Backend> CausalLmBatch<B> {
    pub fn from_padded(batch: &PaddedBatch, device: &B::Device) -> Self {
        let shape = [batch.batch_size(), batch.seq_len];

        let ids_flat: Vec<i32> = batch.input_ids.iter().flatten().map(|&x| x as i32).collect();
        let lbl_flat: Vec<i32> = batch.labels.iter().flatten().map(|&x| x as i32).collect();

        let input_ids = Tensor::<B, 1, Int>::from_ints(ids_flat.as_slice(), device).reshape(shape);
        let labels    = Tensor::<B, 1, Int>::from_ints(lbl_flat.as_slice(), device).reshape(shape);

        Self { input_ids, labels }
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.dims()[1]
    }
}

// ─── DataCollator ─────────────────────────────────────────────────────────────
/// Burn Batcher that pads on the host, then uploads to `device`.
#[derive(Clone, Debug)]
pub struct DataCollator<B: Backend> {
    pub device:       B::Device,
    pub pad_token_id: u32,
    pub masking:      LabelMasking,
}

impl<B: Backend> DataCollator<B> {
    pub fn new(device: B::Device, pad_token_id: u32, masking: LabelMasking) -> Self {
        Self { device, pad_token_id, masking }
    }
}

impl<B: Backend> Batcher<B, TokenizedExample, CausalLmBatch<B>> for DataCollator<B> {
    fn batch(&self, items: Vec<TokenizedExample>, _device: &B::Device) -> CausalLmBatch<B> {
        let padded = collate(&items, self.pad_token_id, self.masking);
        let batch  = CausalLmBatch::from_padded(&padded, &self.device);
        tracing::debug!(
            "batch {} x {} ({} supervised positions)",
            padded.batch_size(), batch.seq_len(), padded.supervised_positions()
        );
        batch
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::NdArray;

    fn ex(ids: &[u32], labels: &[u32]) -> TokenizedExample {
        TokenizedExample::new(ids.to_vec(), labels.to_vec())
    }

    #[test]
    fn test_pads_to_longest_in_batch() {
        let batch = collate(
            &[ex(&[5, 6, 7, 8, 9], &[5, 6, 7, 8, 9]), ex(&[1, 2, 3], &[1, 2, 3])],
            0,
            LabelMasking::PadValue,
        );

        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.seq_len, 5);
        assert_eq!(batch.input_ids[1], vec![1, 2, 3, 0, 0]);
        assert_eq!(batch.labels[1], vec![1, 2, 3, -100, -100]);
    }

    #[test]
    fn test_original_ids_are_a_prefix_of_each_row() {
        let features = vec![ex(&[4], &[4]), ex(&[9, 9, 9, 9], &[9, 9, 9, 9]), ex(&[2, 3], &[2, 3])];
        let batch    = collate(&features, 1, LabelMasking::PadValue);

        for (row, f) in batch.input_ids.iter().zip(&features) {
            assert_eq!(row.len(), 4);
            let prefix: Vec<i64> = f.input_ids.iter().map(|&t| t as i64).collect();
            assert_eq!(&row[..prefix.len()], prefix.as_slice());
            assert!(row[prefix.len()..].iter().all(|&t| t == 1));
        }
    }

    #[test]
    fn test_pad_valued_labels_are_masked_by_value() {
        // Prompt tokens were labelled with the pad id so they are skipped.
        let batch = collate(&[ex(&[10, 11, 12], &[0, 0, 12])], 0, LabelMasking::PadValue);
        assert_eq!(batch.labels[0], vec![-100, -100, 12]);
        assert_eq!(batch.supervised_positions(), 1);
    }

    #[test]
    fn test_genuine_pad_valued_label_is_lost_under_pad_value() {
        let batch = collate(&[ex(&[3, 0, 4], &[3, 0, 4])], 0, LabelMasking::PadValue);
        assert_eq!(batch.labels[0], vec![3, -100, 4]);
    }

    #[test]
    fn test_padding_only_keeps_genuine_pad_valued_labels() {
        let batch = collate(
            &[ex(&[3, 0, 4], &[3, 0, 4]), ex(&[7], &[7])],
            0,
            LabelMasking::PaddingOnly,
        );
        assert_eq!(batch.labels[0], vec![3, 0, 4]);
        assert_eq!(batch.labels[1], vec![7, -100, -100]);
    }

    #[test]
    fn test_non_pad_labels_pass_through() {
        let batch = collate(&[ex(&[1, 2], &[8, 9])], 0, LabelMasking::PadValue);
        assert_eq!(batch.labels[0], vec![8, 9]);
    }

    #[test]
    fn test_batcher_builds_device_tensors() {
        let device   = Default::default();
        let collator = DataCollator::<TestBackend>::new(device, 0, LabelMasking::PadValue);

        let batch = collator.batch(
            vec![ex(&[5, 6, 7, 8, 9], &[0, 6, 7, 8, 9]), ex(&[1, 2, 3], &[1, 2, 3])],
            &Default::default(),
        );

        assert_eq!(batch.input_ids.dims(), [2, 5]);
        assert_eq!(batch.labels.dims(), [2, 5]);
        assert_eq!(batch.seq_len(), 5);

        let ids = batch.input_ids.into_data().convert::<i64>().to_vec::<i64>().unwrap();
        let lbl = batch.labels.into_data().convert::<i64>().to_vec::<i64>().unwrap();
        assert_eq!(ids, vec![5, 6, 7, 8, 9, 1, 2, 3, 0, 0]);
        assert_eq!(lbl, vec![-100, 6, 7, 8, 9, 1, 2, 3, -100, -100]);
    }
}
