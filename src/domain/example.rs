// ============================================================
// Layer 3: TokenizedExample Domain Type
// ============================================================
// One instruction-tuning example after tokenisation.
//
// The dataset on disk is already tokenised, so an example is
// just two parallel id sequences:
//   input_ids: prompt + response tokens fed to the model
//   labels:    the token the loss should predict at each position
//
// Both sequences must have the same length; the loader rejects
// examples that break this before they ever reach the collator.

use serde::{Deserialize, Serialize};

/// Value written into the label matrix for positions the loss must skip.
pub const IGNORE_INDEX: i64 = -100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub labels:    Vec<u32>,
}

impl TokenizedExample {
    pub fn new(input_ids: Vec<u32>, labels: Vec<u32>) -> Self {
        Self { input_ids, labels }
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// True when every position has exactly one label.
    pub fn is_aligned(&self) -> bool {
        self.input_ids.len() == self.labels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        assert!(TokenizedExample::new(vec![1, 2, 3], vec![4, 5, 6]).is_aligned());
        assert!(!TokenizedExample::new(vec![1, 2, 3], vec![4, 5]).is_aligned());
    }

    #[test]
    fn test_deserialises_from_dataset_row() {
        let row = r#"{"input_ids": [5, 6, 7], "labels": [0, 6, 7]}"#;
        let ex: TokenizedExample = serde_json::from_str(row).unwrap();
        assert_eq!(ex.len(), 3);
        assert_eq!(ex.labels, vec![0, 6, 7]);
    }
}
