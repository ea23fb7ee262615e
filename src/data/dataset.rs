use burn::data::dataset::Dataset;

use crate::domain::example::TokenizedExample;

/// In-memory view over the pre-tokenized examples.
/// Implements Burn's Dataset trait so the DataLoader can index it.
pub struct InstructionDataset {
    examples: Vec<TokenizedExample>,
}

impl InstructionDataset {
    pub fn new(examples: Vec<TokenizedExample>) -> Self { Self { examples } }

    /// Length of the longest example, used to check the model's context window
    pub fn max_len(&self) -> usize {
        self.examples.iter().map(TokenizedExample::len).max().unwrap_or(0)
    }
}

impl Dataset<TokenizedExample> for InstructionDataset {
    fn get(&self, index: usize) -> Option<TokenizedExample> {
        self.examples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.examples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexing_and_len() {
        let ds = InstructionDataset::new(vec![
            TokenizedExample::new(vec![1, 2], vec![1, 2]),
            TokenizedExample::new(vec![3, 4, 5], vec![3, 4, 5]),
        ]);
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.max_len(), 3);
        assert_eq!(ds.get(1).unwrap().input_ids, vec![3, 4, 5]);
        assert!(ds.get(2).is_none());
    }
}
