// ============================================================
// Layer 6: Tokenizer Store
// ============================================================
// Resolves the pad-token id the collator pads with. The dataset is
// already tokenized, so nothing else needs the tokenizer.
//
// ChatGLM2 ships a SentencePiece tokenizer.model and states
// `pad_token_id` in config.json; tokenizer.json is only read when
// the config leaves the id out.
//
// Pad id resolution order:
//   1. `pad_token_id` from the model's config.json
//   2. the tokenizer.json padding parameters
//   3. a `<pad>` or `[PAD]` token in its vocabulary
//   4. 0

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokenizers::Tokenizer;

const PAD_TOKENS: [&str; 2] = ["<pad>", "[PAD]"];

pub struct TokenizerStore {
    dir: PathBuf,
}

impl TokenizerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load `tokenizer.json` from the model directory
    pub fn load(&self) -> Result<Tokenizer> {
        let path = self.dir.join("tokenizer.json");
        Tokenizer::from_file(&path)
            .map_err(|e| anyhow::anyhow!(
                "Cannot load tokenizer from '{}': {}", path.display(), e
            ))
    }

    /// The config's pad id when present, otherwise the tokenizer's.
    pub fn resolve_pad_token_id(&self, configured: Option<u32>) -> Result<u32> {
        if let Some(id) = configured {
            return Ok(id);
        }
        let tokenizer = self
            .load()
            .context("config.json has no pad_token_id, tokenizer.json is needed to find it")?;
        Ok(Self::pad_token_id(&tokenizer))
    }

    /// Pad id from the tokenizer alone.
    pub fn pad_token_id(tokenizer: &Tokenizer) -> u32 {
        if let Some(padding) = tokenizer.get_padding() {
            return padding.pad_id;
        }
        if let Some(id) = PAD_TOKENS.iter().find_map(|t| tokenizer.token_to_id(t)) {
            return id;
        }
        tracing::warn!("Tokenizer defines no pad token, padding with id 0");
        0
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Minimal WordLevel tokenizer in HuggingFace JSON format.
    fn write_tokenizer(dir: &std::path::Path, pad_token: &str, padding: serde_json::Value) {
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": padding,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": { "<unk>": 0, "hello": 1, pad_token: 2, "world": 3 },
                "unk_token": "<unk>"
            }
        });
        std::fs::write(dir.join("tokenizer.json"), json.to_string()).unwrap();
    }

    #[test]
    fn test_pad_token_from_vocabulary() {
        let tmp = TempDir::new().unwrap();
        write_tokenizer(tmp.path(), "<pad>", serde_json::Value::Null);
        let tok = TokenizerStore::new(tmp.path()).load().unwrap();
        assert_eq!(TokenizerStore::pad_token_id(&tok), 2);
    }

    #[test]
    fn test_config_pad_id_takes_precedence() {
        let tmp = TempDir::new().unwrap();
        write_tokenizer(tmp.path(), "[PAD]", serde_json::Value::Null);
        let store = TokenizerStore::new(tmp.path());
        assert_eq!(store.resolve_pad_token_id(Some(7)).unwrap(), 7);
        assert_eq!(store.resolve_pad_token_id(None).unwrap(), 2);
    }

    #[test]
    fn test_config_pad_id_needs_no_tokenizer_json() {
        // a ChatGLM2 directory holds tokenizer.model only
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("tokenizer.model"), b"sentencepiece").unwrap();
        let store = TokenizerStore::new(tmp.path());
        assert_eq!(store.resolve_pad_token_id(Some(0)).unwrap(), 0);
        assert!(store.resolve_pad_token_id(None).is_err());
    }

    #[test]
    fn test_padding_params_before_vocabulary() {
        let tmp = TempDir::new().unwrap();
        let padding = serde_json::json!({
            "strategy": "BatchLongest",
            "direction": "Right",
            "pad_to_multiple_of": null,
            "pad_id": 3,
            "pad_type_id": 0,
            "pad_token": "world"
        });
        write_tokenizer(tmp.path(), "<pad>", padding);
        let tok = TokenizerStore::new(tmp.path()).load().unwrap();
        assert_eq!(TokenizerStore::pad_token_id(&tok), 3);
    }

    #[test]
    fn test_missing_tokenizer_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(TokenizerStore::new(tmp.path()).load().is_err());
    }
}
