// ============================================================
// Layer 4: Dataset Loader
// ============================================================
// Reads a pre-tokenized dataset from disk.
//
// On-disk format: JSON Lines. Each non-blank line is one object
//   {"input_ids": [..], "labels": [..]}
//
// The dataset path may be a single .jsonl file or a directory;
// for a directory every *.jsonl file is read in name order so
// the example order is stable between runs.
//
// Unlike a best-effort document loader, a bad row is fatal here:
// a misaligned example would silently corrupt the loss, so the
// whole load fails with the file and line in the error.

use anyhow::{bail, Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::domain::example::TokenizedExample;
use crate::domain::traits::ExampleSource;

/// Loads pre-tokenized examples from JSON Lines files.
pub struct JsonlLoader {
    path: PathBuf,
}

impl JsonlLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The files this loader will read, in read order.
    fn files(&self) -> Result<Vec<PathBuf>> {
        if self.path.is_file() {
            return Ok(vec![self.path.clone()]);
        }

        let entries = fs::read_dir(&self.path)
            .with_context(|| format!("Cannot read dataset directory '{}'", self.path.display()))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                files.push(path);
            }
        }
        files.sort();

        if files.is_empty() {
            bail!("No .jsonl files found in '{}'", self.path.display());
        }
        Ok(files)
    }
}

impl ExampleSource for JsonlLoader {
    fn load_all(&self) -> Result<Vec<TokenizedExample>> {
        let mut examples = Vec::new();

        for file in self.files()? {
            let before = examples.len();
            load_jsonl_file(&file, &mut examples)?;
            tracing::debug!(
                "Loaded {} examples from '{}'",
                examples.len() - before,
                file.display()
            );
        }

        Ok(examples)
    }
}

/// Parse one JSON Lines file, appending its examples to `out`.
fn load_jsonl_file(path: &Path, out: &mut Vec<TokenizedExample>) -> Result<()> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Cannot read '{}'", path.display()))?;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }

        let example: TokenizedExample = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: malformed example", path.display(), line_no))?;

        if example.is_empty() {
            bail!("{}:{}: example has no tokens", path.display(), line_no);
        }
        if !example.is_aligned() {
            bail!(
                "{}:{}: {} input ids but {} labels",
                path.display(),
                line_no,
                example.input_ids.len(),
                example.labels.len()
            );
        }

        out.push(example);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_reads_directory_in_name_order() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "b.jsonl", "{\"input_ids\":[3],\"labels\":[3]}\n");
        write(tmp.path(), "a.jsonl", "{\"input_ids\":[1,2],\"labels\":[0,2]}\n\n");
        write(tmp.path(), "notes.txt", "ignored");

        let examples = JsonlLoader::new(tmp.path()).load_all().unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].input_ids, vec![1, 2]);
        assert_eq!(examples[1].input_ids, vec![3]);
    }

    #[test]
    fn test_reads_single_file() {
        let tmp  = TempDir::new().unwrap();
        let file = write(tmp.path(), "train.jsonl", "{\"input_ids\":[7,8],\"labels\":[7,8]}");
        let examples = JsonlLoader::new(file).load_all().unwrap();
        assert_eq!(examples, vec![TokenizedExample::new(vec![7, 8], vec![7, 8])]);
    }

    #[test]
    fn test_rejects_misaligned_labels() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "train.jsonl", "{\"input_ids\":[1,2,3],\"labels\":[1,2]}\n");
        let err = JsonlLoader::new(tmp.path()).load_all().unwrap_err();
        assert!(err.to_string().contains("3 input ids but 2 labels"));
    }

    #[test]
    fn test_rejects_empty_example() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "train.jsonl", "{\"input_ids\":[],\"labels\":[]}\n");
        assert!(JsonlLoader::new(tmp.path()).load_all().is_err());
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(JsonlLoader::new(tmp.path().join("absent")).load_all().is_err());
    }

    #[test]
    fn test_directory_without_jsonl_is_an_error() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "dataset_info.json", "{}");
        assert!(JsonlLoader::new(tmp.path()).load_all().is_err());
    }
}
