// ============================================================
// Layer 6: Metrics Logger
// ============================================================
// Records training metrics to a CSV file at every logging step.
// Each run starts a fresh file; rows are appended as training goes.
//
// Metrics recorded per row:
//   - step:          optimizer steps completed so far
//   - epoch:         fractional epoch (1.5 = half way through epoch 2)
//   - loss:          mean training loss since the previous row
//   - grad_norm:     global adapter gradient norm before clipping
//   - learning_rate: rate used for the last optimizer step
//   - budget:        total singular triplets the adapters may keep
//
// Output file: {logging_dir}/metrics.csv
//
// Example CSV output:
//   step,epoch,loss,grad_norm,learning_rate,budget
//   500,0.250000,2.314500,0.873120,0.00004583,168
//   1000,0.500000,1.982100,0.641904,0.00004167,140
//
// How to read the metrics:
//   - loss should trend down
//   - budget falls from init_r × adapters to target_r × adapters
//     and then stays flat

use anyhow::{Context, Result};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use serde::{Deserialize, Serialize};

const CSV_HEADER: &str = "step,epoch,loss,grad_norm,learning_rate,budget";

/// One row of metrics for a logging step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step:          usize,
    pub epoch:         f64,
    pub loss:          f64,
    pub grad_norm:     f64,
    pub learning_rate: f64,
    pub budget:        usize,
}

/// Writes one run's step metrics to a CSV file, a row per logging step.
pub struct MetricsLogger {
    csv_path: PathBuf,
    writer:   BufWriter<File>,
}

impl MetricsLogger {
    /// Create `{dir}/metrics.csv`, replacing a previous run's file.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create logging dir '{}'", dir.display()))?;

        let csv_path = dir.join("metrics.csv");
        let file = File::create(&csv_path)
            .with_context(|| format!("Cannot create '{}'", csv_path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{CSV_HEADER}")?;
        tracing::debug!("Created metrics CSV: '{}'", csv_path.display());

        Ok(Self { csv_path, writer })
    }

    pub fn log(&mut self, m: &StepMetrics) -> Result<()> {
        writeln!(
            self.writer,
            "{},{:.6},{:.6},{:.6},{:.8},{}",
            m.step, m.epoch, m.loss, m.grad_norm, m.learning_rate, m.budget,
        )?;
        Ok(())
    }

    /// Flush buffered rows to disk.
    pub fn close(mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("Cannot flush '{}'", self.csv_path.display()))
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(step: usize, epoch: f64, loss: f64, learning_rate: f64) -> StepMetrics {
        StepMetrics { step, epoch, loss, grad_norm: 0.5, learning_rate, budget: 168 }
    }

    #[test]
    fn test_rows_follow_header() {
        let tmp = TempDir::new().unwrap();
        let mut logger = MetricsLogger::new(tmp.path().join("runs")).unwrap();
        let path = logger.csv_path().to_path_buf();

        logger.log(&row(10, 0.5, 1.25, 5e-5)).unwrap();
        logger.log(&StepMetrics { budget: 112, ..row(20, 1.0, 0.75, 0.0) }).unwrap();
        logger.close().unwrap();

        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "step,epoch,loss,grad_norm,learning_rate,budget");
        assert_eq!(lines[1], "10,0.500000,1.250000,0.500000,0.00005000,168");
        assert_eq!(lines[2], "20,1.000000,0.750000,0.500000,0.00000000,112");
    }

    #[test]
    fn test_new_run_replaces_previous_file() {
        let tmp = TempDir::new().unwrap();
        let mut first = MetricsLogger::new(tmp.path()).unwrap();
        first.log(&row(1, 0.1, 2.0, 1e-4)).unwrap();
        first.log(&row(2, 0.2, 1.9, 1e-4)).unwrap();
        first.close().unwrap();

        let mut second = MetricsLogger::new(tmp.path()).unwrap();
        second.log(&row(1, 0.1, 3.0, 1e-4)).unwrap();
        let path = second.csv_path().to_path_buf();
        second.close().unwrap();

        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("1,0.100000,3.000000,"));
    }
}
