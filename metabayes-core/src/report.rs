//! Result logging: console echo via tracing plus an append-only text file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;

/// Append-only experiment log. Every line is echoed to the console and,
/// when a log name is configured, appended to `<name>.out`.
#[derive(Debug, Clone)]
pub struct ResultLog {
    path: Option<PathBuf>,
}

impl ResultLog {
    pub fn new(log_name: Option<&str>) -> Self {
        Self {
            path: log_name.map(|name| PathBuf::from(format!("{name}.out"))),
        }
    }

    /// A log that only echoes to the console.
    pub fn console_only() -> Self {
        Self { path: None }
    }

    pub fn write(&self, line: &str) -> Result<()> {
        tracing::info!("{line}");
        if let Some(path) = &self.path {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening result log {}", path.display()))?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    /// Final summary lines: average test error percentage and runtime.
    pub fn write_final_result(
        &self,
        result_name: &str,
        test_acc: f64,
        runtime_secs: f64,
    ) -> Result<()> {
        self.write(&format!(
            "Run finished at: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ))?;
        self.write(&format!(
            "{result_name} Average Test Error: {:.3}%\t Runtime: {:.1} [sec]",
            100.0 * (1.0 - test_acc),
            runtime_secs
        ))
    }
}

/// Timestamped run name for log headers.
pub fn gen_run_name(prefix: &str) -> String {
    format!("{prefix} {}", Local::now().format("%Y-%m-%d %H:%M:%S"))
}

/// Per-batch status line shared by the training loops.
pub fn status_string(
    i_epoch: usize,
    num_epochs: usize,
    batch_idx: usize,
    n_batches: usize,
    objective: f64,
    batch_acc: f64,
) -> String {
    let progress = 100.0 * (i_epoch * n_batches + batch_idx) as f64
        / (n_batches.max(1) * num_epochs.max(1)) as f64;
    format!(
        "({progress:2.1}%)\tEpoch: {:3} \t Batch: {batch_idx:4} \t Objective: {objective:.4} \t Acc: {batch_acc:1.3}",
        i_epoch + 1
    )
}
