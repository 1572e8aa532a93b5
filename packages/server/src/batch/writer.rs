//! Output side of the batch pipeline.

use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{error, info};

use crate::worker::BackgroundRunnable;

/// One serialized result, success or failure record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub line: String,
    pub failed: bool,
}

/// Appends lines in arrival order and logs progress on every tick.
pub struct OutputWriter {
    out: BufWriter<File>,
    written: u64,
    failed: u64,
    started: Instant,
    error: Option<std::io::Error>,
}

/// Counts reported once the writer has drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub written: u64,
    pub failed: u64,
}

impl OutputWriter {
    /// Creates or truncates `path`.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be created.
    pub async fn create(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path)
            .await
            .with_context(|| format!("creating output {}", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
            written: 0,
            failed: 0,
            started: Instant::now(),
            error: None,
        })
    }

    /// # Errors
    ///
    /// Returns the first write error, if any occurred.
    pub fn into_stats(self) -> anyhow::Result<WriterStats> {
        match self.error {
            Some(err) => Err(anyhow::Error::new(err).context("writing output")),
            None => Ok(WriterStats {
                written: self.written,
                failed: self.failed,
            }),
        }
    }

    async fn write(&mut self, line: &str) -> std::io::Result<()> {
        self.out.write_all(line.as_bytes()).await?;
        self.out.write_all(b"\n").await
    }
}

#[async_trait]
impl BackgroundRunnable for OutputWriter {
    type Task = OutputLine;

    async fn run(&mut self, task: OutputLine) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.write(&task.line).await {
            error!(error = %err, "output write failed; discarding further results");
            self.error = Some(err);
            return;
        }
        self.written += 1;
        if task.failed {
            self.failed += 1;
        }
    }

    async fn on_tick(&mut self) {
        info!(
            processed = self.written,
            failed = self.failed,
            elapsed_secs = self.started.elapsed().as_secs(),
            "batch progress"
        );
    }

    async fn shutdown(&mut self) {
        if self.error.is_none() {
            if let Err(err) = self.out.flush().await {
                self.error = Some(err);
            }
        }
    }
}
