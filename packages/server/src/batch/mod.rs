//! File-driven batch pipeline.
//!
//! ```text
//! reader ──▶ work queue (2×workers) ──▶ N workers ──▶ output queue (2×workers) ──▶ writer
//! ```
//!
//! The reader closes the work queue at end of input; workers drain it and
//! drop their output senders; the writer drains the output queue and
//! flushes. Every non-blank input line produces exactly one output line,
//! either a response or a failure record. Output order is arrival order.

pub mod client;
pub mod reader;
pub mod worker;
pub mod writer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::info;

pub use client::{HttpPredictorClient, PredictorClient, RpcPredictorClient, TransportError};
pub use reader::{Element, WorkItem};
pub use worker::{BatchWorker, RequestShape, RetryPolicy};
pub use writer::{OutputLine, OutputWriter, WriterStats};

use crate::service::Method;
use crate::worker::BackgroundWorker;

/// How each input line is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DataType {
    /// A JSON array row; rows can be combined into mini-batches.
    Data,
    /// A complete request envelope or feedback document.
    Json,
    /// Sent as `strData`.
    Str,
}

/// Payload variant used for `data` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PayloadType {
    Ndarray,
    Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BatchMethod {
    Predict,
    Feedback,
}

impl BatchMethod {
    #[must_use]
    pub fn method(self) -> Method {
        match self {
            Self::Predict => Method::Predict,
            Self::Feedback => Method::SendFeedback,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    Http,
    Rpc,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "predictor-batch", about = "Send a file of requests through a predictor")]
pub struct BatchArgs {
    #[arg(short, long, env = "PREDICTOR_BATCH_INPUT")]
    pub input: PathBuf,

    #[arg(short, long, env = "PREDICTOR_BATCH_OUTPUT")]
    pub output: PathBuf,

    #[arg(short, long, env = "PREDICTOR_BATCH_WORKERS", default_value_t = 100)]
    pub workers: usize,

    /// Extra attempts after a transient failure.
    #[arg(short, long, env = "PREDICTOR_BATCH_RETRIES", default_value_t = 3)]
    pub retries: u32,

    /// Lines per call; above 1 only for `--data-type data`.
    #[arg(short = 'u', long, env = "PREDICTOR_BATCH_SIZE", default_value_t = 1)]
    pub batch_size: usize,

    #[arg(short, long, value_enum, default_value_t = DataType::Data)]
    pub data_type: DataType,

    #[arg(short, long, value_enum, default_value_t = PayloadType::Ndarray)]
    pub payload_type: PayloadType,

    #[arg(short, long, value_enum, default_value_t = BatchMethod::Predict)]
    pub method: BatchMethod,

    #[arg(short, long, value_enum, default_value_t = TransportKind::Http)]
    pub transport: TransportKind,

    #[arg(long, env = "PREDICTOR_BATCH_HOST", default_value = "localhost")]
    pub host: String,

    /// Defaults to 9000 for HTTP and 5000 for RPC.
    #[arg(long, env = "PREDICTOR_BATCH_PORT")]
    pub port: Option<u16>,

    /// Log total wall time at the end.
    #[arg(short, long)]
    pub benchmark: bool,

    /// Per-call timeout in seconds.
    #[arg(long, env = "PREDICTOR_BATCH_CALL_TIMEOUT", default_value_t = 60)]
    pub call_timeout_secs: u64,

    #[arg(long, env = "PREDICTOR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl BatchArgs {
    /// # Errors
    ///
    /// Rejects combinations the pipeline cannot run.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            bail!("--workers must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("--batch-size must be at least 1");
        }
        if self.batch_size > 1 && self.data_type != DataType::Data {
            bail!("--batch-size above 1 requires --data-type data");
        }
        if self.method == BatchMethod::Feedback && self.data_type != DataType::Json {
            bail!("--method feedback requires --data-type json");
        }
        Ok(())
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.transport {
            TransportKind::Http => 9000,
            TransportKind::Rpc => 5000,
        })
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    /// Non-blank input lines.
    pub lines_read: u64,
    pub lines_written: u64,
    pub failed: u64,
    pub elapsed: Duration,
}

/// Builds the client for `args` and runs the pipeline.
///
/// # Errors
///
/// Invalid arguments or file I/O failures. Individual call failures are
/// written as failure records and never fail the run.
pub async fn run_batch(args: &BatchArgs) -> anyhow::Result<BatchSummary> {
    args.validate()?;
    let client: Arc<dyn PredictorClient> = match args.transport {
        TransportKind::Http => Arc::new(HttpPredictorClient::new(
            &args.host,
            args.port(),
            args.call_timeout(),
        )?),
        TransportKind::Rpc => Arc::new(RpcPredictorClient::new(
            &args.host,
            args.port(),
            args.workers,
            args.call_timeout(),
        )),
    };
    run_with_client(args, client).await
}

/// Runs the pipeline against an already-built client.
///
/// # Errors
///
/// See [`run_batch`].
pub async fn run_with_client(
    args: &BatchArgs,
    client: Arc<dyn PredictorClient>,
) -> anyhow::Result<BatchSummary> {
    args.validate()?;
    let started = Instant::now();
    let capacity = args.workers.saturating_mul(2);
    let batch_id: Arc<str> = Arc::from(uuid::Uuid::new_v4().to_string());
    info!(
        batch_id = %batch_id,
        input = %args.input.display(),
        output = %args.output.display(),
        workers = args.workers,
        batch_size = args.batch_size,
        "batch run starting"
    );

    let writer = BackgroundWorker::start(
        OutputWriter::create(&args.output).await?,
        capacity,
        Duration::from_secs(10),
    );

    let (work_tx, work_rx) = mpsc::channel::<WorkItem>(capacity);
    let reader = tokio::spawn({
        let input = args.input.clone();
        let batch_size = args.batch_size;
        async move { reader::read_items(&input, batch_size, work_tx).await }
    });

    let queue = Arc::new(Mutex::new(work_rx));
    let shape = RequestShape {
        data_type: args.data_type,
        payload_type: args.payload_type,
    };
    let policy = RetryPolicy {
        retries: args.retries,
        ..RetryPolicy::default()
    };
    let mut workers = JoinSet::new();
    for id in 0..args.workers {
        let worker = BatchWorker {
            id,
            client: client.clone(),
            method: args.method.method(),
            shape,
            policy,
            batch_id: batch_id.clone(),
            input: queue.clone(),
            output: writer.sender(),
        };
        workers.spawn(worker.run());
    }

    // A reader failure closes the queue early; workers still drain what was
    // sent before the writer is finished.
    let read = reader.await.context("reader task")?;
    while let Some(joined) = workers.join_next().await {
        joined.context("worker task")??;
    }
    let stats = writer.finish().await?.into_stats()?;
    let lines_read = read?;

    let summary = BatchSummary {
        lines_read,
        lines_written: stats.written,
        failed: stats.failed,
        elapsed: started.elapsed(),
    };
    info!(
        batch_id = %batch_id,
        lines = summary.lines_written,
        failed = summary.failed,
        "batch run finished"
    );
    if args.benchmark {
        info!(
            elapsed_ms = u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
            "benchmark"
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::io::Write;

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::net::TcpListener;

    use super::*;
    use crate::component::Identity;
    use crate::network::handlers::test_support::state_for;
    use crate::network::module::build_router;

    struct Echo;

    #[async_trait]
    impl PredictorClient for Echo {
        async fn call(
            &self,
            _method: Method,
            request: &Value,
            _correlation_id: &str,
        ) -> Result<Value, TransportError> {
            Ok(request.clone())
        }
    }

    fn args(dir: &tempfile::TempDir, lines: &[&str]) -> BatchArgs {
        let input = dir.path().join("in.txt");
        let mut file = std::fs::File::create(&input).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        let mut args = BatchArgs::try_parse_from([
            "predictor-batch",
            "--input",
            input.to_str().unwrap(),
            "--output",
            dir.path().join("out.jsonl").to_str().unwrap(),
            "--workers",
            "3",
        ])
        .unwrap();
        args.retries = 0;
        args
    }

    fn output(args: &BatchArgs) -> Vec<Value> {
        std::fs::read_to_string(&args.output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = args(&dir, &[]);
        assert!(a.validate().is_ok());
        a.batch_size = 4;
        a.data_type = DataType::Str;
        assert!(a.validate().is_err());
        a.data_type = DataType::Data;
        assert!(a.validate().is_ok());
        a.method = BatchMethod::Feedback;
        assert!(a.validate().is_err());
        a.workers = 0;
        assert!(a.validate().is_err());
    }

    #[test]
    fn default_ports_follow_transport() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = args(&dir, &[]);
        assert_eq!(a.port(), 9000);
        a.transport = TransportKind::Rpc;
        assert_eq!(a.port(), 5000);
        a.port = Some(7);
        assert_eq!(a.port(), 7);
    }

    #[tokio::test]
    async fn every_line_yields_one_uniquely_tagged_output() {
        let dir = tempfile::tempdir().unwrap();
        let lines: Vec<String> = (0..25).map(|i| format!("[{i}, {i}]")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let args = args(&dir, &refs);

        let summary = run_with_client(&args, Arc::new(Echo)).await.unwrap();
        assert_eq!(summary.lines_read, 25);
        assert_eq!(summary.lines_written, 25);
        assert_eq!(summary.failed, 0);

        let out = output(&args);
        assert_eq!(out.len(), 25);
        let ids: HashSet<&str> = out
            .iter()
            .map(|doc| doc["meta"]["tags"]["batch_instance_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids.len(), 25);
        let lines: HashSet<u64> = out
            .iter()
            .map(|doc| doc["meta"]["tags"]["batch_line"].as_u64().unwrap())
            .collect();
        assert_eq!(lines, (0..25).collect());
        // single-line items always sit at slot 0 of their mini-batch
        assert!(out.iter().all(|doc| doc["meta"]["tags"]["batch_index"] == 0));
    }

    #[tokio::test]
    async fn mini_batches_are_resliced() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<String> = (0..8).map(|i| format!("[{i}, {i}]")).collect();
        let refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        let mut args = args(&dir, &refs);
        args.batch_size = 4;
        args.payload_type = PayloadType::Tensor;

        let summary = run_with_client(&args, Arc::new(Echo)).await.unwrap();
        assert_eq!(summary.lines_written, 8);
        let out = output(&args);
        let mut slots: Vec<(u64, u64)> = out
            .iter()
            .map(|doc| {
                let tags = &doc["meta"]["tags"];
                (
                    tags["batch_line"].as_u64().unwrap(),
                    tags["batch_index"].as_u64().unwrap(),
                )
            })
            .collect();
        slots.sort_unstable();
        let expected: Vec<(u64, u64)> = (0..8).map(|line| (line, line % 4)).collect();
        assert_eq!(slots, expected);
        for doc in &out {
            assert_eq!(doc["data"]["tensor"]["shape"], serde_json::json!([1, 2]));
        }
    }

    #[tokio::test]
    async fn bad_lines_become_failure_records() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(&dir, &["[1]", "not json", "[2]"]);
        let summary = run_with_client(&args, Arc::new(Echo)).await.unwrap();
        assert_eq!(summary.lines_written, 3);
        assert_eq!(summary.failed, 1);
        let failure = output(&args)
            .into_iter()
            .find(|doc| doc.get("status").is_some())
            .unwrap();
        assert_eq!(failure["status"]["reason"], "MALFORMED_PAYLOAD");
    }

    #[tokio::test]
    async fn runs_against_a_live_http_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let router = build_router(state_for(Identity::default()));
        tokio::spawn(async move { axum::serve(listener, router).await });

        let dir = tempfile::tempdir().unwrap();
        let mut args = args(&dir, &["[0.1, 0.2]", "[0.3, 0.4]", "", "[0.5, 0.6]"]);
        args.host = "127.0.0.1".into();
        args.port = Some(port);

        let summary = run_batch(&args).await.unwrap();
        assert_eq!(summary.lines_read, 3);
        assert_eq!(summary.failed, 0);
        for doc in output(&args) {
            assert_eq!(doc["meta"]["tags"]["component"], "identity");
            assert!(doc["meta"]["tags"]["batch_id"].is_string());
        }
    }

    #[tokio::test]
    async fn runs_against_a_live_rpc_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(crate::network::rpc::serve(listener, state_for(Identity::default())));

        let dir = tempfile::tempdir().unwrap();
        let mut args = args(&dir, &["[1, 2]", "[3, 4]"]);
        args.transport = TransportKind::Rpc;
        args.host = "127.0.0.1".into();
        args.port = Some(port);
        args.batch_size = 2;

        let summary = run_batch(&args).await.unwrap();
        assert_eq!(summary.lines_written, 2);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn unreachable_server_records_failures_without_failing_the_run() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let mut args = args(&dir, &["[1]", "[2]"]);
        args.host = "127.0.0.1".into();
        args.port = Some(port);

        let summary = run_batch(&args).await.unwrap();
        assert_eq!(summary.lines_written, 2);
        assert_eq!(summary.failed, 2);
        for doc in output(&args) {
            assert_eq!(doc["status"]["reason"], "TRANSPORT_FAILURE");
        }
    }
}
