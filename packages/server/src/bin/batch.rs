//! `predictor-batch`: sends every line of a file through a running predictor.

use clap::Parser;
use predictor_server::batch::{run_batch, BatchArgs};
use predictor_server::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = BatchArgs::parse();
    init_tracing(&args.log_level, false)?;

    let summary = run_batch(&args).await?;
    println!(
        "processed {} lines ({} failed) in {:.3}s",
        summary.lines_written,
        summary.failed,
        summary.elapsed.as_secs_f64()
    );
    Ok(())
}
