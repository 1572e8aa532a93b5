//! `predictor-serve`: serves the identity component over HTTP and RPC.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use predictor_server::component::{Component, Identity};
use predictor_server::config::RuntimeConfig;
use predictor_server::metrics::MetricsAggregator;
use predictor_server::network::{AppState, NetworkModule};
use predictor_server::service::Dispatcher;
use predictor_server::telemetry::init_tracing;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let config = RuntimeConfig::parse();
    init_tracing(&config.log_level, config.log_json)?;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        runtime.worker_threads(workers.max(1));
    }
    runtime.enable_all().build()?.block_on(run(config))
}

async fn run(config: RuntimeConfig) -> anyhow::Result<()> {
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("installing prometheus recorder")?;

    let component = Arc::new(Identity::new(config.model_name.clone()));
    component.load().await.context("loading component")?;

    let dispatcher = Dispatcher::new(
        component,
        Arc::new(MetricsAggregator::new()),
        config.server(),
    );
    let state = AppState::new(
        dispatcher,
        config.network(),
        config.server(),
        config.deployment(),
    )
    .with_prometheus(prometheus);

    let mut module = NetworkModule::new(state);
    let ports = module.start().await?;
    info!(
        http = ports.http,
        rpc = ports.rpc,
        unit = %config.predictive_unit_id,
        "predictor serving"
    );

    module
        .serve(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
            }
        })
        .await
}
