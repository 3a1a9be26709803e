//! Serve fabricated sensor readings over HTTP.
use anyhow::Context;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use iot_common::lifecycle::trap_shutdown_signals;
use iot_common::metrics::{serve, setup_metrics_recorder};
use iot_simulator::config::Config;
use iot_simulator::handlers::app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;

    let shutdown = CancellationToken::new();
    trap_shutdown_signals(shutdown.clone());

    let recorder_handle = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let bind = config.bind();
    info!("simulator listening on {}", bind);

    serve(app(Some(recorder_handle)), &bind, shutdown)
        .await
        .context("failed to serve simulator")?;

    Ok(())
}
