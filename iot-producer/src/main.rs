//! Poll the simulated sensor endpoint and publish raw readings to the broker.
use anyhow::Context;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use iot_common::broker::MqttBroker;
use iot_common::health::HealthRegistry;
use iot_common::lifecycle::{drain, trap_shutdown_signals};
use iot_common::metrics::{serve, setup_metrics_recorder, setup_status_router};
use iot_producer::config::Config;
use iot_producer::producer::{ProducerLoop, MIN_POLL_INTERVAL};
use iot_producer::source::HttpSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;
    info!("configuration loaded: {:?}", config);

    let shutdown = CancellationToken::new();
    trap_shutdown_signals(shutdown.clone());

    let liveness = HealthRegistry::new("liveness");
    let recorder_handle = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let router = setup_status_router(
        "iot producer",
        liveness.clone(),
        shutdown.clone(),
        Some(recorder_handle),
    );
    let bind = config.bind();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = serve(router, &bind, server_shutdown).await {
            error!("failed to serve status endpoints: {}", e);
        }
    });

    let source = HttpSource::new(&config.source_url, config.request_timeout.0)
        .context("failed to build data source client")?;
    let mut producer = ProducerLoop::new(
        &config.client_id,
        source,
        config.broker.raw_topic.as_str(),
        config.poll_interval.0,
        config.max_run_duration.0,
        shutdown.clone(),
        liveness.register(
            "producer",
            config.poll_interval.0.max(MIN_POLL_INTERVAL).saturating_mul(10),
        ),
    );

    let broker = MqttBroker::new(&config.broker);
    let result = producer.run(&broker).await;

    shutdown.cancel();
    drain("status server", server, config.shutdown_grace_period.0).await;

    let report = result.context("producer stopped")?;
    info!(?report, "producer finished");

    Ok(())
}
