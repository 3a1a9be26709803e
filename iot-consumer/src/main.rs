//! Consume raw readings, persist the valid ones and republish them on the clean topic.
use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use iot_common::broker::MqttBroker;
use iot_common::dedup::DuplicateGuard;
use iot_common::health::HealthRegistry;
use iot_common::lifecycle::{drain, trap_shutdown_signals};
use iot_common::metrics::{serve, setup_metrics_recorder, setup_status_router};
use iot_common::sink::{CsvSink, PrintSink, RecordSink};
use iot_consumer::config::Config;
use iot_consumer::consumer::ConsumerLoop;
use iot_consumer::handler::IngestPipeline;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;
    info!("configuration loaded: {:?}", config);

    let shutdown = CancellationToken::new();
    trap_shutdown_signals(shutdown.clone());

    let sink: Arc<dyn RecordSink> = match config.print_sink {
        true => Arc::new(PrintSink {}),
        false => Arc::new(CsvSink::new(&config.sink_path)),
    };

    let guard = match config.seed_guard_from_sink {
        true => {
            let seen = sink
                .existing_timestamps()
                .await
                .context("failed to read persisted timestamps")?;
            info!(count = seen.len(), "seeded duplicate guard from sink");
            DuplicateGuard::with_seen(seen)
        }
        false => DuplicateGuard::new(),
    };

    let liveness = HealthRegistry::new("liveness");
    let recorder_handle = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let router = setup_status_router(
        "iot consumer",
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

    let mut consumer = ConsumerLoop::new(
        &config.client_id,
        IngestPipeline::new(Arc::new(guard), sink),
        config.broker.raw_topic.as_str(),
        config.broker.clean_topic.as_str(),
        config.retry_policy.policy(),
        shutdown.clone(),
        liveness.register("consumer", config.retry_policy.liveness_deadline()),
    );

    let broker = MqttBroker::new(&config.broker);
    let result = consumer.run(&broker).await;

    shutdown.cancel();
    drain("status server", server, config.shutdown_grace_period.0).await;

    let report = result.context("consumer stopped")?;
    info!(?report, "consumer finished");

    Ok(())
}
