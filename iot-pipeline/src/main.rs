//! Run the simulator, the producer and the consumer in one process.
use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use iot_common::broker::{Broker, MemoryBroker, MqttBroker};
use iot_common::dedup::DuplicateGuard;
use iot_common::health::HealthRegistry;
use iot_common::lifecycle::{drain, trap_shutdown_signals};
use iot_common::metrics::{serve, serve_listener, setup_metrics_recorder, setup_status_router};
use iot_common::sink::{CsvSink, PrintSink, RecordSink};
use iot_consumer::consumer::ConsumerLoop;
use iot_consumer::handler::IngestPipeline;
use iot_producer::producer::{ProducerLoop, MIN_POLL_INTERVAL};
use iot_producer::source::HttpSource;

use crate::config::Config;
use crate::supervisor::{spawn_producer, supervise};

mod config;
mod supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;
    info!("configuration loaded: {:?}", config);
    let grace_period = config.shutdown_grace_period.0;

    let shutdown = CancellationToken::new();
    trap_shutdown_signals(shutdown.clone());

    let liveness = HealthRegistry::new("liveness");
    let recorder_handle = setup_metrics_recorder().context("failed to install metrics recorder")?;

    let status_router = setup_status_router(
        "iot pipeline",
        liveness.clone(),
        shutdown.clone(),
        Some(recorder_handle),
    );
    let status_bind = config.bind();
    let status_shutdown = shutdown.clone();
    let status_server = tokio::spawn(async move {
        if let Err(e) = serve(status_router, &status_bind, status_shutdown).await {
            error!("failed to serve status endpoints: {}", e);
        }
    });

    // Bound before the producer starts so its first poll finds the simulator.
    let simulator_listener = tokio::net::TcpListener::bind(config.simulator.bind())
        .await
        .context("failed to bind simulator")?;
    let simulator_shutdown = shutdown.clone();
    let simulator = tokio::spawn(async move {
        if let Err(e) = serve_listener(
            iot_simulator::handlers::app(None),
            simulator_listener,
            simulator_shutdown,
        )
        .await
        {
            error!("failed to serve simulator: {}", e);
        }
    });
    info!("simulator listening on {}", config.simulator.bind());

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

    let broker: Arc<dyn Broker> = match config.memory_broker {
        true => Arc::new(MemoryBroker::new()),
        false => Arc::new(MqttBroker::new(&config.broker)),
    };

    let mut consumer = ConsumerLoop::new(
        "iot-pipeline-consumer",
        IngestPipeline::new(Arc::new(guard), sink),
        config.broker.raw_topic.as_str(),
        config.broker.clean_topic.as_str(),
        config.retry_policy.policy(),
        shutdown.clone(),
        liveness.register("consumer", config.retry_policy.liveness_deadline()),
    );
    let subscribed = consumer.on_subscribed();
    let consumer_broker = broker.clone();
    let consumer = tokio::spawn(async move { consumer.run(consumer_broker.as_ref()).await });

    let source = HttpSource::new(&config.source_url(), config.request_timeout.0)
        .context("failed to build data source client")?;
    let producer = ProducerLoop::new(
        "iot-pipeline-producer",
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
    let producer = spawn_producer(producer, broker.clone(), subscribed, shutdown.clone());

    let result = supervise(producer, consumer, shutdown.clone(), grace_period).await;

    drain("simulator", simulator, grace_period).await;
    drain("status server", status_server, grace_period).await;

    result
}
