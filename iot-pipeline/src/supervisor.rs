//! Run the producer and consumer loops side by side and settle how the run ended.
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use iot_common::broker::Broker;
use iot_common::lifecycle::drain;
use iot_consumer::consumer::ConsumerReport;
use iot_consumer::error::ConsumerError;
use iot_producer::error::ProducerError;
use iot_producer::producer::{ProducerLoop, ProducerReport};
use iot_producer::source::DataSource;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// `None` when the producer never started.
pub type ProducerTask = JoinHandle<Option<Result<ProducerReport, ProducerError>>>;
pub type ConsumerTask = JoinHandle<Result<ConsumerReport, ConsumerError>>;

/// Start the producer once the consumer is subscribed, so no reading is
/// published before anyone listens for it.
pub fn spawn_producer<S>(
    mut producer: ProducerLoop<S>,
    broker: Arc<dyn Broker>,
    subscribed: oneshot::Receiver<()>,
    shutdown: CancellationToken,
) -> ProducerTask
where
    S: DataSource + 'static,
{
    tokio::spawn(async move {
        let ready = tokio::select! {
            biased;

            _ = shutdown.cancelled() => false,
            result = subscribed => result.is_ok(),
        };
        match ready {
            true => Some(producer.run(broker.as_ref()).await),
            false => {
                info!("consumer never subscribed, producer not started");
                None
            }
        }
    })
}

/// Wait for either loop to end, then stop the other one.
///
/// The producer bounds the run. A consumer that stops on its own has given up
/// on the broker, which ends the run as well. Either loop failing is an error.
pub async fn supervise(
    mut producer: ProducerTask,
    mut consumer: ConsumerTask,
    shutdown: CancellationToken,
    grace_period: Duration,
) -> anyhow::Result<()> {
    let (producer_result, consumer_result) = tokio::select! {
        result = &mut producer => (Some(result), None),
        result = &mut consumer => (None, Some(result)),
        _ = shutdown.cancelled() => (None, None),
    };
    shutdown.cancel();

    let mut failure = None;

    let producer_result = match producer_result {
        Some(result) => Some(result),
        None => drain("producer", producer, grace_period).await.map(Ok),
    };
    match producer_result {
        Some(Ok(Some(Ok(report)))) => info!(?report, "producer finished"),
        Some(Ok(Some(Err(e)))) => {
            error!("producer stopped: {}", e);
            failure = Some(anyhow!(e).context("producer stopped"));
        }
        Some(Ok(None)) => {}
        Some(Err(e)) => {
            error!("producer task failed: {}", e);
            failure = Some(anyhow!(e).context("producer task failed"));
        }
        None => warn!("producer did not stop within the grace period"),
    }

    let consumer_result = match consumer_result {
        Some(result) => Some(result),
        None => drain("consumer", consumer, grace_period).await.map(Ok),
    };
    match consumer_result {
        Some(Ok(Ok(report))) => info!(?report, "consumer finished"),
        Some(Ok(Err(e))) => {
            error!("consumer stopped: {}", e);
            failure = Some(anyhow!(e).context("consumer stopped"));
        }
        Some(Err(e)) => {
            error!("consumer task failed: {}", e);
            failure = Some(anyhow!(e).context("consumer task failed"));
        }
        None => warn!("consumer did not stop within the grace period"),
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use iot_common::broker::{BrokerError, MemoryBroker};
    use iot_common::health::HealthRegistry;
    use iot_producer::error::SourceError;

    const RAW_TOPIC: &str = "RawIOTData";
    const GRACE_PERIOD: Duration = Duration::from_secs(5);

    struct FixedSource;

    #[async_trait]
    impl DataSource for FixedSource {
        async fn fetch(&self) -> Result<String, SourceError> {
            Ok(r#"{"device_id":1,"temperature":950,"humidity":5,"timestamp":"2024-01-01T00:00:00"}"#.to_owned())
        }
    }

    fn producer(
        shutdown: CancellationToken,
        registry: &HealthRegistry,
    ) -> ProducerLoop<FixedSource> {
        ProducerLoop::new(
            "test-producer",
            FixedSource,
            RAW_TOPIC,
            Duration::from_secs(1),
            Duration::from_millis(2500),
            shutdown,
            registry.register("producer", Duration::from_secs(30)),
        )
    }

    fn consumer_until(shutdown: CancellationToken) -> ConsumerTask {
        tokio::spawn(async move {
            shutdown.cancelled().await;
            Ok(ConsumerReport::default())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_waits_for_subscription() {
        let broker = MemoryBroker::new();
        let shutdown = CancellationToken::new();
        let registry = HealthRegistry::new("liveness");
        let (subscribed, on_subscribed) = oneshot::channel();

        let task = spawn_producer(
            producer(shutdown.clone(), &registry),
            Arc::new(broker.clone()),
            on_subscribed,
            shutdown,
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broker.connect_attempts(), 0);

        subscribed.send(()).unwrap();
        let report = task.await.unwrap().unwrap().unwrap();

        assert_eq!(report.published, 3);
        assert_eq!(broker.published(RAW_TOPIC).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_skipped_when_consumer_never_subscribes() {
        let broker = MemoryBroker::new();
        let shutdown = CancellationToken::new();
        let registry = HealthRegistry::new("liveness");
        let (subscribed, on_subscribed) = oneshot::channel::<()>();

        let task = spawn_producer(
            producer(shutdown.clone(), &registry),
            Arc::new(broker.clone()),
            on_subscribed,
            shutdown,
        );
        drop(subscribed);

        assert!(task.await.unwrap().is_none());
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_producer_ends_the_run() {
        let shutdown = CancellationToken::new();
        let producer = tokio::spawn(async { Some(Ok(ProducerReport::default())) });

        let result = supervise(
            producer,
            consumer_until(shutdown.clone()),
            shutdown.clone(),
            GRACE_PERIOD,
        )
        .await;

        assert!(result.is_ok());
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_giving_up_fails_the_run() {
        let shutdown = CancellationToken::new();
        let producer_shutdown = shutdown.clone();
        let producer = tokio::spawn(async move {
            producer_shutdown.cancelled().await;
            None
        });
        let consumer = tokio::spawn(async {
            Err(ConsumerError::ConnectError {
                attempts: 3,
                source: BrokerError::Connect("connection refused".to_owned()),
            })
        });

        let result = supervise(producer, consumer, shutdown.clone(), GRACE_PERIOD).await;

        assert!(result.is_err());
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_connect_error_fails_the_run() {
        let shutdown = CancellationToken::new();
        let producer = tokio::spawn(async {
            Some(Err(ProducerError::ConnectError(BrokerError::Connect(
                "connection refused".to_owned(),
            ))))
        });

        let result = supervise(
            producer,
            consumer_until(shutdown.clone()),
            shutdown,
            GRACE_PERIOD,
        )
        .await;

        assert!(result.is_err());
    }
}
