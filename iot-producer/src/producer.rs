use std::time;

use bytes::Bytes;
use iot_common::broker::{Broker, Publisher};
use iot_common::health::{ComponentStatus, HealthHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ProducerError;
use crate::source::DataSource;

/// Characters of a published payload shown in logs.
const LOG_PREVIEW_CHARS: usize = 50;

/// Shortest accepted poll interval; a zero interval would spin.
pub const MIN_POLL_INTERVAL: time::Duration = time::Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    Running,
    Stopped,
}

/// Counters accumulated over one run of the producer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProducerReport {
    pub ticks: u64,
    pub published: u64,
    pub fetch_failures: u64,
    pub publish_failures: u64,
}

/// Polls a `DataSource` on a fixed interval and publishes every reading
/// verbatim to the raw topic, until the run duration elapses or shutdown is
/// requested.
pub struct ProducerLoop<S> {
    /// Client identifier presented to the broker.
    client_id: String,
    /// Where readings come from.
    source: S,
    /// The topic raw readings are published to.
    raw_topic: String,
    /// Time between two fetches.
    poll_interval: time::Duration,
    /// Hard ceiling on how long the loop runs.
    max_run_duration: time::Duration,
    shutdown: CancellationToken,
    liveness: HealthHandle,
    state: ProducerState,
}

impl<S: DataSource> ProducerLoop<S> {
    pub fn new(
        client_id: &str,
        source: S,
        raw_topic: &str,
        poll_interval: time::Duration,
        max_run_duration: time::Duration,
        shutdown: CancellationToken,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            client_id: client_id.to_owned(),
            source,
            raw_topic: raw_topic.to_owned(),
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            max_run_duration,
            shutdown,
            liveness,
            state: ProducerState::Idle,
        }
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    /// Open one broker connection and poll until the run duration elapses or
    /// shutdown is requested. Fetch and publish failures are logged and the
    /// loop carries on with the next tick; only a failed connection is fatal.
    pub async fn run(&mut self, broker: &dyn Broker) -> Result<ProducerReport, ProducerError> {
        let connection = match broker.connect(&self.client_id, &[]).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("producer failed to connect to broker: {}", e);
                self.state = ProducerState::Stopped;
                self.liveness.report_status(ComponentStatus::Unhealthy);
                return Err(ProducerError::ConnectError(e));
            }
        };

        self.state = ProducerState::Running;
        info!(
            topic = %self.raw_topic,
            poll_interval = ?self.poll_interval,
            max_run_duration = ?self.max_run_duration,
            "producer running"
        );

        let deadline = Instant::now() + self.max_run_duration;
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut report = ProducerReport::default();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested, stopping producer loop");
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    info!("reached max duration, stopping producer loop");
                    break;
                }
                _ = interval.tick() => {}
            }

            self.liveness.report_healthy();
            self.tick(connection.publisher.as_ref(), &mut report).await;
        }

        connection.close().await;
        self.state = ProducerState::Stopped;
        self.liveness.report_status(ComponentStatus::Stopped);
        info!(?report, "producer stopped");

        Ok(report)
    }

    async fn tick(&self, publisher: &dyn Publisher, report: &mut ProducerReport) {
        report.ticks += 1;

        let payload = match self.source.fetch().await {
            Ok(payload) => payload,
            Err(e) => {
                report.fetch_failures += 1;
                metrics::counter!("iot_producer_fetch_failures_total").increment(1);
                warn!("error fetching reading: {}", e);
                return;
            }
        };

        let preview: String = payload.chars().take(LOG_PREVIEW_CHARS).collect();

        match publisher
            .publish(&self.raw_topic, Bytes::from(payload))
            .await
        {
            Ok(()) => {
                report.published += 1;
                metrics::counter!("iot_producer_published_total").increment(1);
                info!("published message: {}...", preview);
            }
            Err(e) => {
                report.publish_failures += 1;
                metrics::counter!("iot_producer_publish_failures_total").increment(1);
                warn!("error publishing reading: {}", e);
            }
        }
    }
}
