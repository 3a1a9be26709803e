use std::time::Duration;

use iot_common::broker::{Broker, Connection, Publisher};
use iot_common::health::{ComponentStatus, HealthHandle};
use iot_common::record::ValidatedRecord;
use iot_common::retry::RetryPolicy;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ConsumerError;
use crate::handler::{clean_payload, IngestPipeline, Outcome};

/// How often an idle consumer still reports itself alive.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Connecting,
    Subscribed,
    Stopped,
}

/// Counters accumulated over one run of the consumer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerReport {
    pub received: u64,
    pub persisted: u64,
    pub duplicates: u64,
    pub invalid: u64,
    pub malformed: u64,
    pub sink_failures: u64,
    pub republish_failures: u64,
}

impl ConsumerReport {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Persisted(_) => self.persisted += 1,
            Outcome::DroppedDuplicate => self.duplicates += 1,
            Outcome::DroppedInvalid => self.invalid += 1,
            Outcome::DroppedMalformed => self.malformed += 1,
        }
    }
}

/// Subscribes to the raw topic and feeds every message through an
/// `IngestPipeline`, republishing persisted records on the clean topic.
/// Runs until shutdown is requested.
pub struct ConsumerLoop {
    client_id: String,
    pipeline: IngestPipeline,
    raw_topic: String,
    clean_topic: String,
    retry_policy: RetryPolicy,
    shutdown: CancellationToken,
    liveness: HealthHandle,
    state: ConsumerState,
    subscribed: Option<oneshot::Sender<()>>,
}

impl ConsumerLoop {
    pub fn new(
        client_id: &str,
        pipeline: IngestPipeline,
        raw_topic: &str,
        clean_topic: &str,
        retry_policy: RetryPolicy,
        shutdown: CancellationToken,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            client_id: client_id.to_owned(),
            pipeline,
            raw_topic: raw_topic.to_owned(),
            clean_topic: clean_topic.to_owned(),
            retry_policy,
            shutdown,
            liveness,
            state: ConsumerState::Connecting,
            subscribed: None,
        }
    }

    /// Resolves once the loop is subscribed to the raw topic. The sender is
    /// dropped instead if the loop stops before getting there.
    pub fn on_subscribed(&mut self) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        self.subscribed = Some(sender);
        receiver
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub async fn run(&mut self, broker: &dyn Broker) -> Result<ConsumerReport, ConsumerError> {
        let mut report = ConsumerReport::default();

        let Some(mut connection) = self.connect(broker).await? else {
            self.stop();
            return Ok(report);
        };

        self.state = ConsumerState::Subscribed;
        self.liveness.report_healthy();
        info!(topic = %self.raw_topic, "consumer subscribed");
        if let Some(subscribed) = self.subscribed.take() {
            if subscribed.send(()).is_err() {
                debug!("nobody is waiting for the subscription");
            }
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            let message = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested, stopping consumer loop");
                    break;
                }
                message = connection.subscription.recv() => message,
                _ = heartbeat.tick() => {
                    self.liveness.report_healthy();
                    continue;
                }
            };

            let Some(message) = message else {
                warn!("broker connection closed, stopping consumer loop");
                break;
            };

            report.received += 1;
            self.liveness.report_healthy();

            match self.pipeline.handle(&message.payload).await {
                Ok(outcome) => {
                    report.record(&outcome);
                    if let Outcome::Persisted(record) = &outcome {
                        self.republish(connection.publisher.as_ref(), record, &mut report)
                            .await;
                    }
                }
                // Already logged by the pipeline; the message is dropped.
                Err(_) => report.sink_failures += 1,
            }
        }

        connection.close().await;
        self.stop();
        info!(?report, "consumer stopped");

        Ok(report)
    }

    /// Connect and subscribe, retrying with backoff. `None` means shutdown
    /// was requested while waiting.
    async fn connect(&mut self, broker: &dyn Broker) -> Result<Option<Connection>, ConsumerError> {
        self.state = ConsumerState::Connecting;
        let raw_topic = self.raw_topic.clone();
        let topics = [raw_topic.as_str()];
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => return Ok(None),
                result = broker.connect(&self.client_id, &topics) => result,
            };

            let e = match result {
                Ok(connection) => return Ok(Some(connection)),
                Err(e) => e,
            };

            metrics::counter!("iot_consumer_connect_failures_total").increment(1);

            if !self.retry_policy.should_retry(attempt) {
                error!(attempt, "consumer failed to connect to broker: {}", e);
                self.stop();
                self.liveness.report_status(ComponentStatus::Unhealthy);
                return Err(ConsumerError::ConnectError {
                    attempts: attempt,
                    source: e,
                });
            }

            let interval = self.retry_policy.retry_interval(attempt);
            warn!(attempt, ?interval, "consumer failed to connect to broker, retrying: {}", e);
            self.liveness.report_healthy();

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn republish(
        &self,
        publisher: &dyn Publisher,
        record: &ValidatedRecord,
        report: &mut ConsumerReport,
    ) {
        let result = match clean_payload(record) {
            Ok(payload) => publisher
                .publish(&self.clean_topic, payload)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        if let Err(e) = result {
            report.republish_failures += 1;
            metrics::counter!("iot_consumer_republish_failures_total").increment(1);
            warn!(topic = %self.clean_topic, "failed to republish persisted record: {}", e);
        }
    }

    fn stop(&mut self) {
        self.subscribed = None;
        self.state = ConsumerState::Stopped;
        self.liveness.report_status(ComponentStatus::Stopped);
    }
}
