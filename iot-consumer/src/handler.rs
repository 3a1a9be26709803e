//! # Handler
//!
//! One raw message in, one `Outcome` out. The handler owns no broker: it
//! decodes, validates, deduplicates and persists, and leaves republishing to
//! the caller.
use std::sync::Arc;

use bytes::Bytes;
use iot_common::dedup::{Admission, DuplicateGuard};
use iot_common::normalizer::normalize;
use iot_common::record::ValidatedRecord;
use iot_common::sink::{RecordSink, SinkError};
use tracing::{info, warn};

/// What happened to a single raw message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Written to the sink; should be republished on the clean topic.
    Persisted(ValidatedRecord),
    /// The timestamp was already persisted.
    DroppedDuplicate,
    /// The payload decoded but its timestamp did not validate.
    DroppedInvalid,
    /// The payload could not be decoded as a JSON object.
    DroppedMalformed,
}

impl Outcome {
    pub fn as_label(&self) -> &'static str {
        match self {
            Outcome::Persisted(_) => "persisted",
            Outcome::DroppedDuplicate => "dropped_duplicate",
            Outcome::DroppedInvalid => "dropped_invalid",
            Outcome::DroppedMalformed => "dropped_malformed",
        }
    }
}

/// Normalizer, duplicate guard and sink wired together.
#[derive(Clone)]
pub struct IngestPipeline {
    guard: Arc<DuplicateGuard>,
    sink: Arc<dyn RecordSink>,
}

impl IngestPipeline {
    pub fn new(guard: Arc<DuplicateGuard>, sink: Arc<dyn RecordSink>) -> Self {
        Self { guard, sink }
    }

    /// Process one raw message.
    ///
    /// A sink failure is returned as an error and leaves the timestamp
    /// unmarked, so a retransmission of the same reading can still be
    /// persisted.
    pub async fn handle(&self, payload: &[u8]) -> Result<Outcome, SinkError> {
        let result = self.classify(payload).await;

        match &result {
            Ok(outcome) => {
                metrics::counter!("iot_consumer_messages_total", "outcome" => outcome.as_label())
                    .increment(1);
                info!(
                    outcome = outcome.as_label(),
                    "received message: {}",
                    String::from_utf8_lossy(payload)
                );
            }
            Err(e) => {
                metrics::counter!("iot_consumer_messages_total", "outcome" => "sink_error")
                    .increment(1);
                warn!(
                    "received message: {}, failed to persist: {}",
                    String::from_utf8_lossy(payload),
                    e
                );
            }
        }

        result
    }

    async fn classify(&self, payload: &[u8]) -> Result<Outcome, SinkError> {
        let record = match normalize(payload) {
            Ok(record) => record,
            Err(e) => {
                warn!("dropping malformed message: {}", e);
                return Ok(Outcome::DroppedMalformed);
            }
        };

        let Some(timestamp) = record.dedup_key() else {
            return Ok(Outcome::DroppedInvalid);
        };

        let sink = &self.sink;
        let admission = self
            .guard
            .admit(timestamp, || sink.append(&record))
            .await?;

        Ok(match admission {
            Admission::Admitted => Outcome::Persisted(record),
            Admission::Duplicate => Outcome::DroppedDuplicate,
        })
    }
}

/// The clean topic payload for a persisted record.
pub fn clean_payload(record: &ValidatedRecord) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(record).map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use iot_common::record::FieldValue;
    use iot_common::sink::MemorySink;

    fn pipeline() -> (IngestPipeline, Arc<MemorySink>, Arc<DuplicateGuard>) {
        let sink = Arc::new(MemorySink::new());
        let guard = Arc::new(DuplicateGuard::new());
        (
            IngestPipeline::new(guard.clone(), sink.clone()),
            sink,
            guard,
        )
    }

    #[tokio::test]
    async fn test_valid_reading_is_persisted() {
        let (pipeline, sink, guard) = pipeline();

        let outcome = pipeline
            .handle(br#"{"device_id":1,"temperature":950,"humidity":5,"timestamp":"2024-01-01T00:00:00Z"}"#)
            .await
            .unwrap();

        let expected = ValidatedRecord {
            timestamp: FieldValue::Valid("2024-01-01T00:00:00+00:00".to_owned()),
            temperature: FieldValue::Valid(950.0),
            humidity: FieldValue::Valid(5.0),
            device_id: FieldValue::Valid(1),
        };
        assert_eq!(outcome, Outcome::Persisted(expected.clone()));
        assert_eq!(sink.records(), vec![expected]);
        assert!(guard.is_duplicate("2024-01-01T00:00:00+00:00").await);
    }

    #[tokio::test]
    async fn test_same_instant_in_another_notation_is_duplicate() {
        let (pipeline, sink, _guard) = pipeline();

        pipeline
            .handle(br#"{"device_id":1,"temperature":950,"humidity":5,"timestamp":"2024-01-01T00:00:00Z"}"#)
            .await
            .unwrap();
        let outcome = pipeline
            .handle(br#"{"device_id":2,"temperature":951,"humidity":6,"timestamp":"2024-01-01T00:00:00+00:00"}"#)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::DroppedDuplicate);
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_touches_nothing() {
        let (pipeline, sink, guard) = pipeline();

        for payload in [&b"{not json"[..], b"[1,2,3]", b"\xff\xfe", b"null"] {
            assert_eq!(
                pipeline.handle(payload).await.unwrap(),
                Outcome::DroppedMalformed
            );
        }

        assert!(sink.records().is_empty());
        assert!(guard.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_timestamp_is_dropped() {
        let (pipeline, sink, guard) = pipeline();

        let outcome = pipeline
            .handle(br#"{"device_id":1,"temperature":950,"humidity":5,"timestamp":"not-a-date"}"#)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::DroppedInvalid);
        assert!(sink.records().is_empty());
        assert!(guard.is_empty().await);
    }

    #[tokio::test]
    async fn test_sink_failure_is_surfaced_and_not_marked() {
        let (pipeline, sink, guard) = pipeline();
        let payload =
            br#"{"device_id":1,"temperature":950,"humidity":5,"timestamp":"2024-01-01T00:00:00Z"}"#;

        sink.set_unavailable(true);
        assert!(matches!(
            pipeline.handle(payload).await,
            Err(SinkError::Unavailable)
        ));
        assert!(guard.is_empty().await);

        sink.set_unavailable(false);
        assert!(matches!(
            pipeline.handle(payload).await,
            Ok(Outcome::Persisted(_))
        ));
        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn test_clean_payload_uses_markers() {
        let record = ValidatedRecord {
            timestamp: FieldValue::Valid("2024-01-01T00:00:01+00:00".to_owned()),
            temperature: FieldValue::Malfunction,
            humidity: FieldValue::Valid(5.0),
            device_id: FieldValue::Error,
        };

        let payload = clean_payload(&record).unwrap();

        assert_eq!(
            payload,
            Bytes::from_static(
                br#"{"timestamp":"2024-01-01T00:00:01+00:00","temperature":"IOT Malfunctions","humidity":5.0,"device_id":"Error"}"#
            )
        );
    }
}
