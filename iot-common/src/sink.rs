//! # Sink
//!
//! Append-only persistence of accepted records.
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::record::{ValidatedRecord, SINK_COLUMNS};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("storage is unavailable: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode row: {0}")]
    Csv(#[from] csv::Error),
    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("storage is unavailable")]
    Unavailable,
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Persist one record. On error the record must be considered not persisted.
    async fn append(&self, record: &ValidatedRecord) -> Result<(), SinkError>;

    /// Timestamps already present in the store, used to seed the duplicate guard.
    async fn existing_timestamps(&self) -> Result<HashSet<String>, SinkError> {
        Ok(HashSet::new())
    }
}

/// Appends rows to a CSV file, writing the header once when the file is fresh.
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn append_row(path: &Path, row: &[String; 4]) -> Result<(), SinkError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let fresh = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::CRLF)
        .from_writer(&mut file);

    if fresh {
        writer.write_record(SINK_COLUMNS)?;
    }
    writer.write_record(row)?;
    writer.flush()?;

    Ok(())
}

fn read_timestamps(path: &Path) -> Result<HashSet<String>, SinkError> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(e.into()),
    };

    let mut reader = csv::Reader::from_reader(file);
    let Some(column) = reader.headers()?.iter().position(|h| h == "timestamp") else {
        return Ok(HashSet::new());
    };

    let mut timestamps = HashSet::new();
    for row in reader.records() {
        if let Some(timestamp) = row?.get(column) {
            timestamps.insert(timestamp.to_owned());
        }
    }

    Ok(timestamps)
}

#[async_trait]
impl RecordSink for CsvSink {
    async fn append(&self, record: &ValidatedRecord) -> Result<(), SinkError> {
        let path = self.path.clone();
        let row = record.to_row();
        let start = Instant::now();

        let result = tokio::task::spawn_blocking(move || append_row(&path, &row)).await?;

        metrics::histogram!("iot_sink_append_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        if result.is_err() {
            metrics::counter!("iot_sink_append_failures_total").increment(1);
        }

        result
    }

    async fn existing_timestamps(&self) -> Result<HashSet<String>, SinkError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_timestamps(&path)).await?
    }
}

/// Logs records instead of persisting them.
pub struct PrintSink {}

#[async_trait]
impl RecordSink for PrintSink {
    async fn append(&self, record: &ValidatedRecord) -> Result<(), SinkError> {
        info!("record: {:?}", record);
        metrics::counter!("iot_sink_records_total").increment(1);

        Ok(())
    }
}

/// Keeps records in memory. Can be switched unavailable to exercise write failures.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<ValidatedRecord>>,
    unavailable: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ValidatedRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn append(&self, record: &ValidatedRecord) -> Result<(), SinkError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable);
        }

        self.records
            .lock()
            .map_err(|_| SinkError::Unavailable)?
            .push(record.clone());

        Ok(())
    }

    async fn existing_timestamps(&self) -> Result<HashSet<String>, SinkError> {
        Ok(self
            .records()
            .iter()
            .filter_map(|record| record.dedup_key().map(str::to_owned))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValue;

    fn record(timestamp: &str) -> ValidatedRecord {
        ValidatedRecord {
            timestamp: FieldValue::Valid(timestamp.to_owned()),
            temperature: FieldValue::Valid(950.25),
            humidity: FieldValue::Malfunction,
            device_id: FieldValue::Valid(2),
        }
    }

    #[tokio::test]
    async fn test_csv_sink_writes_header_once() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let sink = CsvSink::new(dir.path().join("readings.csv"));

        sink.append(&record("2024-01-01T00:00:00+00:00"))
            .await
            .expect("first append failed");
        sink.append(&record("2024-01-01T00:00:01+00:00"))
            .await
            .expect("second append failed");

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();

        assert_eq!(
            lines,
            vec![
                "timestamp,device_id,temperature,humidity",
                "2024-01-01T00:00:00+00:00,2,950.25,IOT Malfunctions",
                "2024-01-01T00:00:01+00:00,2,950.25,IOT Malfunctions",
            ]
        );
    }

    #[tokio::test]
    async fn test_csv_sink_appends_to_existing_store() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("readings.csv");

        CsvSink::new(&path)
            .append(&record("2024-01-01T00:00:00+00:00"))
            .await
            .unwrap();
        CsvSink::new(&path)
            .append(&record("2024-01-01T00:00:01+00:00"))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches("timestamp,device_id").count(), 1);
        assert_eq!(contents.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_csv_sink_reads_existing_timestamps() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let sink = CsvSink::new(dir.path().join("readings.csv"));

        assert!(sink.existing_timestamps().await.unwrap().is_empty());

        sink.append(&record("2024-01-01T00:00:00+00:00")).await.unwrap();
        sink.append(&record("2024-01-01T00:00:01+00:00")).await.unwrap();

        let timestamps = sink.existing_timestamps().await.unwrap();
        assert_eq!(timestamps.len(), 2);
        assert!(timestamps.contains("2024-01-01T00:00:01+00:00"));
    }

    #[tokio::test]
    async fn test_csv_sink_reports_unwritable_storage() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let sink = CsvSink::new(dir.path().join("missing").join("readings.csv"));

        let result = sink.append(&record("2024-01-01T00:00:00+00:00")).await;

        assert!(matches!(result, Err(SinkError::Io(_))));
    }

    #[tokio::test]
    async fn test_memory_sink_unavailable() {
        let sink = MemorySink::new();
        sink.set_unavailable(true);

        assert!(sink.append(&record("a")).await.is_err());
        assert!(sink.records().is_empty());

        sink.set_unavailable(false);
        sink.append(&record("a")).await.unwrap();
        assert_eq!(sink.records().len(), 1);
    }
}
