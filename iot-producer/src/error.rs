use iot_common::broker::BrokerError;
use thiserror::Error;

/// Enumeration of errors fetching a reading from the data source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to build http client: {0}")]
    ClientError(reqwest::Error),
    #[error("request to data source failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("data source responded with status {0}")]
    StatusError(reqwest::StatusCode),
}

/// Enumeration of errors that stop the producer loop.
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("failed to open broker connection: {0}")]
    ConnectError(#[from] BrokerError),
}
