use iot_common::broker::BrokerError;
use iot_common::sink::SinkError;
use thiserror::Error;

/// Enumeration of errors that stop the consumer loop.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("gave up connecting to broker after {attempts} attempts: {source}")]
    ConnectError {
        attempts: u32,
        #[source]
        source: BrokerError,
    },
    #[error("failed to seed duplicate guard from sink: {0}")]
    SeedError(#[from] SinkError),
}
