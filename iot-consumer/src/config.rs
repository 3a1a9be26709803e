use std::time;

use envconfig::Envconfig;
use iot_common::config::{BrokerConfig, EnvMsDuration};
use iot_common::retry::RetryPolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3303")]
    pub port: u16,

    #[envconfig(default = "IOT_data.csv")]
    pub sink_path: String,

    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(default = "true")]
    pub seed_guard_from_sink: bool,

    #[envconfig(default = "iot-consumer")]
    pub client_id: String,

    #[envconfig(default = "5000")]
    pub shutdown_grace_period: EnvMsDuration,

    #[envconfig(nested = true)]
    pub retry_policy: ConnectRetryConfig,

    #[envconfig(nested = true)]
    pub broker: BrokerConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConnectRetryConfig {
    #[envconfig(from = "CONNECT_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "CONNECT_INITIAL_INTERVAL", default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "CONNECT_MAXIMUM_INTERVAL", default = "30000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(from = "CONNECT_MAX_ATTEMPTS", default = "5")]
    pub max_attempts: u32,
}

impl ConnectRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .max_attempts(self.max_attempts)
            .provide()
    }

    /// Liveness deadline long enough to cover the slowest reconnect backoff.
    pub fn liveness_deadline(&self) -> time::Duration {
        self.maximum_interval.0.max(time::Duration::from_secs(30)) * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.sink_path, "IOT_data.csv");
        assert!(!config.print_sink);
        assert!(config.seed_guard_from_sink);
        assert_eq!(config.bind(), "0.0.0.0:3303");

        let policy = config.retry_policy.policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.retry_interval(1), time::Duration::from_secs(1));
        assert_eq!(policy.retry_interval(3), time::Duration::from_secs(4));
        assert_eq!(policy.retry_interval(10), time::Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let env = HashMap::from([
            ("PRINT_SINK".to_owned(), "true".to_owned()),
            ("CONNECT_MAX_ATTEMPTS".to_owned(), "2".to_owned()),
            ("RAW_TOPIC".to_owned(), "raw".to_owned()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert!(config.print_sink);
        assert_eq!(config.retry_policy.policy().max_attempts, 2);
        assert_eq!(config.broker.raw_topic.as_str(), "raw");
    }
}
