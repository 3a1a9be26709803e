use envconfig::Envconfig;
use iot_common::config::{BrokerConfig, EnvMsDuration};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "http://127.0.0.1:3030/iot_data")]
    pub source_url: String,

    #[envconfig(default = "1000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "600000")]
    pub max_run_duration: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "iot-producer")]
    pub client_id: String,

    #[envconfig(default = "5000")]
    pub shutdown_grace_period: EnvMsDuration,

    #[envconfig(nested = true)]
    pub broker: BrokerConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
