use envconfig::Envconfig;
use iot_common::config::{BrokerConfig, EnvMsDuration};
use iot_consumer::config::ConnectRetryConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub simulator: iot_simulator::config::Config,

    #[envconfig(default = "1000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "600000")]
    pub max_run_duration: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "IOT_data.csv")]
    pub sink_path: String,

    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(default = "true")]
    pub seed_guard_from_sink: bool,

    /// Route messages through an in-process broker instead of MQTT.
    #[envconfig(default = "false")]
    pub memory_broker: bool,

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

    /// Where the producer polls the in-process simulator.
    pub fn source_url(&self) -> String {
        format!("http://{}/iot_data", self.simulator.bind())
    }
}
