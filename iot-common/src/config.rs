use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

/// Broker settings shared by every process that talks to the pub/sub broker.
#[derive(Envconfig, Clone, Debug)]
pub struct BrokerConfig {
    #[envconfig(from = "MQTT_HOST", default = "localhost")]
    pub host: String,

    #[envconfig(from = "MQTT_PORT", default = "1883")]
    pub port: u16,

    #[envconfig(from = "MQTT_KEEP_ALIVE_SECS", default = "60")]
    pub keep_alive_secs: u64,

    #[envconfig(from = "MQTT_CONNECT_TIMEOUT", default = "5000")]
    pub connect_timeout: EnvMsDuration,

    #[envconfig(from = "RAW_TOPIC", default = "RawIOTData")]
    pub raw_topic: NonEmptyString,

    #[envconfig(from = "CLEAN_TOPIC", default = "CleanIOTData")]
    pub clean_topic: NonEmptyString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
