use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "SIMULATOR_HOST", default = "127.0.0.1")]
    pub host: String,

    #[envconfig(from = "SIMULATOR_PORT", default = "3030")]
    pub port: u16,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
