use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "care-signaling", about = "Presence and call-signaling broker")]
pub struct Args {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 3001)]
    pub port: u16,

    /// Browser origin allowed by CORS.
    #[arg(long, env = "CLIENT_URL", default_value = "http://localhost:3000")]
    pub client_url: String,

    /// Public base URL of the REST API; picture URLs are built under `/assets`.
    #[arg(long, env = "API_BASE_URL", default_value = "http://localhost:3001")]
    pub api_base_url: String,

    #[arg(long, env = "RING_TIMEOUT_SECS", default_value_t = 30)]
    pub ring_timeout_secs: u64,

    /// Per-connection outbound queue capacity.
    #[arg(long, env = "OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,

    #[arg(long, env = "BROKER_SHARDS", default_value_t = 16)]
    pub shards: usize,

    #[arg(long, default_value_t = 25)]
    pub ping_interval_secs: u64,

    #[arg(long, default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Postgres user store. Needs the `postgres` feature.
    #[arg(long, env = "SIGNALING_DB_URL")]
    pub database_url: Option<String>,

    /// Exit 0 if the port is already bound (server running), 1 otherwise.
    #[arg(long)]
    pub healthcheck: bool,
}

impl Args {
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            client_url: self.client_url.clone(),
            api_base_url: self.api_base_url.clone(),
            ring_timeout: Duration::from_secs(self.ring_timeout_secs),
            outbound_buffer: self.outbound_buffer.max(1),
            shards: self.shards.max(1),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

/// Runtime settings shared by the broker state and connection sessions.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub client_url: String,
    pub api_base_url: String,
    pub ring_timeout: Duration,
    pub outbound_buffer: usize,
    pub shards: usize,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_url: "http://localhost:3000".to_string(),
            api_base_url: "http://localhost:3001".to_string(),
            ring_timeout: Duration::from_secs(30),
            outbound_buffer: 64,
            shards: 16,
            ping_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
        }
    }
}
