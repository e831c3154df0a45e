use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tunnelhub_common::constants::{
    self, HANDSHAKE_TIMEOUT_SECS, LOG_CAPACITY_PER_TUNNEL, LOG_CLEANUP_INTERVAL_SECS,
    LOG_RETENTION_SECS, MAX_BODY_SIZE_BYTES, MAX_CONSECUTIVE_MALFORMED_FRAMES,
    OUTBOUND_QUEUE_CAPACITY, REQUEST_TIMEOUT_SECS, VIEWER_QUEUE_CAPACITY,
};

/// CLI arguments for the broker
#[derive(Parser, Debug)]
#[command(name = "broker")]
#[command(about = "Tunnel relay broker: public HTTP ingress for WebSocket-connected hosts", long_about = None)]
#[command(version)]
pub struct Args {
    /// Address to bind
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Public base URL of this broker, announced to hosts
    #[arg(long, env = "PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Base URL of the web frontend hosting the tunnel entry page
    #[arg(long, env = "WEB_URL", default_value = "http://localhost:3001")]
    pub web_url: String,

    /// Seconds to wait for a host to answer a request
    #[arg(long, default_value_t = REQUEST_TIMEOUT_SECS)]
    pub request_timeout: u64,

    /// Maximum request/response body size in MB
    #[arg(long, default_value_t = MAX_BODY_SIZE_BYTES / (1024 * 1024))]
    pub max_payload_mb: usize,

    /// Frames queued per host before requests fail fast
    #[arg(long, default_value_t = OUTBOUND_QUEUE_CAPACITY)]
    pub outbound_queue: usize,

    /// Hours request logs are kept
    #[arg(long, default_value_t = (LOG_RETENTION_SECS / 3600) as u64)]
    pub log_retention_hours: u64,

    /// Seconds between log retention sweeps
    #[arg(long, default_value_t = LOG_CLEANUP_INTERVAL_SECS)]
    pub cleanup_interval: u64,

    /// Log entries kept in memory per tunnel
    #[arg(long, default_value_t = LOG_CAPACITY_PER_TUNNEL)]
    pub log_capacity: usize,

    /// Also log requests for static assets
    #[arg(long)]
    pub log_static_assets: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Runtime configuration of the broker
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: String,
    pub port: u16,

    /// Announced to hosts in `connection_established`
    pub public_url: String,

    /// Base URL of the entry page users are sent to without a tunnel ID
    pub web_url: String,

    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_body_size: usize,
    pub outbound_queue_capacity: usize,
    pub viewer_queue_capacity: usize,
    pub max_malformed_frames: u32,

    pub log_retention: Duration,
    pub cleanup_interval: Duration,
    pub log_capacity: usize,
    pub log_static_assets: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 3000,
            public_url: "http://localhost:3000".to_string(),
            web_url: "http://localhost:3001".to_string(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            max_body_size: MAX_BODY_SIZE_BYTES,
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
            viewer_queue_capacity: VIEWER_QUEUE_CAPACITY,
            max_malformed_frames: MAX_CONSECUTIVE_MALFORMED_FRAMES,
            log_retention: Duration::from_secs(LOG_RETENTION_SECS as u64),
            cleanup_interval: Duration::from_secs(LOG_CLEANUP_INTERVAL_SECS),
            log_capacity: LOG_CAPACITY_PER_TUNNEL,
            log_static_assets: false,
        }
    }
}

impl BrokerConfig {
    pub fn from_args(args: Args) -> Self {
        let public_url = args
            .public_url
            .unwrap_or_else(|| format!("http://localhost:{}", args.port));

        Self {
            bind_addr: args.bind,
            port: args.port,
            public_url: public_url.trim_end_matches('/').to_string(),
            web_url: args.web_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(args.request_timeout.max(1)),
            max_body_size: args.max_payload_mb.max(1) * 1024 * 1024,
            outbound_queue_capacity: args.outbound_queue.max(1),
            log_retention: Duration::from_secs(args.log_retention_hours.saturating_mul(3600)),
            cleanup_interval: Duration::from_secs(args.cleanup_interval.max(1)),
            log_capacity: args.log_capacity.max(1),
            log_static_assets: args.log_static_assets,
            ..Self::default()
        }
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.bind_addr, self.port).parse()?)
    }

    /// Largest WebSocket message exchanged with a host
    pub fn max_ws_message_size(&self) -> usize {
        constants::max_ws_message_size(self.max_body_size)
    }

    /// URL a host shares with its users
    pub fn tunnel_url(&self, tunnel_id: &str) -> String {
        format!("{}/?tunnel_id={}", self.public_url, tunnel_id)
    }
}
