//! Presence server binary.
//!
//! Runs the coordinator on `PRESENCE_BIND_ADDR` (default `127.0.0.1:4000`).
//! Logging via `RUST_LOG` (env_logger).

use editext_presence::{PresenceServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let bind_addr = std::env::var("PRESENCE_BIND_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:4000".to_string());
    let heartbeat_interval_secs = std::env::var("PRESENCE_HEARTBEAT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    let config = ServerConfig {
        bind_addr,
        heartbeat_interval_secs,
        ..ServerConfig::default()
    };

    let server = PresenceServer::new(config);
    server.run().await
}
