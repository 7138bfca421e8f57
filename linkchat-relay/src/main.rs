//! `LinkChat` relay: message bus plus asset receiving service.
//!
//! The bus is an axum WebSocket server that registers display names and
//! routes text messages between them, queuing for offline recipients. The
//! asset service accepts chunked uploads over TCP and stores them where
//! the bus serves them under `/received/`.
//!
//! # Usage
//!
//! ```bash
//! # Bus on 0.0.0.0:8000, assets on 0.0.0.0:9001
//! cargo run --bin linkchat-relay
//!
//! # Custom addresses and 10% simulated chunk loss
//! cargo run --bin linkchat-relay -- --bind 127.0.0.1:8080 \
//!     --asset-bind 127.0.0.1:9101 --loss-rate 0.1
//! ```

use clap::Parser;
use linkchat_relay::assets;
use linkchat_relay::bus;
use linkchat_relay::config::{RelayCliArgs, RelayConfig};

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        bus = %config.bind_addr,
        assets = %config.asset_bind_addr,
        received_dir = %config.received_dir.display(),
        "starting linkchat relay"
    );

    let (asset_addr, asset_handle) =
        match assets::start_asset_server(&config.asset_bind_addr, config.asset_settings()).await {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(error = %e, "failed to start asset service");
                std::process::exit(1);
            }
        };
    tracing::info!(addr = %asset_addr, "asset service listening");

    let (bus_addr, bus_handle) =
        match bus::start_server_with(&config.bind_addr, &config.bus_settings()).await {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(error = %e, "failed to start message bus");
                std::process::exit(1);
            }
        };
    tracing::info!(addr = %bus_addr, "message bus listening");

    tokio::select! {
        result = bus_handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "message bus task failed");
            }
        }
        result = asset_handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "asset service task failed");
            }
        }
    }
}
