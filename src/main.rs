//! OCPP device gateway binary.
//!
//! Reads configuration from a TOML file (`~/.config/ocpp-gateway/config.toml`
//! by default, `OCPP_GATEWAY_CONFIG` to override), starts every enabled
//! transport and runs until SIGTERM/SIGINT.

use tracing::{info, warn};

use voltgrid::config::{default_config_path, AppConfig};
use voltgrid::server::{init_tracing, GatewayHandle, GatewayOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Load configuration ─────────────────────────────────────
    let config_path = std::env::var("OCPP_GATEWAY_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| default_config_path());

    let config = match AppConfig::load(&config_path) {
        Ok(config) => {
            init_tracing(&config);
            info!("Configuration loaded from {}", config_path.display());
            config
        }
        Err(e) => {
            let config = AppConfig::default();
            init_tracing(&config);
            warn!(
                "Failed to load config from {}: {}. Using defaults.",
                config_path.display(),
                e
            );
            config
        }
    };

    // ── Prometheus exporter ────────────────────────────────────
    if config.metrics.enabled {
        match config.metrics.address().parse::<std::net::SocketAddr>() {
            Ok(addr) => {
                match metrics_exporter_prometheus::PrometheusBuilder::new()
                    .with_http_listener(addr)
                    .install()
                {
                    Ok(()) => info!("Prometheus metrics exporter on http://{}/metrics", addr),
                    Err(e) => warn!("Failed to install metrics exporter: {}", e),
                }
            }
            Err(e) => warn!("Invalid metrics address: {}", e),
        }
    }

    // ── Gateway ────────────────────────────────────────────────
    let handle = GatewayHandle::start(GatewayOptions { config }).await?;
    handle.install_signal_handler();

    handle.shutdown_signal().wait().await;
    info!("Shutdown signal received");
    handle.wait().await;

    Ok(())
}
