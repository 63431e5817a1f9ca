//! Server startup utilities.

use conveyor_config::AppConfig;
use conveyor_core::{ConveyorError, ConveyorResult};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Installs the global metrics recorder with a Prometheus scrape endpoint.
pub fn install_metrics_exporter(addr: &str) -> ConveyorResult<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| ConveyorError::Configuration(format!("Invalid metrics_addr '{}': {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| ConveyorError::Internal(format!("Failed to install metrics exporter: {}", e)))?;

    conveyor_jobs::register_metrics();
    info!("Prometheus metrics exposed on http://{}/metrics", addr);
    Ok(())
}

/// Lines describing what this process serves.
pub fn startup_lines(config: &AppConfig) -> Vec<String> {
    let role = config.deployment.role;
    let mut lines = vec![format!("Role:      {}", role)];

    if role.has_api() {
        let addr = config.server.addr();
        lines.push(format!("REST API:  http://{}/api/v1", addr));
        lines.push(format!("Health:    http://{}/health", addr));
    }
    if role.has_workers() {
        lines.push(format!("Workers:   {}", config.jobs.worker.concurrency));
    }
    if config.observability.metrics_enabled {
        lines.push(format!("Metrics:   http://{}/metrics", config.observability.metrics_addr));
    }
    lines
}

/// Prints server startup information.
pub fn print_startup_info(config: &AppConfig) {
    let separator = "=".repeat(60);
    info!("{}", separator);
    for line in startup_lines(config) {
        info!("{}", line);
    }
    info!("{}", separator);
}
