use pathproxy::*;
use std::sync::Arc;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config = Config::load(&config_path).unwrap_or_else(|e| {
        eprintln!("Using default configuration: {}", e);
        Config::default()
    });

    // Setup logging
    let log_level = config.log_level.as_deref().unwrap_or("INFO");
    env_logger::Builder::from_default_env()
        .filter_level(match log_level {
            "DEBUG" => log::LevelFilter::Debug,
            "INFO" => log::LevelFilter::Info,
            "WARN" => log::LevelFilter::Warn,
            "ERROR" => log::LevelFilter::Error,
            _ => log::LevelFilter::Info,
        })
        .init();

    log::info!("Initializing pathproxy service...");

    let dns_resolver = Arc::new(DNSResolver::new(
        config.dns_servers.clone(),
        config.dns_timeout(),
    ));

    let runway_manager = Arc::new(RunwayManager::new(
        config.interfaces.clone(),
        config.upstream_proxies.clone(),
        config.dns_servers.clone(),
        Arc::clone(&dns_resolver),
    ));

    let runways = runway_manager.discover_runways();
    log::info!("Discovered {} runways", runways.len());

    let tracker = Arc::new(TargetAccessibilityTracker::new(
        config.success_rate_window(),
        config.success_rate_threshold(),
    ));

    let validator = Arc::new(SuccessValidator::new());

    let routing_engine = Arc::new(RoutingEngine::new(
        Arc::clone(&tracker),
        config.routing_mode(),
    ));

    let proxy_server = Arc::new(ProxyServer::new(
        config.clone(),
        Arc::clone(&runway_manager),
        Arc::clone(&routing_engine),
        Arc::clone(&tracker),
        Arc::clone(&dns_resolver),
        Arc::clone(&validator),
    ));

    let health_monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&runway_manager),
        Arc::clone(&tracker),
        config.health_check_interval(),
    ));

    log::info!("Initialization complete");

    let server_handle = Arc::clone(&proxy_server).start().await?;

    let health_handle = {
        let monitor = Arc::clone(&health_monitor);
        tokio::spawn(async move {
            monitor.start().await;
        })
    };

    log::info!("pathproxy service started");

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down...");

    proxy_server.stop();
    health_monitor.stop();
    let _ = server_handle.await;
    let _ = health_handle.await;

    log::info!("pathproxy service stopped");
    Ok(())
}
