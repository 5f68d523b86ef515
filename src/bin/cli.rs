use pathproxy::*;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser)]
#[command(name = "pathproxy-cli")]
#[command(about = "pathproxy management tool")]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long, default_value = "config.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Overall service configuration summary
    Status,
    /// Enumerated runways
    Runways,
    /// Known targets with per-runway metrics
    Targets,
    /// Aggregate tracker statistics
    Stats,
    /// Change the routing mode for this invocation
    Mode { mode: String },
    /// Probe a target through one runway, or through all of them
    Test {
        target: String,
        runway_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();

    let config = Config::load(&cli.config).unwrap_or_else(|_| Config::default());

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
    runway_manager.discover_runways();

    let tracker = Arc::new(TargetAccessibilityTracker::new(
        config.success_rate_window(),
        config.success_rate_threshold(),
    ));

    let routing_engine = Arc::new(RoutingEngine::new(
        Arc::clone(&tracker),
        config.routing_mode(),
    ));

    match cli.command {
        Commands::Status => {
            let runways_count = runway_manager.get_all_runways().len();
            let targets_count = tracker.get_all_targets().len();
            let mode = format!("{:?}", routing_engine.mode());

            if cli.json {
                let status = json!({
                    "routing_mode": mode,
                    "runways_count": runways_count,
                    "targets_count": targets_count,
                    "listen": format!("{}:{}", config.listen_host(), config.listen_port()),
                });
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Routing Mode: {}", mode);
                println!("Runways: {}", runways_count);
                println!("Targets: {}", targets_count);
                println!("Listen: {}:{}", config.listen_host(), config.listen_port());
            }
        }
        Commands::Runways => {
            let all_runways = runway_manager.get_all_runways();
            if cli.json {
                let runways_data: Vec<_> = all_runways
                    .iter()
                    .map(|r| {
                        json!({
                            "id": r.id,
                            "interface": r.interface,
                            "source_ip": r.source_ip.map(|ip| ip.to_string()),
                            "is_direct": r.is_direct,
                            "upstream_proxy": r.upstream_proxy.as_ref().map(|p| {
                                format!("{}://{}:{}", p.config.proxy_type, p.config.host, p.config.port)
                            }),
                            "dns_server": r.dns_server.as_ref().map(|d| {
                                format!("{}:{}", d.config.host, d.config.port)
                            }),
                        })
                    })
                    .collect();
                let output = json!({ "runways": runways_data, "count": runways_data.len() });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                for runway in &all_runways {
                    println!(
                        "{}: {} (direct: {})",
                        runway.id, runway.interface, runway.is_direct
                    );
                }
            }
        }
        Commands::Targets => {
            let targets = tracker.get_all_targets();
            if cli.json {
                let mut targets_data = serde_json::Map::new();
                for target in targets {
                    let metrics = tracker.get_target_metrics(&target);
                    let mut target_info = serde_json::Map::new();
                    for (runway_id, m) in metrics {
                        target_info.insert(
                            runway_id,
                            json!({
                                "state": format!("{:?}", m.state),
                                "total_attempts": m.total_attempts,
                                "network_success_count": m.network_success_count,
                                "user_success_count": m.user_success_count,
                                "partial_success_count": m.partial_success_count,
                                "failure_count": m.failure_count,
                                "consecutive_failures": m.consecutive_failures,
                                "recovery_count": m.recovery_count,
                                "success_rate": m.success_rate,
                                "avg_response_time": m.avg_response_time,
                            }),
                        );
                    }
                    targets_data.insert(target, serde_json::Value::Object(target_info));
                }
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::Value::Object(targets_data))?
                );
            } else {
                for target in targets {
                    println!("{}:", target);
                    for (runway_id, m) in tracker.get_target_metrics(&target) {
                        println!(
                            "  {}: {:?} rate={:.2} avg={:.3}s attempts={}",
                            runway_id, m.state, m.success_rate, m.avg_response_time, m.total_attempts
                        );
                    }
                }
            }
        }
        Commands::Stats => {
            let targets = tracker.get_all_targets();
            let mut attempts = 0u64;
            let mut successes = 0u64;
            let mut failures = 0u64;
            for target in &targets {
                for m in tracker.get_target_metrics(target).values() {
                    attempts += m.total_attempts;
                    successes += m.user_success_count;
                    failures += m.failure_count;
                }
            }

            if cli.json {
                let stats = json!({
                    "targets": targets.len(),
                    "total_attempts": attempts,
                    "user_successes": successes,
                    "failures": failures,
                });
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Targets: {}", targets.len());
                println!("Attempts: {}", attempts);
                println!("User successes: {}", successes);
                println!("Failures: {}", failures);
            }
        }
        Commands::Mode { mode } => match RoutingMode::parse(&mode) {
            Some(parsed) => {
                routing_engine.set_mode(parsed);
                println!("Routing mode set to {:?}", parsed);
            }
            None => {
                eprintln!(
                    "Unknown mode '{}'. Expected latency, first_accessible or round_robin.",
                    mode
                );
                std::process::exit(1);
            }
        },
        Commands::Test { target, runway_id } => {
            let runways = match runway_id {
                Some(id) => match runway_manager.get_runway(&id) {
                    Some(r) => vec![r],
                    None => {
                        eprintln!("Unknown runway id: {}", id);
                        std::process::exit(1);
                    }
                },
                None => runway_manager.get_all_runways(),
            };

            let timeout = Duration::from_secs(config.accessibility_timeout.unwrap_or(5));
            for runway in runways {
                let (net, user, rtt) = runway_manager
                    .test_runway_accessibility(&target, &runway, timeout)
                    .await;
                if cli.json {
                    let result = json!({
                        "runway": runway.id,
                        "network_success": net,
                        "user_success": user,
                        "rtt_ms": rtt.as_millis() as u64,
                    });
                    println!("{}", serde_json::to_string(&result)?);
                } else {
                    println!(
                        "{}: network={} user={} rtt={:?}",
                        runway.id, net, user, rtt
                    );
                }
            }
        }
    }

    Ok(())
}
