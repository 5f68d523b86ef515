use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ProxyError, Result};
use crate::routing::RoutingMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub routing_mode: Option<String>,
    pub dns_servers: Vec<DNSServerConfig>,
    pub upstream_proxies: Vec<UpstreamProxyConfig>,
    pub interfaces: Vec<String>,
    pub health_check_interval: Option<u64>,
    pub accessibility_timeout: Option<u64>,
    pub dns_timeout: Option<f64>,
    pub network_timeout: Option<u64>,
    pub user_validation_timeout: Option<u64>,
    pub max_concurrent_connections: Option<usize>,
    pub max_connections_per_runway: Option<usize>,
    pub success_rate_threshold: Option<f64>,
    pub success_rate_window: Option<usize>,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub log_max_bytes: Option<u64>,
    pub log_backup_count: Option<usize>,
    pub proxy_listen_host: Option<String>,
    pub proxy_listen_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DNSServerConfig {
    pub host: String,
    #[serde(default = "default_dns_port")]
    pub port: u16,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub host: String,
    pub port: u16,
}

fn default_dns_port() -> u16 {
    53
}

impl Default for Config {
    fn default() -> Self {
        Self {
            routing_mode: Some("latency".to_string()),
            dns_servers: vec![],
            upstream_proxies: vec![],
            interfaces: vec!["auto".to_string()],
            health_check_interval: Some(60),
            accessibility_timeout: Some(5),
            dns_timeout: Some(3.0),
            network_timeout: Some(10),
            user_validation_timeout: Some(15),
            max_concurrent_connections: Some(100),
            max_connections_per_runway: Some(10),
            success_rate_threshold: Some(0.5),
            success_rate_window: Some(10),
            log_level: Some("INFO".to_string()),
            log_file: Some("logs/proxy.log".to_string()),
            log_max_bytes: Some(10_485_760),
            log_backup_count: Some(5),
            proxy_listen_host: Some("127.0.0.1".to_string()),
            proxy_listen_port: Some(2123),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|_| ProxyError::ConfigNotFound {
            path: path.to_string(),
        })?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ProxyError::config_parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(mode) = self.routing_mode.as_deref() {
            if !matches!(mode, "latency" | "first_accessible" | "round_robin") {
                return Err(ProxyError::config_validation(format!(
                    "unknown routing_mode: {}",
                    mode
                )));
            }
        }

        if let Some(threshold) = self.success_rate_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ProxyError::config_validation(format!(
                    "success_rate_threshold must be within [0, 1], got {}",
                    threshold
                )));
            }
        }

        if let Some(timeout) = self.dns_timeout {
            if timeout <= 0.0 {
                return Err(ProxyError::config_validation("dns_timeout must be positive"));
            }
        }

        for dns in &self.dns_servers {
            if dns.host.is_empty() {
                return Err(ProxyError::config_validation("DNS server host is empty"));
            }
        }

        for proxy in &self.upstream_proxies {
            if proxy.host.is_empty() {
                return Err(ProxyError::config_validation("upstream proxy host is empty"));
            }
        }

        Ok(())
    }

    pub fn routing_mode(&self) -> RoutingMode {
        match self.routing_mode.as_deref() {
            Some("latency") => RoutingMode::Latency,
            Some("first_accessible") => RoutingMode::FirstAccessible,
            Some("round_robin") => RoutingMode::RoundRobin,
            _ => RoutingMode::Latency,
        }
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout.unwrap_or(10))
    }

    pub fn dns_timeout(&self) -> f64 {
        self.dns_timeout.unwrap_or(3.0)
    }

    pub fn accessibility_timeout(&self) -> Duration {
        Duration::from_secs(self.accessibility_timeout.unwrap_or(5))
    }

    pub fn health_check_interval(&self) -> u64 {
        self.health_check_interval.unwrap_or(60)
    }

    pub fn success_rate_window(&self) -> usize {
        self.success_rate_window.unwrap_or(10)
    }

    pub fn success_rate_threshold(&self) -> f64 {
        self.success_rate_threshold.unwrap_or(0.5)
    }

    pub fn listen_host(&self) -> &str {
        self.proxy_listen_host.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn listen_port(&self) -> u16 {
        self.proxy_listen_port.unwrap_or(2123)
    }
}
