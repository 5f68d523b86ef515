use std::net::IpAddr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::{DNSServerConfig, UpstreamProxyConfig};

/// Tracker-derived accessibility state of a (target, runway) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunwayState {
    Unknown,
    Accessible,
    PartiallyAccessible,
    Inaccessible,
    Testing,
}

#[derive(Debug, Clone)]
pub struct DNSServer {
    pub config: DNSServerConfig,
    pub response_time: f64,
    pub last_success: Option<Instant>,
    pub failure_count: u32,
}

impl DNSServer {
    pub fn new(config: DNSServerConfig) -> Self {
        Self {
            config,
            response_time: 0.0,
            last_success: None,
            failure_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    pub config: UpstreamProxyConfig,
    pub accessible: bool,
    pub last_success: Option<Instant>,
    pub failure_count: u32,
}

impl UpstreamProxy {
    pub fn new(config: UpstreamProxyConfig) -> Self {
        Self {
            config,
            accessible: true,
            last_success: None,
            failure_count: 0,
        }
    }
}

/// One concrete egress path: a source interface plus a DNS server, optionally
/// going through one upstream proxy. Runways are minted during discovery and
/// never mutated afterwards; everything else refers to them by `id`.
#[derive(Debug, Clone)]
pub struct Runway {
    pub id: String,
    pub interface: String,
    pub source_ip: Option<IpAddr>,
    pub upstream_proxy: Option<UpstreamProxy>,
    pub dns_server: Option<DNSServer>,
    pub is_direct: bool,
}

impl Runway {
    pub fn new(
        id: String,
        interface: String,
        source_ip: Option<IpAddr>,
        upstream_proxy: Option<UpstreamProxy>,
        dns_server: Option<DNSServer>,
    ) -> Self {
        let is_direct = upstream_proxy.is_none();
        Self {
            id,
            interface,
            source_ip,
            upstream_proxy,
            dns_server,
            is_direct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_flag_follows_proxy_presence() {
        let direct = Runway::new("direct_eth0_8.8.8.8_0".into(), "eth0".into(), None, None, None);
        assert!(direct.is_direct);

        let proxy = UpstreamProxy::new(UpstreamProxyConfig {
            proxy_type: "http".into(),
            host: "10.0.0.1".into(),
            port: 3128,
        });
        let via_proxy = Runway::new(
            "proxy_eth0_http_10.0.0.1_8.8.8.8_1".into(),
            "eth0".into(),
            None,
            Some(proxy),
            None,
        );
        assert!(!via_proxy.is_direct);
    }
}
