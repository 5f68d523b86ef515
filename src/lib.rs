//! Multi-path HTTP forward proxy.
//!
//! Every inbound request is routed over one of several candidate egress
//! paths ("runways"): a local interface plus a DNS server, optionally via an
//! upstream HTTP proxy. Outcomes of real traffic and background probes feed a
//! per-(target, runway) accessibility tracker, which drives future routing
//! decisions.

pub mod config;
pub mod dns;
pub mod error;
pub mod health;
pub mod http;
pub mod net;
pub mod proxy;
pub mod routing;
pub mod runway;
pub mod runway_manager;
pub mod tracker;
pub mod validator;

pub use config::Config;
pub use dns::DNSResolver;
pub use error::{ProxyError, Result};
pub use health::HealthMonitor;
pub use proxy::{ConnectionInfo, ConnectionStatus, ProxyServer};
pub use routing::{RoutingEngine, RoutingMode};
pub use runway::{Runway, RunwayState};
pub use runway_manager::RunwayManager;
pub use tracker::{TargetAccessibilityTracker, TargetMetrics};
pub use validator::SuccessValidator;
