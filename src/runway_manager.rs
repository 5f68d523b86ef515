use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use get_if_addrs::{get_if_addrs, IfAddr};
use parking_lot::RwLock;

use crate::config::{DNSServerConfig, UpstreamProxyConfig};
use crate::dns::DNSResolver;
use crate::net::connect_from;
use crate::runway::{DNSServer, Runway, UpstreamProxy};

/// Port probed on direct runways when checking raw reachability.
const PROBE_PORT: u16 = 80;

#[derive(Debug, Clone)]
struct InterfaceInfo {
    ip: IpAddr,
    #[allow(dead_code)]
    netmask: Option<String>,
}

/// Owns the runway set: enumerates local IPv4 interfaces, crosses them with
/// configured DNS servers and upstream proxies, and hands out value snapshots
/// of the resulting runways. Also hosts the probe engine, which checks raw
/// reachability of a (target, runway) pair.
pub struct RunwayManager {
    interfaces: Vec<String>,
    upstream_proxies: Vec<UpstreamProxy>,
    dns_servers: Vec<DNSServer>,
    dns_resolver: Arc<DNSResolver>,
    runways: RwLock<HashMap<String, Runway>>,
    interface_info: RwLock<HashMap<String, InterfaceInfo>>,
}

impl RunwayManager {
    pub fn new(
        interfaces: Vec<String>,
        upstream_proxies: Vec<UpstreamProxyConfig>,
        dns_servers: Vec<DNSServerConfig>,
        dns_resolver: Arc<DNSResolver>,
    ) -> Self {
        let manager = Self {
            interfaces,
            upstream_proxies: upstream_proxies.into_iter().map(UpstreamProxy::new).collect(),
            dns_servers: dns_servers.into_iter().map(DNSServer::new).collect(),
            dns_resolver,
            runways: RwLock::new(HashMap::new()),
            interface_info: RwLock::new(HashMap::new()),
        };

        manager.discover_interfaces();
        manager
    }

    fn discover_interfaces(&self) {
        let if_addrs = match get_if_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                log::error!("Error discovering interfaces: {}", e);
                return;
            }
        };

        let mut interface_info = self.interface_info.write();

        let current: HashSet<String> = if_addrs
            .iter()
            .filter(|iface| iface.ip().is_ipv4())
            .map(|iface| iface.name.clone())
            .collect();

        for iface in if_addrs {
            let IpAddr::V4(ipv4) = iface.ip() else {
                continue;
            };
            let netmask = match &iface.addr {
                IfAddr::V4(v4) => Some(v4.netmask.to_string()),
                _ => None,
            };

            let new_ip = IpAddr::V4(ipv4);
            let old_ip = interface_info.get(&iface.name).map(|info| info.ip);

            interface_info.insert(iface.name.clone(), InterfaceInfo { ip: new_ip, netmask });

            match old_ip {
                Some(old) if old != new_ip => {
                    log::warn!("Interface {} IP changed: {} -> {}", iface.name, old, new_ip);
                }
                None => {
                    log::debug!("Discovered interface {}: {}", iface.name, new_ip);
                }
                _ => {}
            }
        }

        let known: HashSet<String> = interface_info.keys().cloned().collect();
        for removed in known.difference(&current) {
            log::warn!("Interface {} removed/disconnected", removed);
        }
        interface_info.retain(|name, _| current.contains(name));
    }

    /// Re-enumerates interfaces and logs the diff. Already-minted runways stay
    /// in the registry until the next full discovery.
    pub fn refresh_interfaces(&self) {
        let old: HashSet<String> = self.interface_info.read().keys().cloned().collect();
        self.discover_interfaces();
        let new: HashSet<String> = self.interface_info.read().keys().cloned().collect();

        let added: Vec<_> = new.difference(&old).collect();
        let removed: Vec<_> = old.difference(&new).collect();

        if !added.is_empty() {
            log::info!("New interfaces detected: {:?}", added);
        }
        if !removed.is_empty() {
            log::warn!("Interfaces removed: {:?}", removed);
        }
    }

    /// Builds the full runway set from live interfaces: one direct runway per
    /// (interface, DNS server), one proxy runway per (interface, proxy, DNS
    /// server). The id counter is monotonic over the whole pass.
    pub fn discover_runways(&self) -> Vec<Runway> {
        let interface_info = self.interface_info.read();

        let interfaces_to_use: Vec<String> = if self.interfaces.iter().any(|i| i == "auto") {
            interface_info.keys().cloned().collect()
        } else {
            self.interfaces
                .iter()
                .filter(|name| interface_info.contains_key(*name))
                .cloned()
                .collect()
        };

        let mut runways = Vec::new();
        let mut runway_id_counter = 0;

        for interface in &interfaces_to_use {
            let Some(info) = interface_info.get(interface) else {
                continue;
            };
            for dns_server in &self.dns_servers {
                let id = format!(
                    "direct_{}_{}_{}",
                    interface, dns_server.config.host, runway_id_counter
                );
                runways.push(Runway::new(
                    id,
                    interface.clone(),
                    Some(info.ip),
                    None,
                    Some(dns_server.clone()),
                ));
                runway_id_counter += 1;
            }
        }

        for interface in &interfaces_to_use {
            let Some(info) = interface_info.get(interface) else {
                continue;
            };
            for proxy in &self.upstream_proxies {
                for dns_server in &self.dns_servers {
                    let id = format!(
                        "proxy_{}_{}_{}_{}_{}",
                        interface,
                        proxy.config.proxy_type,
                        proxy.config.host,
                        dns_server.config.host,
                        runway_id_counter
                    );
                    runways.push(Runway::new(
                        id,
                        interface.clone(),
                        Some(info.ip),
                        Some(proxy.clone()),
                        Some(dns_server.clone()),
                    ));
                    runway_id_counter += 1;
                }
            }
        }

        {
            let mut runways_map = self.runways.write();
            runways_map.clear();
            for runway in &runways {
                runways_map.insert(runway.id.clone(), runway.clone());
            }
        }

        log::info!("Discovered {} runways", runways.len());
        runways
    }

    pub fn get_runway(&self, runway_id: &str) -> Option<Runway> {
        self.runways.read().get(runway_id).cloned()
    }

    pub fn get_all_runways(&self) -> Vec<Runway> {
        self.runways.read().values().cloned().collect()
    }

    /// Probes raw reachability of `target` through `runway`: a TCP handshake
    /// to the resolved target (direct) or to the upstream proxy endpoint.
    /// Probes cannot run the page-level validator, so the user-level outcome
    /// mirrors the network-level one.
    pub async fn test_runway_accessibility(
        &self,
        target: &str,
        runway: &Runway,
        timeout: Duration,
    ) -> (bool, bool, Duration) {
        let start = Instant::now();

        let resolved_ip = if self.dns_resolver.is_ip_address(target)
            || self.dns_resolver.is_private_ip(target)
        {
            target.parse().ok()
        } else {
            self.dns_resolver.resolve(target).await.0
        };

        let Some(target_ip) = resolved_ip else {
            return (false, false, start.elapsed());
        };

        let network_success = if runway.upstream_proxy.is_some() {
            self.test_proxy_connection(runway, timeout).await
        } else {
            self.test_direct_connection(runway, target_ip, timeout).await
        };

        let elapsed = start.elapsed();
        (network_success, network_success, elapsed)
    }

    async fn test_direct_connection(
        &self,
        runway: &Runway,
        target_ip: IpAddr,
        timeout: Duration,
    ) -> bool {
        if !self.interface_info.read().contains_key(&runway.interface) {
            log::debug!(
                "Interface {} not available for runway {}",
                runway.interface,
                runway.id
            );
            return false;
        }

        match connect_from(runway.source_ip, SocketAddr::new(target_ip, PROBE_PORT), timeout).await
        {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Probe connect to {} failed: {}", target_ip, e);
                false
            }
        }
    }

    async fn test_proxy_connection(&self, runway: &Runway, timeout: Duration) -> bool {
        let Some(proxy) = &runway.upstream_proxy else {
            return false;
        };

        if !proxy.accessible {
            log::debug!("Proxy {} marked as inaccessible", proxy.config.host);
            return false;
        }

        let proxy_ip = if self.dns_resolver.is_ip_address(&proxy.config.host) {
            proxy.config.host.parse().ok()
        } else {
            self.dns_resolver.resolve(&proxy.config.host).await.0
        };
        let Some(proxy_ip) = proxy_ip else {
            return false;
        };

        match connect_from(
            runway.source_ip,
            SocketAddr::new(proxy_ip, proxy.config.port),
            timeout,
        )
        .await
        {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Probe connect to proxy {} failed: {}", proxy.config.host, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dns_config(host: &str) -> DNSServerConfig {
        DNSServerConfig {
            host: host.to_string(),
            port: 53,
            name: String::new(),
        }
    }

    fn proxy_config(host: &str) -> UpstreamProxyConfig {
        UpstreamProxyConfig {
            proxy_type: "http".to_string(),
            host: host.to_string(),
            port: 3128,
        }
    }

    fn manager_with_fake_interfaces(
        selectors: Vec<String>,
        proxies: Vec<UpstreamProxyConfig>,
        dns: Vec<DNSServerConfig>,
        fake_interfaces: &[(&str, &str)],
    ) -> RunwayManager {
        let resolver = Arc::new(DNSResolver::new(vec![], 1.0));
        let manager = RunwayManager::new(selectors, proxies, dns, resolver);
        {
            let mut info = manager.interface_info.write();
            info.clear();
            for (name, ip) in fake_interfaces {
                info.insert(
                    name.to_string(),
                    InterfaceInfo {
                        ip: ip.parse().unwrap(),
                        netmask: None,
                    },
                );
            }
        }
        manager
    }

    #[test]
    fn test_runway_id_formats_and_counter() {
        let manager = manager_with_fake_interfaces(
            vec!["wan0".to_string()],
            vec![proxy_config("10.0.0.1")],
            vec![dns_config("8.8.8.8"), dns_config("1.1.1.1")],
            &[("wan0", "192.0.2.10")],
        );

        let runways = manager.discover_runways();
        let ids: Vec<&str> = runways.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "direct_wan0_8.8.8.8_0",
                "direct_wan0_1.1.1.1_1",
                "proxy_wan0_http_10.0.0.1_8.8.8.8_2",
                "proxy_wan0_http_10.0.0.1_1.1.1.1_3",
            ]
        );

        assert!(runways[0].is_direct);
        assert!(!runways[2].is_direct);
        assert_eq!(runways[0].source_ip, Some("192.0.2.10".parse().unwrap()));
    }

    #[test]
    fn test_named_selector_skips_missing_interfaces() {
        let manager = manager_with_fake_interfaces(
            vec!["wan0".to_string(), "wan9".to_string()],
            vec![],
            vec![dns_config("8.8.8.8")],
            &[("wan0", "192.0.2.10")],
        );

        let runways = manager.discover_runways();
        assert_eq!(runways.len(), 1);
        assert_eq!(runways[0].interface, "wan0");
    }

    #[test]
    fn test_auto_selector_uses_all_interfaces() {
        let manager = manager_with_fake_interfaces(
            vec!["auto".to_string()],
            vec![],
            vec![dns_config("8.8.8.8")],
            &[("wan0", "192.0.2.10"), ("wan1", "192.0.2.11")],
        );

        let runways = manager.discover_runways();
        assert_eq!(runways.len(), 2);
    }

    #[test]
    fn test_no_dns_servers_means_no_runways() {
        let manager = manager_with_fake_interfaces(
            vec!["auto".to_string()],
            vec![proxy_config("10.0.0.1")],
            vec![],
            &[("wan0", "192.0.2.10")],
        );

        assert!(manager.discover_runways().is_empty());
    }

    #[test]
    fn test_registry_lookup() {
        let manager = manager_with_fake_interfaces(
            vec!["wan0".to_string()],
            vec![],
            vec![dns_config("8.8.8.8")],
            &[("wan0", "192.0.2.10")],
        );

        let runways = manager.discover_runways();
        let id = &runways[0].id;
        assert!(manager.get_runway(id).is_some());
        assert!(manager.get_runway("direct_ghost_9.9.9.9_0").is_none());
        assert_eq!(manager.get_all_runways().len(), 1);
    }

    #[tokio::test]
    async fn test_probe_direct_runway_flags_mirror() {
        // Discover real interfaces so loopback is present in interface_info.
        let resolver = Arc::new(DNSResolver::new(vec![], 1.0));
        let manager = RunwayManager::new(
            vec!["auto".to_string()],
            vec![],
            vec![dns_config("127.0.0.1")],
            resolver,
        );

        let loopback_iface = manager
            .interface_info
            .read()
            .iter()
            .find(|(_, info)| info.ip == "127.0.0.1".parse::<IpAddr>().unwrap())
            .map(|(name, _)| name.clone());
        let Some(iface) = loopback_iface else {
            // No loopback interface visible in this environment.
            return;
        };

        let runway = Runway::new(
            "direct_lo_127.0.0.1_0".to_string(),
            iface,
            Some("127.0.0.1".parse().unwrap()),
            None,
            None,
        );

        let (net, user, _) = manager
            .test_runway_accessibility("127.0.0.1", &runway, Duration::from_millis(200))
            .await;
        // Port 80 on loopback is normally closed; both flags mirror each other.
        assert_eq!(net, user);
    }
}
