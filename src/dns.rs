//! Minimal RFC 1035 resolver: type-A queries over UDP with a fixed-TTL cache.
//!
//! Server-provided TTLs are ignored on purpose; every answer is cached for
//! 300 seconds. Literal IPv4 targets and RFC 1918 addresses never reach the
//! wire.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::net::UdpSocket;

use crate::config::DNSServerConfig;

const CACHE_TTL: Duration = Duration::from_secs(300);
const MAX_LABEL_LEN: usize = 63;
const MAX_COMPRESSION_JUMPS: usize = 10;
const RESPONSE_BUF_LEN: usize = 512;

pub struct DNSResolver {
    servers: Vec<DNSServerConfig>,
    cache: RwLock<HashMap<String, (IpAddr, Instant)>>,
    timeout: Duration,
    query_id: AtomicU16,
}

impl DNSResolver {
    pub fn new(servers: Vec<DNSServerConfig>, timeout_secs: f64) -> Self {
        Self {
            servers,
            cache: RwLock::new(HashMap::new()),
            timeout: Duration::from_secs_f64(timeout_secs),
            query_id: AtomicU16::new(
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() as u16)
                    .unwrap_or(0),
            ),
        }
    }

    /// True iff `target` is a dotted-quad IPv4 literal.
    pub fn is_ip_address(&self, target: &str) -> bool {
        target.parse::<Ipv4Addr>().is_ok()
    }

    /// True for 10/8, 172.16/12 and 192.168/16.
    pub fn is_private_ip(&self, ip: &str) -> bool {
        ip.parse::<Ipv4Addr>()
            .map(|addr| addr.is_private())
            .unwrap_or(false)
    }

    /// Resolves `domain` to an IPv4 address, trying configured servers in
    /// order. Returns `(None, 0)` when every server fails; failures are never
    /// cached.
    pub async fn resolve(&self, domain: &str) -> (Option<IpAddr>, Duration) {
        // Literals skip DNS entirely.
        if let Ok(ip) = domain.parse::<Ipv4Addr>() {
            return (Some(IpAddr::V4(ip)), Duration::ZERO);
        }

        {
            let cache = self.cache.read();
            if let Some((ip, expiry)) = cache.get(domain) {
                if Instant::now() < *expiry {
                    return (Some(*ip), Duration::ZERO);
                }
            }
        }

        let id = self.query_id.fetch_add(1, Ordering::Relaxed);
        let query = match build_query(id, domain) {
            Some(q) => q,
            None => {
                log::warn!("Unencodable domain name: {}", domain);
                return (None, Duration::ZERO);
            }
        };

        for server in &self.servers {
            let server_ip: IpAddr = match server.host.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    log::warn!("DNS server host is not an IP address: {}", server.host);
                    continue;
                }
            };

            let start = Instant::now();
            let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
                Ok(s) => s,
                Err(e) => {
                    log::error!("Failed to open DNS socket: {}", e);
                    continue;
                }
            };

            if socket.send_to(&query, (server_ip, server.port)).await.is_err() {
                continue;
            }

            let mut buf = [0u8; RESPONSE_BUF_LEN];
            let received =
                match tokio::time::timeout(self.timeout, socket.recv(&mut buf)).await {
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        log::debug!("DNS recv error for {} via {}: {}", domain, server.host, e);
                        continue;
                    }
                    Err(_) => {
                        log::debug!("DNS timeout for {} via {}", domain, server.host);
                        continue;
                    }
                };

            if let Some(ip) = parse_response(&buf[..received]) {
                let elapsed = start.elapsed();
                let resolved = IpAddr::V4(ip);
                self.cache
                    .write()
                    .insert(domain.to_string(), (resolved, Instant::now() + CACHE_TTL));
                log::debug!(
                    "Resolved {} -> {} via {} in {:?}",
                    domain,
                    resolved,
                    server.host,
                    elapsed
                );
                return (Some(resolved), elapsed);
            }
        }

        log::error!("All DNS servers failed for {}", domain);
        (None, Duration::ZERO)
    }
}

/// Builds a standard query: header with `RD=1`, one question, QTYPE=A,
/// QCLASS=IN. Returns `None` for names with an over-long label.
fn build_query(id: u16, domain: &str) -> Option<Vec<u8>> {
    let mut packet = Vec::with_capacity(12 + domain.len() + 6);

    packet.extend_from_slice(&id.to_be_bytes());
    packet.push(0x01); // QR=0, Opcode=0, AA=0, TC=0, RD=1
    packet.push(0x00); // RA=0, Z=0, RCODE=0
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    for label in domain.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return None;
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE=A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS=IN

    Some(packet)
}

/// Walks an encoded name starting at `pos`, following compression pointers,
/// and leaves `pos` just past the name in the original byte stream.
fn skip_name(message: &[u8], pos: &mut usize) -> bool {
    let mut cursor = *pos;
    let mut after_jump: Option<usize> = None;
    let mut jumps = 0;

    loop {
        if cursor >= message.len() || jumps >= MAX_COMPRESSION_JUMPS {
            return false;
        }
        let len = message[cursor];
        cursor += 1;

        if len == 0 {
            break;
        }

        if len & 0xC0 == 0xC0 {
            if cursor >= message.len() {
                return false;
            }
            let offset = (((len & 0x3F) as usize) << 8) | message[cursor] as usize;
            cursor += 1;
            if after_jump.is_none() {
                after_jump = Some(cursor);
            }
            cursor = offset;
            jumps += 1;
            continue;
        }

        let len = len as usize;
        if len > MAX_LABEL_LEN || cursor + len > message.len() {
            return false;
        }
        cursor += len;
    }

    *pos = after_jump.unwrap_or(cursor);
    true
}

/// Extracts the first IN A record from a response, or `None` on a non-zero
/// RCODE, an empty answer section, or a malformed message.
fn parse_response(message: &[u8]) -> Option<Ipv4Addr> {
    if message.len() < 12 {
        return None;
    }

    let rcode = message[3] & 0x0F;
    if rcode != 0 {
        return None;
    }

    let ancount = u16::from_be_bytes([message[6], message[7]]);
    if ancount == 0 {
        return None;
    }

    // Skip the question section.
    let mut pos = 12;
    if !skip_name(message, &mut pos) {
        return None;
    }
    pos += 4; // QTYPE + QCLASS

    for _ in 0..ancount {
        if pos >= message.len() {
            return None;
        }
        if !skip_name(message, &mut pos) {
            return None;
        }
        if pos + 10 > message.len() {
            return None;
        }

        let rtype = u16::from_be_bytes([message[pos], message[pos + 1]]);
        let rclass = u16::from_be_bytes([message[pos + 2], message[pos + 3]]);
        let rdlength = u16::from_be_bytes([message[pos + 8], message[pos + 9]]) as usize;
        pos += 10;

        if rtype == 1 && rclass == 1 && rdlength == 4 {
            if pos + 4 > message.len() {
                return None;
            }
            return Some(Ipv4Addr::new(
                message[pos],
                message[pos + 1],
                message[pos + 2],
                message[pos + 3],
            ));
        }

        pos += rdlength;
    }

    None
}
