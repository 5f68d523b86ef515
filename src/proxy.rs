use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dns::DNSResolver;
use crate::error::{ProxyError, Result};
use crate::http::{self, HttpRequest, HttpResponse, WireError};
use crate::net::connect_from;
use crate::routing::RoutingEngine;
use crate::runway::Runway;
use crate::runway_manager::RunwayManager;
use crate::tracker::TargetAccessibilityTracker;
use crate::validator::SuccessValidator;

/// SOCKS5 version byte; connections opening with it get a fixed
/// no-acceptable-methods reply.
const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_REJECT: [u8; 2] = [0x05, 0xFF];

const LISTEN_BACKLOG: u32 = 128;
const MAX_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Active,
    Completed,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// Live bookkeeping for one client connection, kept from accept to handler
/// exit and exposed through the snapshot interface.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub client_ip: String,
    pub client_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub runway_id: String,
    pub method: String,
    pub path: String,
    pub start_time: Instant,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub status: ConnectionStatus,
    pub status_code: Option<u16>,
}

impl ConnectionInfo {
    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// The dispatcher: accepts client connections, parses one HTTP/1.1 request
/// per connection, forwards it through a selected runway and relays the
/// response.
pub struct ProxyServer {
    config: Config,
    runway_manager: Arc<RunwayManager>,
    routing_engine: Arc<RoutingEngine>,
    tracker: Arc<TargetAccessibilityTracker>,
    dns_resolver: Arc<DNSResolver>,
    validator: Arc<SuccessValidator>,
    connections: Mutex<HashMap<String, ConnectionInfo>>,
    total_connections: AtomicU64,
    total_bytes_sent: AtomicU64,
    total_bytes_received: AtomicU64,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Notify,
    running: AtomicBool,
}

impl ProxyServer {
    pub fn new(
        config: Config,
        runway_manager: Arc<RunwayManager>,
        routing_engine: Arc<RoutingEngine>,
        tracker: Arc<TargetAccessibilityTracker>,
        dns_resolver: Arc<DNSResolver>,
        validator: Arc<SuccessValidator>,
    ) -> Self {
        Self {
            config,
            runway_manager,
            routing_engine,
            tracker,
            dns_resolver,
            validator,
            connections: Mutex::new(HashMap::new()),
            total_connections: AtomicU64::new(0),
            total_bytes_sent: AtomicU64::new(0),
            total_bytes_received: AtomicU64::new(0),
            local_addr: Mutex::new(None),
            shutdown: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Binds the listening socket and spawns the accept loop. A bind failure
    /// refuses to start the server.
    pub async fn start(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let addr = format!("{}:{}", self.config.listen_host(), self.config.listen_port());
        let socket_addr: SocketAddr = addr
            .parse()
            .map_err(|e| ProxyError::config_validation(format!("bad listen address {}: {}", addr, e)))?;

        let socket = match socket_addr {
            SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4(),
            SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6(),
        }
        .map_err(ProxyError::Io)?;
        socket.set_reuseaddr(true).map_err(ProxyError::Io)?;
        socket
            .bind(socket_addr)
            .map_err(|source| ProxyError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let listener = socket
            .listen(LISTEN_BACKLOG)
            .map_err(|source| ProxyError::Bind { addr, source })?;

        let local = listener.local_addr().map_err(ProxyError::Io)?;
        *self.local_addr.lock() = Some(local);
        self.running.store(true, Ordering::Relaxed);
        log::info!("Proxy server started on {}", local);

        Ok(tokio::spawn(async move {
            self.accept_loop(listener).await;
        }))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        if !self.running.load(Ordering::Relaxed) {
                            break;
                        }
                        log::error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }
        // Dropping the listener closes the socket; in-flight handlers run to
        // their own timeouts.
        log::info!("Accept loop exited");
    }

    /// Signals the accept loop to exit. In-flight connections finish on their
    /// own timeouts; await the handle returned by `start` to join.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.shutdown.notify_one();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn get_active_connections(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn get_active_connections_info(&self) -> Vec<ConnectionInfo> {
        self.connections.lock().values().cloned().collect()
    }

    pub fn get_total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn get_total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent.load(Ordering::Relaxed)
    }

    pub fn get_total_bytes_received(&self) -> u64 {
        self.total_bytes_received.load(Ordering::Relaxed)
    }

    fn with_connection<F: FnOnce(&mut ConnectionInfo)>(&self, conn_id: &str, f: F) {
        if let Some(info) = self.connections.lock().get_mut(conn_id) {
            f(info);
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        let epoch_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let conn_id = format!("{}:{}-{}", peer.ip(), peer.port(), epoch_secs);

        self.connections.lock().insert(
            conn_id.clone(),
            ConnectionInfo {
                id: conn_id.clone(),
                client_ip: peer.ip().to_string(),
                client_port: peer.port(),
                target_host: String::new(),
                target_port: 0,
                runway_id: String::new(),
                method: String::new(),
                path: String::new(),
                start_time: Instant::now(),
                bytes_sent: 0,
                bytes_received: 0,
                status: ConnectionStatus::Connecting,
                status_code: None,
            },
        );

        self.serve_client(stream, peer, &conn_id).await;

        self.connections.lock().remove(&conn_id);
    }

    async fn serve_client(&self, stream: TcpStream, peer: SocketAddr, conn_id: &str) {
        let io_timeout = self.config.network_timeout();

        // Protocol detection: SOCKS5 opens with 0x05, HTTP with an ASCII
        // method token.
        let mut first_byte = [0u8; 1];
        let peeked = tokio::time::timeout(io_timeout, stream.peek(&mut first_byte)).await;
        match peeked {
            Ok(Ok(n)) if n > 0 => {}
            _ => {
                log::debug!("{} closed before protocol detection", peer);
                return;
            }
        }

        let mut reader = BufReader::new(stream);

        if first_byte[0] == SOCKS5_VERSION {
            log::info!("{} speaks SOCKS5, rejecting (HTTP proxy only)", peer);
            self.with_connection(conn_id, |c| c.status = ConnectionStatus::Error);
            let _ = tokio::time::timeout(io_timeout, reader.get_mut().write_all(&SOCKS5_REJECT))
                .await;
            return;
        }

        let request = match tokio::time::timeout(io_timeout, http::read_request(&mut reader)).await
        {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                log::debug!("{} sent an unparsable request: {}", peer, e);
                self.respond(&mut reader, conn_id, 400, "Bad Request").await;
                return;
            }
            Err(_) => {
                log::debug!("{} timed out mid-request", peer);
                self.respond(&mut reader, conn_id, 400, "Bad Request").await;
                return;
            }
        };

        self.with_connection(conn_id, |c| {
            c.method = request.method.clone();
            c.path = request.target.clone();
        });

        // CONNECT is recognized but deliberately not tunneled.
        if request.method == "CONNECT" {
            log::info!("{} CONNECT {} refused", peer, request.target);
            self.respond(&mut reader, conn_id, 501, "Not Implemented").await;
            return;
        }

        let Some((target_host, target_port)) = extract_target(&request) else {
            log::debug!("{} request without a determinable target", peer);
            self.respond(&mut reader, conn_id, 400, "Bad Request").await;
            return;
        };

        log::info!(
            "{} {} {} -> {}:{}",
            peer,
            request.method,
            request.target,
            target_host,
            target_port
        );
        self.with_connection(conn_id, |c| {
            c.target_host = target_host.clone();
            c.target_port = target_port;
            c.status = ConnectionStatus::Active;
        });

        let all_runways = self.runway_manager.get_all_runways();
        let mut runway = self.routing_engine.select_runway(&target_host, &all_runways);

        if runway.is_none() {
            log::debug!(
                "No known accessible runway for {}, testing all runways",
                target_host
            );
            runway = self.test_all_runways(&target_host, &all_runways).await;
        }

        let Some(mut runway) = runway else {
            log::warn!("No accessible runway found for {}", target_host);
            self.respond(&mut reader, conn_id, 502, "Bad Gateway").await;
            return;
        };

        self.with_connection(conn_id, |c| c.runway_id = runway.id.clone());

        for attempt in 0..MAX_ATTEMPTS {
            let started = Instant::now();
            match self
                .make_upstream_request(&request, &target_host, target_port, &runway)
                .await
            {
                Ok((response, rtt)) => {
                    let network_success = (200..400).contains(&response.status);
                    let user_success = if network_success {
                        self.validator.validate_http(response.status, &response.body).1
                    } else {
                        false
                    };
                    self.tracker.update(
                        &target_host,
                        &runway.id,
                        network_success,
                        user_success,
                        rtt,
                    );

                    // Upstream HTTP errors are relayed verbatim; only
                    // transport failures trigger the alternative-runway retry.
                    self.relay_response(&mut reader, conn_id, &request, &response)
                        .await;
                    return;
                }
                Err(e) => {
                    self.tracker
                        .update(&target_host, &runway.id, false, false, started.elapsed());
                    log::debug!(
                        "Upstream attempt {} via {} failed: {}",
                        attempt + 1,
                        runway.id,
                        e
                    );

                    if attempt + 1 < MAX_ATTEMPTS {
                        if let Some(alt) = self.get_alternative_runway(&target_host, &runway.id) {
                            log::debug!("Retrying {} via alternative runway {}", target_host, alt.id);
                            self.with_connection(conn_id, |c| c.runway_id = alt.id.clone());
                            runway = alt;
                            continue;
                        }
                    }
                    break;
                }
            }
        }

        log::warn!("All runway attempts failed for {}", target_host);
        self.respond(&mut reader, conn_id, 502, "Bad Gateway").await;
    }

    /// Writes a bodyless synthetic response and marks the connection.
    async fn respond(
        &self,
        client: &mut BufReader<TcpStream>,
        conn_id: &str,
        status: u16,
        reason: &str,
    ) {
        self.with_connection(conn_id, |c| {
            c.status_code = Some(status);
            c.status = if status < 400 {
                ConnectionStatus::Completed
            } else {
                ConnectionStatus::Error
            };
        });
        let bytes = HttpResponse::empty(status, reason).to_bytes();
        let _ = tokio::time::timeout(
            self.config.network_timeout(),
            client.get_mut().write_all(&bytes),
        )
        .await;
    }

    async fn relay_response(
        &self,
        client: &mut BufReader<TcpStream>,
        conn_id: &str,
        request: &HttpRequest,
        response: &HttpResponse,
    ) {
        let bytes = response.to_bytes();
        let write_result = tokio::time::timeout(
            self.config.network_timeout(),
            client.get_mut().write_all(&bytes),
        )
        .await;

        let sent = bytes.len() as u64;
        let received = request.body.len() as u64;
        self.total_bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.total_bytes_received.fetch_add(received, Ordering::Relaxed);
        self.with_connection(conn_id, |c| {
            c.bytes_sent = sent;
            c.bytes_received = received;
            c.status_code = Some(response.status);
            c.status = ConnectionStatus::Completed;
        });

        match write_result {
            Ok(Ok(())) => log::info!(
                "{}: relayed {} ({} bytes)",
                conn_id,
                response.status,
                sent
            ),
            _ => log::debug!("{}: client went away during relay", conn_id),
        }
    }

    /// One upstream exchange over `runway`. Returns the parsed response and
    /// the connect-to-body-read time, or a transport failure. DNS resolution
    /// failure counts as a transport failure.
    async fn make_upstream_request(
        &self,
        request: &HttpRequest,
        target_host: &str,
        target_port: u16,
        runway: &Runway,
    ) -> std::result::Result<(HttpResponse, Duration), WireError> {
        let resolved_ip = if self.dns_resolver.is_ip_address(target_host)
            || self.dns_resolver.is_private_ip(target_host)
        {
            target_host.parse().ok()
        } else {
            self.dns_resolver.resolve(target_host).await.0
        };
        let Some(target_ip) = resolved_ip else {
            return Err(transport_error("target resolution failed"));
        };

        let io_timeout = self.config.network_timeout();

        let (dest, origin_form) = match &runway.upstream_proxy {
            Some(proxy) => {
                if !proxy.accessible {
                    return Err(transport_error("upstream proxy marked inaccessible"));
                }
                let proxy_ip = if self.dns_resolver.is_ip_address(&proxy.config.host) {
                    proxy.config.host.parse().ok()
                } else {
                    self.dns_resolver.resolve(&proxy.config.host).await.0
                };
                let Some(proxy_ip) = proxy_ip else {
                    return Err(transport_error("proxy resolution failed"));
                };
                (SocketAddr::new(proxy_ip, proxy.config.port), false)
            }
            None => (SocketAddr::new(target_ip, target_port), true),
        };

        let started = Instant::now();
        let mut stream = connect_from(runway.source_ip, dest, io_timeout).await?;

        let out = build_upstream_bytes(request, target_host, target_port, origin_form);
        match tokio::time::timeout(io_timeout, stream.write_all(&out)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(transport_error("upstream send timed out")),
        }

        let mut upstream = BufReader::new(stream);
        let response = match tokio::time::timeout(io_timeout, http::read_response(&mut upstream))
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(transport_error("upstream response timed out")),
        };

        Ok((response, started.elapsed()))
    }

    /// Probes every runway for `target`, direct runways first, feeding each
    /// outcome into the tracker. Returns the first runway whose probe
    /// succeeded at the user level.
    async fn test_all_runways(&self, target: &str, all_runways: &[Runway]) -> Option<Runway> {
        let (direct, proxied): (Vec<&Runway>, Vec<&Runway>) =
            all_runways.iter().partition(|r| r.is_direct);
        let timeout = self.config.accessibility_timeout();

        for runway in direct.into_iter().chain(proxied) {
            let (net_success, user_success, rtt) = self
                .runway_manager
                .test_runway_accessibility(target, runway, timeout)
                .await;
            self.tracker
                .update(target, &runway.id, net_success, user_success, rtt);
            if user_success {
                return Some(runway.clone());
            }
        }

        None
    }

    /// Any currently accessible runway other than the one just used.
    fn get_alternative_runway(&self, target: &str, current_id: &str) -> Option<Runway> {
        self.tracker
            .get_accessible_runways(target)
            .into_iter()
            .find(|id| id != current_id)
            .and_then(|id| self.runway_manager.get_runway(&id))
    }
}

fn transport_error(message: &str) -> WireError {
    WireError::Io(std::io::Error::new(std::io::ErrorKind::Other, message.to_string()))
}

/// Target host and port for a non-CONNECT request: the `host` header split on
/// its last colon, falling back to the authority of an absolute-URI request
/// target. Default port 80.
fn extract_target(request: &HttpRequest) -> Option<(String, u16)> {
    if let Some(host_header) = request.header("host") {
        return split_host_port(host_header, 80);
    }

    let rest = request.target.strip_prefix("http://")?;
    let authority = &rest[..rest.find('/').unwrap_or(rest.len())];
    split_host_port(authority, 80)
}

fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) => (host, port_str.parse::<u16>().unwrap_or(default_port)),
        None => (authority, default_port),
    };
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Request target for the upstream request line. Direct runways speak
/// origin-form: an absolute-URI target is reduced to its path; proxy runways
/// keep the target as the client sent it.
fn origin_form_target(target: &str) -> String {
    if let Some(rest) = target.strip_prefix("http://") {
        match rest.find('/') {
            Some(slash) => rest[slash..].to_string(),
            None => "/".to_string(),
        }
    } else {
        target.to_string()
    }
}

/// Serializes the upstream request: rewritten request line, headers without
/// hop-by-hop names, `Host` rewritten (port omitted for 80/443), recomputed
/// body framing, body.
fn build_upstream_bytes(
    request: &HttpRequest,
    target_host: &str,
    target_port: u16,
    origin_form: bool,
) -> Vec<u8> {
    let request_target = if origin_form {
        origin_form_target(&request.target)
    } else {
        request.target.clone()
    };

    let mut out = Vec::with_capacity(256 + request.body.len());
    out.extend_from_slice(
        format!("{} {} {}\r\n", request.method, request_target, request.version).as_bytes(),
    );

    let had_body_framing = request.headers.contains_key("content-length")
        || request.headers.contains_key("transfer-encoding");
    for (name, value) in &request.headers {
        if matches!(
            name.as_str(),
            "host" | "connection" | "proxy-connection" | "content-length" | "transfer-encoding"
        ) {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }

    let host_value = if target_port == 80 || target_port == 443 {
        target_host.to_string()
    } else {
        format!("{}:{}", target_host, target_port)
    };
    out.extend_from_slice(format!("Host: {}\r\n", host_value).as_bytes());

    // Bodies arrive de-chunked, so the framing is restated as a plain length.
    if had_body_framing || !request.body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", request.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}
