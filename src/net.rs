//! Socket helpers shared by the probe engine and the dispatcher.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};

/// Opens a TCP connection to `dest`, optionally bound to a local source
/// address, failing with `TimedOut` when the handshake exceeds `timeout`.
pub async fn connect_from(
    source: Option<IpAddr>,
    dest: SocketAddr,
    timeout: Duration,
) -> std::io::Result<TcpStream> {
    let socket = match dest {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    if let Some(ip) = source {
        socket.bind(SocketAddr::new(ip, 0))?;
    }

    match tokio::time::timeout(timeout, socket.connect(dest)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {} timed out", dest),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_from_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = connect_from(
            Some("127.0.0.1".parse().unwrap()),
            addr,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(stream.local_addr().unwrap().ip().to_string(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect_from(None, addr, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
