use async_trait::async_trait;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Reachability of the companion backend. Only decides when to reconcile, never how.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_up(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct TcpLivenessProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpLivenessProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl LivenessProbe for TcpLivenessProbe {
    async fn is_up(&self) -> bool {
        let host = self.host.clone();
        let port = self.port;
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || tcp_connects(&host, port, timeout))
            .await
            .unwrap_or(false)
    }
}

fn tcp_connects(host: &str, port: u16, timeout: Duration) -> bool {
    let host = host.trim();
    if host.is_empty() {
        return false;
    }
    let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(_) => return false,
    };
    connect_any(&addrs, timeout)
}

fn connect_any(addrs: &[SocketAddr], timeout: Duration) -> bool {
    addrs.iter().any(|addr| match TcpStream::connect_timeout(addr, timeout) {
        Ok(stream) => {
            let _ = stream.shutdown(Shutdown::Both);
            true
        }
        Err(err) => {
            tracing::debug!(%addr, error = %err, "liveness connect failed");
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[tokio::test]
    async fn open_port_is_up_and_closed_port_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpLivenessProbe::new("127.0.0.1", port, Duration::from_millis(500));
        assert!(probe.is_up().await);

        drop(listener);
        let closed = TcpLivenessProbe::new("127.0.0.1", port, Duration::from_millis(500));
        assert!(!closed.is_up().await);
    }

    #[test]
    fn refused_address_falls_through_to_the_next() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let open = listener.local_addr().unwrap();
        let closed = TcpListener::bind("127.0.0.1:0").unwrap();
        let refused = closed.local_addr().unwrap();
        drop(closed);

        let timeout = Duration::from_millis(500);
        assert!(!connect_any(&[refused], timeout));
        assert!(connect_any(&[refused, open], timeout));
    }

    #[tokio::test]
    async fn blank_host_is_down() {
        let probe = TcpLivenessProbe::new("  ", 5000, Duration::from_millis(100));
        assert!(!probe.is_up().await);
    }
}
