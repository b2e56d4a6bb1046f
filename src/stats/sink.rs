use std::{net::{Ipv4Addr, Ipv6Addr, SocketAddr}, sync::atomic::{AtomicBool, Ordering}};

use thiserror::Error;
use tokio::net::{UdpSocket, lookup_host};
use tracing::{info, warn};

/// Where counters and gauges go. Implementations must not block and must
/// swallow their own delivery failures.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, amount: i64);
    fn send_gauge(&self, name: &str, value: i64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment_counter(&self, _name: &str, _amount: i64) {}
    fn send_gauge(&self, _name: &str, _value: i64) {}
}

#[derive(Debug, Error)]
enum SinkError {
    #[error("StatsD backend unavailable: {0}")]
    Unavailable(#[from] std::io::Error),
    #[error("StatsD address `{0}` did not resolve")]
    NoAddress(String),
}

/// Best-effort StatsD sender over UDP.
///
/// If the socket cannot be set up the sink stays usable and drops every
/// metric. Send failures are logged once each time the backend goes from
/// healthy to failing.
#[derive(Debug)]
pub struct StatsdSink {
    socket: Option<UdpSocket>,
    prefix: Option<String>,
    failing: AtomicBool,
}

impl StatsdSink {
    pub async fn connect(address: &str, prefix: Option<String>) -> Self {
        let socket = match open_socket(address).await {
            Ok(socket) => {
                info!("Sending metrics to StatsD at {address}");
                Some(socket)
            }
            Err(err) => {
                warn!("Error while setting up StatsD, metrics will be dropped: {err}");
                None
            }
        };

        Self {
            socket,
            prefix: prefix.filter(|p| !p.is_empty()),
            failing: AtomicBool::new(false),
        }
    }

    fn send(&self, name: &str, value: i64, kind: &str) {
        let Some(ref socket) = self.socket else {
            return;
        };

        let line = match self.prefix {
            Some(ref prefix) => format!("{prefix}.{name}:{value}|{kind}"),
            None => format!("{name}:{value}|{kind}"),
        };

        match socket.try_send(line.as_bytes()) {
            Ok(_) => {
                if self.failing.swap(false, Ordering::Relaxed) {
                    info!("StatsD backend reachable again");
                }
            }
            Err(err) => {
                if !self.failing.swap(true, Ordering::Relaxed) {
                    warn!("Failed to send metrics to StatsD, dropping until it recovers: {err}");
                }
            }
        }
    }
}

async fn open_socket(address: &str) -> Result<UdpSocket, SinkError> {
    let target = lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| SinkError::NoAddress(address.to_owned()))?;

    let local: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(target).await?;
    // `try_send` reports WouldBlock until the reactor has seen the socket
    // as writable once.
    socket.writable().await?;
    Ok(socket)
}

impl MetricsSink for StatsdSink {
    fn increment_counter(&self, name: &str, amount: i64) {
        self.send(name, amount, "c");
    }

    fn send_gauge(&self, name: &str, value: i64) {
        // A leading sign turns a StatsD gauge into a relative update.
        self.send(name, value.max(0), "g");
    }
}
