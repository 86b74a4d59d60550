//! Listening endpoint: one configured port, one or more bound sockets.

use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use tokio::net::{TcpListener, TcpStream};

use crate::error::EngineError;

/// Port used when none is configured.
pub const DEFAULT_PORT: &str = "20514";

/// Wildcard hosts bound when no listen address is set: IPv4 and IPv6.
const WILDCARD_HOSTS: [&str; 2] = ["0.0.0.0", "::"];

#[derive(Debug)]
pub struct Listener {
    port: String,
    address: Option<String>,
    sockets: Vec<TcpListener>,
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener {
    pub fn new() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            address: None,
            sockets: Vec::new(),
        }
    }

    /// Set the port to bind. `None` restores the default.
    pub fn set_listen_port(&mut self, port: Option<&str>) {
        self.port = port.unwrap_or(DEFAULT_PORT).to_string();
    }

    /// Restrict binding to one host name or address. `None` binds the wildcards.
    pub fn set_listen_address(&mut self, address: Option<&str>) {
        self.address = address.map(str::to_string);
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Bind every address the port resolves to. Individual failures are
    /// tolerated; it is an error only when nothing could be bound.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let port: u16 = self
            .port
            .parse()
            .map_err(|_| EngineError::InvalidPort(self.port.clone()))?;

        let hosts: Vec<String> = match &self.address {
            Some(address) => vec![address.clone()],
            None => WILDCARD_HOSTS.iter().map(|h| h.to_string()).collect(),
        };

        let mut last_err = None;
        for host in &hosts {
            let addrs = match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    tracing::debug!(%host, error = %e, "address resolution failed");
                    last_err = Some(e);
                    continue;
                }
            };
            for addr in addrs {
                match TcpListener::bind(addr).await {
                    Ok(socket) => {
                        tracing::info!(addr = %socket.local_addr().unwrap_or(addr), "listening");
                        self.sockets.push(socket);
                    }
                    Err(e) => {
                        // The IPv6 wildcard commonly collides with a dual-stack IPv4 bind.
                        tracing::debug!(%addr, error = %e, "bind failed");
                        last_err = Some(e);
                    }
                }
            }
        }

        if self.sockets.is_empty() {
            return Err(EngineError::Bind {
                port: self.port.clone(),
                source: last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to bind")
                }),
            });
        }
        Ok(())
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Bound socket by 0-based index.
    pub fn socket_at(&self, index: usize) -> Option<&TcpListener> {
        self.sockets.get(index)
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    /// Poll every bound socket for a pending connection.
    pub(crate) fn poll_accept(
        &self,
        cx: &mut Context<'_>,
    ) -> Vec<io::Result<(TcpStream, SocketAddr)>> {
        let mut accepted = Vec::new();
        for socket in &self.sockets {
            if let Poll::Ready(result) = socket.poll_accept(cx) {
                accepted.push(result);
            }
        }
        accepted
    }
}
