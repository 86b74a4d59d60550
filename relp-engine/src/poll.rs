//! Readiness wait over every listener socket and session socket at once.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::net::TcpStream;

use crate::connection::Connection;
use crate::listener::Listener;

#[derive(Debug)]
pub enum Ready {
    /// A listener socket produced a connection (or an accept error).
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    /// The session at this index in the set has data (or an error) to read.
    Readable(usize),
    /// The session at this index has a backlog and its socket takes writes again.
    Writable(usize),
}

/// One iteration's set of sockets to wait on.
#[derive(Default)]
pub struct PollSet {
    listeners: Vec<Arc<Listener>>,
    sessions: Vec<Arc<Connection>>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Arc<Listener>) {
        self.listeners.push(listener);
    }

    pub fn add_session(&mut self, conn: Arc<Connection>) {
        self.sessions.push(conn);
    }

    pub fn session(&self, index: usize) -> Option<&Arc<Connection>> {
        self.sessions.get(index)
    }

    /// Total sockets in the set.
    pub fn socket_count(&self) -> usize {
        self.listeners.iter().map(|l| l.socket_count()).sum::<usize>() + self.sessions.len()
    }

    /// Wait until at least one socket is ready and report all that are.
    /// Write readiness is only watched for sessions with unsent bytes.
    pub async fn wait(&self) -> Vec<Ready> {
        poll_fn(|cx| self.poll_ready(cx)).await
    }

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Vec<Ready>> {
        let mut ready = Vec::new();
        for listener in &self.listeners {
            ready.extend(listener.poll_accept(cx).into_iter().map(Ready::Accepted));
        }
        for (index, conn) in self.sessions.iter().enumerate() {
            // An error counts as ready; the read or write surfaces it.
            if conn.socket().poll_read_ready(cx).is_ready() {
                ready.push(Ready::Readable(index));
            }
            if conn.has_backlog() && conn.socket().poll_write_ready(cx).is_ready() {
                ready.push(Ready::Writable(index));
            }
        }
        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    }
}
