//! A session bound to its TCP stream.
//!
//! The protocol state and the unsent bytes share one synchronous mutex, held
//! only for frame processing and non-blocking socket calls. Nothing here waits
//! for the socket: bytes the kernel does not take stay in a per-connection
//! backlog, flushed when the event loop sees the socket writable. Because
//! queueing and writing happen under the same lock, frames reach the wire in
//! the order they were queued, whichever task queued them.

use std::io;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

use relp_core::{Frame, ProtocolError, Session, SessionConfig, SessionEvent, SessionId, SessionState};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::error::EngineError;

/// Upper bound on bytes pulled from one socket per readiness event, so a
/// chatty peer cannot starve the others.
const MAX_READ_PER_WAKE: usize = 256 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Unsent bytes allowed to pile up for a peer that does not read.
pub const MAX_BACKLOG: usize = 1024 * 1024;

/// Result of servicing one readiness event.
#[derive(Debug, Default)]
pub struct Received {
    pub events: Vec<SessionEvent>,
    /// The close exchange is done and every byte was written; release the session.
    pub finished: bool,
}

#[derive(Debug)]
struct Inner {
    session: Session,
    backlog: Vec<u8>,
}

impl Inner {
    fn is_done(&self) -> bool {
        self.session.is_finished() && self.backlog.is_empty()
    }
}

#[derive(Debug)]
pub struct Connection {
    id: SessionId,
    peer: SocketAddr,
    stream: TcpStream,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionState>,
}

impl Connection {
    /// Wrap an accepted stream in a fresh server session.
    pub fn accept(
        stream: TcpStream,
        peer: SocketAddr,
        config: &SessionConfig,
    ) -> Result<Self, EngineError> {
        let session = Session::server(config)?;
        Ok(Self::new(stream, peer, session))
    }

    /// Open a client connection and send `init`. Negotiation completes as
    /// responses are received.
    pub async fn connect(addr: SocketAddr, config: &SessionConfig) -> Result<Self, EngineError> {
        let mut session = Session::client(config)?;
        let stream = TcpStream::connect(addr).await?;
        session.start()?;
        let conn = Self::new(stream, addr, session);
        conn.flush()?;
        Ok(conn)
    }

    fn new(stream: TcpStream, peer: SocketAddr, session: Session) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "set_nodelay failed");
        }
        let (state_tx, _) = watch::channel(session.state());
        Self {
            id: session.id(),
            peer,
            stream,
            inner: Mutex::new(Inner {
                session,
                backlog: Vec::new(),
            }),
            state_tx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn socket(&self) -> &TcpStream {
        &self.stream
    }

    pub fn state(&self) -> SessionState {
        self.with_inner(|inner| inner.session.state())
    }

    /// Bytes queued for the peer that the socket has not taken yet.
    pub fn has_backlog(&self) -> bool {
        self.with_inner(|inner| !inner.backlog.is_empty())
    }

    /// Watch state transitions; the value is refreshed after every batch of frames.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut inner);
        self.state_tx.send_replace(inner.session.state());
        out
    }

    /// Read what the socket has, hand every complete frame to `dispatch` and
    /// write as much of the answer as the socket takes. Any error means the
    /// session must be torn down.
    pub fn receive(
        &self,
        dispatch: impl FnMut(&mut Session, &Frame) -> Result<(), ProtocolError>,
    ) -> Result<Received, EngineError> {
        let (bytes, eof) = self.read_available()?;

        let (result, written, received) = self.with_inner(|inner| {
            let result = inner.session.receive_with(&bytes, dispatch);
            // A failed negotiation still owes the peer its 500 response.
            let written = self.write_backlog(inner);
            let received = Received {
                events: inner.session.drain_events(),
                finished: inner.is_done(),
            };
            (result, written, received)
        });
        result?;
        written?;

        if eof && !received.finished {
            return Err(EngineError::ConnectionClosed);
        }
        Ok(received)
    }

    fn read_available(&self) -> io::Result<(Vec<u8>, bool)> {
        let mut bytes = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => return Ok((bytes, true)),
                Ok(n) => {
                    bytes.extend_from_slice(&chunk[..n]);
                    if bytes.len() >= MAX_READ_PER_WAKE {
                        return Ok((bytes, false));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((bytes, false)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a sending operation on the session and start writing its frame.
    pub(crate) fn send_with(
        &self,
        op: impl FnOnce(&mut Session) -> Result<u32, ProtocolError>,
    ) -> Result<u32, EngineError> {
        self.with_inner(|inner| {
            let txnr = op(&mut inner.session)?;
            self.write_backlog(inner)?;
            Ok(txnr)
        })
    }

    /// Write what is pending. `Ok(true)` once a finished session has
    /// nothing left to send.
    pub(crate) fn flush(&self) -> Result<bool, EngineError> {
        self.with_inner(|inner| {
            self.write_backlog(inner)?;
            Ok(inner.is_done())
        })
    }

    /// Move the session's outbound bytes to the backlog and write until the
    /// socket would block.
    fn write_backlog(&self, inner: &mut Inner) -> Result<(), EngineError> {
        let outbound = inner.session.take_outbound();
        if inner.backlog.is_empty() {
            inner.backlog = outbound;
        } else {
            inner
                .backlog
                .try_reserve(outbound.len())
                .map_err(ProtocolError::from)?;
            inner.backlog.extend_from_slice(&outbound);
        }

        let mut written = 0;
        while written < inner.backlog.len() {
            match self.stream.try_write(&inner.backlog[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        inner.backlog.drain(..written);

        if inner.backlog.len() > MAX_BACKLOG {
            return Err(EngineError::BacklogExceeded {
                len: inner.backlog.len(),
                limit: MAX_BACKLOG,
            });
        }
        Ok(())
    }

    /// Terminal transition; the socket closes when the last reference drops.
    pub(crate) fn shutdown(&self) {
        self.with_inner(|inner| inner.session.mark_closed());
    }
}
