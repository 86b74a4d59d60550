//! The engine: owns listeners and sessions and runs the readiness loop.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use relp_core::{
    Dispatcher, Frame, MessageConsumer, ProtocolError, Session, SessionConfig, SessionEvent,
    SessionId, SessionState,
};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, Received};
use crate::debug::{debug_print, DebugSink, DebugSlot};
use crate::error::EngineError;
use crate::listener::Listener;
use crate::poll::{PollSet, Ready};
use crate::registry::Registry;

pub struct Engine {
    config: SessionConfig,
    dispatcher: Dispatcher,
    listeners: Registry<Listener>,
    sessions: Registry<Connection>,
    debug: DebugSlot,
    stop_tx: watch::Sender<bool>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("listeners", &self.listeners.len())
            .field("sessions", &self.sessions.len())
            .field("stopped", &*self.stop_tx.borrow())
            .finish()
    }
}

impl Engine {
    /// Engine with the default command table, handing `msg` payloads to `consumer`.
    pub fn new(
        config: SessionConfig,
        consumer: Arc<dyn MessageConsumer>,
    ) -> Result<Self, EngineError> {
        Self::with_dispatcher(config, Dispatcher::new(consumer))
    }

    /// Engine with a caller-built command table.
    pub fn with_dispatcher(
        config: SessionConfig,
        dispatcher: Dispatcher,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            dispatcher,
            listeners: Registry::new(),
            sessions: Registry::new(),
            debug: DebugSlot::default(),
            stop_tx,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Install or clear the debug sink. May be called while `run` is active.
    pub fn set_debug_sink(&self, sink: Option<Arc<dyn DebugSink>>) {
        self.debug.set(sink);
    }

    /// Bind a listener on `port` (default port when `None`) on all wildcard addresses.
    pub async fn add_listener(&self, port: Option<&str>) -> Result<(), EngineError> {
        self.add_listener_on(None, port).await
    }

    /// Bind a listener on `port`, restricted to `address` when given.
    pub async fn add_listener_on(
        &self,
        address: Option<&str>,
        port: Option<&str>,
    ) -> Result<(), EngineError> {
        let mut listener = Listener::new();
        listener.set_listen_address(address);
        listener.set_listen_port(port);
        listener.run().await?;
        debug_print!(
            self.debug,
            "listener for port {} bound {} socket(s)",
            listener.port(),
            listener.socket_count()
        );
        self.listeners.add(Arc::new(listener));
        Ok(())
    }

    /// Addresses of every bound listener socket.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .snapshot()
            .iter()
            .flat_map(|l| l.local_addrs())
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.snapshot().iter().map(|c| c.id()).collect()
    }

    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.find(|c| c.id() == id).map(|c| c.state())
    }

    fn session(&self, id: SessionId) -> Result<Arc<Connection>, EngineError> {
        self.sessions
            .find(|c| c.id() == id)
            .ok_or(EngineError::UnknownSession(id))
    }

    /// Open a client session to `addr`. Negotiation finishes inside `run`;
    /// use [`Engine::wait_for_state`] to wait for `Ready`.
    pub async fn connect(&self, addr: SocketAddr) -> Result<SessionId, EngineError> {
        let conn = Connection::connect(addr, &self.config).await?;
        let id = conn.id();
        debug!(session = %id, %addr, "connected");
        debug_print!(self.debug, "session {} opened to {}", id, addr);
        self.sessions.add(Arc::new(conn));
        Ok(id)
    }

    /// Client: send one message on an open session; returns its txnr.
    /// Never waits for the socket; what it does not take is flushed by `run`.
    pub fn send_message(&self, id: SessionId, message: &[u8]) -> Result<u32, EngineError> {
        self.send(id, |s| s.send_message(message))
    }

    /// Client: begin an orderly close. The session is released when the peer answers.
    pub fn close_session(&self, id: SessionId) -> Result<u32, EngineError> {
        self.send(id, |s| s.close())
    }

    fn send(
        &self,
        id: SessionId,
        op: impl FnOnce(&mut Session) -> Result<u32, ProtocolError>,
    ) -> Result<u32, EngineError> {
        let conn = self.session(id)?;
        match conn.send_with(op) {
            Ok(txnr) => {
                if conn.has_backlog() {
                    // The loop has to start watching this socket for writability.
                    self.sessions.notify();
                }
                Ok(txnr)
            }
            // Window full or wrong state: nothing was sent, the session is intact.
            Err(EngineError::Protocol(e)) => Err(EngineError::Protocol(e)),
            Err(e) => {
                self.tear_down(&conn, &e);
                Err(e)
            }
        }
    }

    /// Wait until the session reaches `target`. Returns the state it stopped in,
    /// which is `Closed` if it was torn down first.
    pub async fn wait_for_state(
        &self,
        id: SessionId,
        target: SessionState,
    ) -> Result<SessionState, EngineError> {
        let mut rx = self.session(id)?.subscribe();
        let state = rx
            .wait_for(|s| *s == target || *s == SessionState::Closed)
            .await
            .map(|s| *s)
            .unwrap_or(SessionState::Closed);
        Ok(state)
    }

    /// Dispatch one frame on `session` through this engine's command table.
    pub fn dispatch_frame(&self, session: &mut Session, frame: &Frame) -> Result<(), ProtocolError> {
        debug_print!(
            self.debug,
            "session {}: dispatching {} txnr {} ({} bytes)",
            session.id(),
            frame.command(),
            frame.txnr(),
            frame.data_len()
        );
        self.dispatcher.dispatch(session, frame)
    }

    /// Ask `run` to return. Takes effect at its next wait, which this wakes.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Service listeners and sessions until [`Engine::stop`] is called.
    ///
    /// Each iteration builds the socket set from the current registries, waits
    /// for readiness, accepts new connections and then services every ready
    /// session. Registering a listener or session, or queueing bytes on a
    /// session from another task, wakes the wait so the set is rebuilt.
    /// Errors on one session tear down only that session.
    pub async fn run(&self) -> Result<(), EngineError> {
        let mut stop = self.stop_tx.subscribe();
        info!(commands = ?self.dispatcher.commands().collect::<Vec<_>>(), "engine running");
        loop {
            if *stop.borrow_and_update() {
                break;
            }

            let mut poll = PollSet::new();
            for listener in self.listeners.snapshot() {
                poll.add_listener(listener);
            }
            for conn in self.sessions.snapshot() {
                poll.add_session(conn);
            }
            debug_print!(self.debug, "waiting on {} socket(s)", poll.socket_count());

            let ready = tokio::select! {
                ready = poll.wait() => Some(ready),
                _ = self.listeners.changed() => None,
                _ = self.sessions.changed() => None,
                _ = stop.changed() => None,
            };
            let Some(ready) = ready else {
                continue;
            };
            debug_print!(self.debug, "{} socket(s) ready", ready.len());

            let mut session_events = Vec::new();
            for event in ready {
                match event {
                    Ready::Accepted(Ok((stream, peer))) => self.accept(stream, peer),
                    Ready::Accepted(Err(e)) => {
                        let err = EngineError::Accept(e);
                        warn!(error = %err, "accept failed");
                        debug_print!(self.debug, "{}", err);
                    }
                    other => session_events.push(other),
                }
            }

            for event in session_events {
                let (index, readable) = match event {
                    Ready::Readable(index) => (index, true),
                    Ready::Writable(index) => (index, false),
                    Ready::Accepted(_) => continue,
                };
                let Some(conn) = poll.session(index) else {
                    continue;
                };
                if conn.state() == SessionState::Closed {
                    continue;
                }
                let serviced = if readable {
                    conn.receive(|s, f| self.dispatch_frame(s, f))
                } else {
                    conn.flush().map(|finished| Received {
                        events: Vec::new(),
                        finished,
                    })
                };
                match serviced {
                    Ok(received) => self.handle_received(conn, received),
                    Err(e) => self.tear_down(conn, &e),
                }
            }
        }
        info!("engine stopped");
        Ok(())
    }

    fn accept(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        match Connection::accept(stream, peer, &self.config) {
            Ok(conn) => {
                debug!(session = %conn.id(), %peer, "accepted connection");
                debug_print!(self.debug, "session {} accepted from {}", conn.id(), peer);
                self.sessions.add(Arc::new(conn));
            }
            Err(e) => {
                warn!(%peer, error = %e, "could not create session");
            }
        }
    }

    fn handle_received(&self, conn: &Connection, received: Received) {
        for event in &received.events {
            match event {
                SessionEvent::Ready => {
                    debug!(session = %conn.id(), "session ready");
                }
                SessionEvent::Message { txnr, data } => {
                    trace!(session = %conn.id(), txnr, len = data.len(), "message received");
                }
                SessionEvent::Acknowledged { txnr, command, response } => {
                    if response.is_success() {
                        trace!(session = %conn.id(), txnr, %command, "acknowledged");
                    } else {
                        warn!(
                            session = %conn.id(),
                            txnr,
                            %command,
                            code = response.code.as_u16(),
                            message = response.message.as_deref().unwrap_or(""),
                            "peer rejected command"
                        );
                    }
                }
            }
        }
        if received.finished {
            debug!(session = %conn.id(), "session closed");
            debug_print!(self.debug, "session {} closed", conn.id());
            self.remove_session(conn.id());
        }
    }

    fn tear_down(&self, conn: &Connection, err: &EngineError) {
        info!(session = %conn.id(), peer = %conn.peer(), error = %err, "tearing down session");
        debug_print!(self.debug, "session {} torn down: {}", conn.id(), err);
        self.remove_session(conn.id());
    }

    /// Drop a session from the registry and mark it closed in one step.
    fn remove_session(&self, id: SessionId) {
        self.sessions.remove(|c| c.id() == id, |c| c.shutdown());
    }
}
