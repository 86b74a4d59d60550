//! Per-connection protocol state: role, state machine, offers, transaction
//! numbering and the receive/send buffers. No I/O happens here; the host feeds
//! received bytes to [`Session::receive`] and writes out whatever
//! [`Session::take_outbound`] returns.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dispatch::Dispatcher;
use crate::error::ProtocolError;
use crate::frame::{self, Frame, FrameDecodeError};
use crate::offers::Offers;
use crate::protocol::{Response, CMD_CLOSE, CMD_INIT, CMD_MSG, CMD_RSP, PROTOCOL_VERSION};
use crate::txn::{Pending, TxnCounter, TxnWindow, DEFAULT_TXNR_WRAP, DEFAULT_WINDOW_SIZE};

/// Unique session identifier, assigned at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which side of the connection this session plays. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Accepted a connection; answers commands.
    Server,
    /// Opened the connection; issues commands.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    AwaitingInit,
    /// Server: accepted offers sent in the `init` response. Client: `init` sent.
    OffersSent,
    /// Client: `go` sent, waiting for its response.
    AwaitingGo,
    Ready,
    Closing,
    Closed,
}

/// Settings shared by every session an engine creates.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub window_size: usize,
    pub txnr_wrap: u32,
    pub max_data_len: usize,
    /// Features this side supports. Must contain `relp_version`.
    pub offers: Offers,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            txnr_wrap: DEFAULT_TXNR_WRAP,
            max_data_len: frame::DEFAULT_MAX_DATA_LEN,
            offers: Offers::with_version(PROTOCOL_VERSION),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        TxnWindow::new(self.window_size, self.txnr_wrap)?;
        if self.offers.relp_version().is_none() {
            return Err(ProtocolError::Negotiation(
                "local offers lack relp_version".to_string(),
            ));
        }
        Ok(())
    }
}

/// Something the host may want to act on, drained with [`Session::drain_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Negotiation finished; the session may carry messages.
    Ready,
    /// Server side: a `msg` payload was handed to the consumer.
    Message { txnr: u32, data: Vec<u8> },
    /// Client side: a command was answered.
    Acknowledged {
        txnr: u32,
        command: String,
        response: Response,
    },
}

pub struct Session {
    id: SessionId,
    role: Role,
    state: SessionState,
    max_data_len: usize,
    window: TxnWindow,
    rcv_txnr: TxnCounter,
    local_offers: Offers,
    proposed: Offers,
    negotiated: Offers,
    close_complete: bool,
    recv_buf: Vec<u8>,
    outbound: Vec<u8>,
    events: Vec<SessionEvent>,
}

impl Session {
    pub fn server(config: &SessionConfig) -> Result<Self, ProtocolError> {
        Self::with_role(Role::Server, config)
    }

    pub fn client(config: &SessionConfig) -> Result<Self, ProtocolError> {
        Self::with_role(Role::Client, config)
    }

    fn with_role(role: Role, config: &SessionConfig) -> Result<Self, ProtocolError> {
        config.validate()?;
        Ok(Self {
            id: SessionId::new(),
            role,
            state: SessionState::AwaitingInit,
            max_data_len: config.max_data_len,
            window: TxnWindow::new(config.window_size, config.txnr_wrap)?,
            rcv_txnr: TxnCounter::new(config.txnr_wrap)?,
            local_offers: config.offers.clone(),
            proposed: Offers::new(),
            negotiated: Offers::new(),
            close_complete: false,
            recv_buf: Vec::new(),
            outbound: Vec::new(),
            events: Vec::new(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Offers in force. Empty until the session is Ready, then frozen.
    pub fn negotiated_offers(&self) -> &Offers {
        &self.negotiated
    }

    pub fn local_offers(&self) -> &Offers {
        &self.local_offers
    }

    /// Commands sent and not yet answered, oldest first.
    pub fn outstanding(&self) -> impl Iterator<Item = &Pending> {
        self.window.outstanding()
    }

    pub fn window_size(&self) -> usize {
        self.window.size()
    }

    /// True once the close exchange is done and the host should release the connection.
    pub fn is_finished(&self) -> bool {
        self.close_complete || self.state == SessionState::Closed
    }

    /// Append received bytes and dispatch every complete frame.
    /// A partial frame stays buffered until the next call.
    pub fn receive(&mut self, bytes: &[u8], dispatcher: &Dispatcher) -> Result<(), ProtocolError> {
        self.receive_with(bytes, |session, frame| dispatcher.dispatch(session, frame))
    }

    /// Like [`Session::receive`], but every complete frame goes to `dispatch`.
    pub fn receive_with(
        &mut self,
        bytes: &[u8],
        mut dispatch: impl FnMut(&mut Session, &Frame) -> Result<(), ProtocolError>,
    ) -> Result<(), ProtocolError> {
        self.recv_buf.try_reserve(bytes.len())?;
        self.recv_buf.extend_from_slice(bytes);
        while !self.is_finished() {
            let (frame, consumed) = match frame::decode_frame(&self.recv_buf, self.max_data_len) {
                Ok(decoded) => decoded,
                Err(FrameDecodeError::NeedMore) => break,
                Err(e) => return Err(e.into()),
            };
            self.recv_buf.drain(..consumed);
            dispatch(self, &frame)?;
        }
        Ok(())
    }

    /// Bytes queued for the peer since the last call.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Client: open negotiation by sending `init` with the local offers.
    pub fn start(&mut self) -> Result<u32, ProtocolError> {
        self.require(Role::Client, SessionState::AwaitingInit, CMD_INIT)?;
        let offers = self.local_offers.encode();
        let txnr = self.send_command(CMD_INIT, &offers)?;
        self.state = SessionState::OffersSent;
        Ok(txnr)
    }

    /// Client: send one message. Fails with `WindowExceeded` when the window is full.
    pub fn send_message(&mut self, message: &[u8]) -> Result<u32, ProtocolError> {
        self.require(Role::Client, SessionState::Ready, CMD_MSG)?;
        self.send_command(CMD_MSG, message)
    }

    /// Client: begin an orderly close. The session finishes when the `rsp` arrives.
    pub fn close(&mut self) -> Result<u32, ProtocolError> {
        self.require(Role::Client, SessionState::Ready, CMD_CLOSE)?;
        let txnr = self.send_command(CMD_CLOSE, &[])?;
        self.state = SessionState::Closing;
        Ok(txnr)
    }

    /// Terminal transition, taken by the host when it releases the connection.
    pub fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
        self.recv_buf = Vec::new();
    }

    pub(crate) fn send_command(&mut self, command: &str, data: &[u8]) -> Result<u32, ProtocolError> {
        if data.len() > frame::MAX_TXNR as usize {
            return Err(frame::FrameEncodeError::TooLarge.into());
        }
        let txnr = self.window.issue(command)?;
        let frame = match Frame::new(txnr, command, data) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = self.window.acknowledge(txnr);
                return Err(e.into());
            }
        };
        frame.encode_into(&mut self.outbound);
        Ok(txnr)
    }

    /// Queue an `rsp` frame answering `txnr`. Used by command handlers.
    pub fn respond(&mut self, txnr: u32, response: &Response) -> Result<(), ProtocolError> {
        Frame::new(txnr, CMD_RSP, response.encode())?.encode_into(&mut self.outbound);
        Ok(())
    }

    /// Fail with `ProtocolViolation` unless this session has `role` and is in `state`.
    pub(crate) fn require(
        &self,
        role: Role,
        state: SessionState,
        command: &str,
    ) -> Result<(), ProtocolError> {
        if self.role != role || self.state != state {
            return Err(ProtocolError::ProtocolViolation {
                command: command.to_string(),
                state: self.state,
            });
        }
        Ok(())
    }

    /// Incoming commands must carry the next number in sequence.
    pub(crate) fn accept_txnr(&mut self, txnr: u32) -> Result<(), ProtocolError> {
        let expected = self.rcv_txnr.peek();
        if txnr != expected {
            return Err(ProtocolError::UnexpectedTxnr {
                expected,
                got: txnr,
            });
        }
        self.rcv_txnr.advance();
        Ok(())
    }

    pub(crate) fn acknowledge(&mut self, txnr: u32) -> Result<Pending, ProtocolError> {
        self.window.acknowledge(txnr)
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub(crate) fn proposed(&self) -> &Offers {
        &self.proposed
    }

    pub(crate) fn set_proposed(&mut self, offers: Offers) {
        self.proposed = offers;
    }

    /// Enter Ready with the proposed offers as the negotiated set.
    pub(crate) fn become_ready(&mut self) {
        self.negotiated = std::mem::take(&mut self.proposed);
        self.state = SessionState::Ready;
        self.events.push(SessionEvent::Ready);
    }

    pub(crate) fn finish_close(&mut self) {
        self.state = SessionState::Closing;
        self.close_complete = true;
    }

    pub(crate) fn push_event(&mut self, event: SessionEvent) {
        self.events.push(event);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("outstanding", &self.window.len())
            .field("buffered", &self.recv_buf.len())
            .finish()
    }
}
