//! Protocol errors. Every variant except the configuration ones is fatal for
//! the session it occurred on; the host tears that session down.

use crate::frame::{FrameDecodeError, FrameEncodeError};
use crate::offers::OfferError;
use crate::session::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid command {0:?}")]
    InvalidCommand(String),
    #[error("command {command:?} not allowed in state {state:?}")]
    ProtocolViolation {
        command: String,
        state: SessionState,
    },
    #[error(transparent)]
    MalformedFrame(#[from] FrameDecodeError),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("malformed response: {0}")]
    MalformedResponse(&'static str),
    #[error("bad offer: {0}")]
    Offer(#[from] OfferError),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("window of {window} outstanding transactions is full")]
    WindowExceeded { window: usize },
    #[error("expected transaction number {expected}, got {got}")]
    UnexpectedTxnr { expected: u32, got: u32 },
    #[error("response for unknown transaction {0}")]
    UnknownTxnr(u32),
    #[error("out of memory growing receive buffer")]
    OutOfMemory,
    #[error("transaction number wrap {0} must be in 2..=1000000000")]
    InvalidTxnrWrap(u32),
    #[error("window {window} does not fit in {span} transaction numbers")]
    InvalidWindow { window: usize, span: u32 },
}

impl From<std::collections::TryReserveError> for ProtocolError {
    fn from(_: std::collections::TryReserveError) -> Self {
        ProtocolError::OutOfMemory
    }
}
