use std::io;

use relp_core::{ProtocolError, SessionId};

/// Engine-level errors. Everything raised while servicing one session only
/// tears that session down; `run` itself does not fail on them.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("could not bind any socket for port {port}: {source}")]
    Bind {
        port: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid listen port {0:?}")]
    InvalidPort(String),
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the connection")]
    ConnectionClosed,
    #[error("peer is not reading: {len} unsent bytes exceed {limit}")]
    BacklogExceeded { len: usize, limit: usize },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
}
