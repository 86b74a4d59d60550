//! RELP (reliable event logging protocol) reference core.
//! Host-driven: no I/O; the host passes received bytes in and writes out the bytes the session queues.

pub mod dispatch;
pub mod error;
pub mod frame;
pub mod offers;
pub mod protocol;
pub mod session;
pub mod txn;

pub use dispatch::{CommandHandler, Dispatcher, MessageConsumer};
pub use error::ProtocolError;
pub use frame::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError};
pub use offers::{Offer, OfferError, Offers};
pub use protocol::{Response, RspCode, PROTOCOL_VERSION};
pub use session::{Role, Session, SessionConfig, SessionEvent, SessionId, SessionState};
pub use txn::{Pending, TxnCounter, TxnWindow};
