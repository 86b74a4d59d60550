//! Command dispatch: a table from command name to handler.
//!
//! The default table covers `init`, `go`, `msg`, `close` and `rsp`. Each
//! handler enforces the state machine; a command arriving in the wrong state is
//! a `ProtocolViolation` and an unknown command is `InvalidCommand`. Both are
//! fatal for the session.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::offers::Offers;
use crate::protocol::{Response, CMD_CLOSE, CMD_GO, CMD_INIT, CMD_MSG, CMD_RSP};
use crate::session::{Role, Session, SessionEvent, SessionId, SessionState};

/// Receives every `msg` payload. `Err(reason)` is sent back as a `500` response.
pub trait MessageConsumer: Send + Sync {
    fn consume(&self, session: SessionId, message: &[u8]) -> Result<(), String>;
}

impl<F> MessageConsumer for F
where
    F: Fn(SessionId, &[u8]) -> Result<(), String> + Send + Sync,
{
    fn consume(&self, session: SessionId, message: &[u8]) -> Result<(), String> {
        self(session, message)
    }
}

/// Handles one command. May mutate the session and queue frames on it.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, session: &mut Session, frame: &Frame) -> Result<(), ProtocolError>;
}

pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl Dispatcher {
    /// Dispatcher with the standard command set; `msg` payloads go to `consumer`.
    pub fn new(consumer: Arc<dyn MessageConsumer>) -> Self {
        let mut d = Self::empty();
        d.register(CMD_INIT, InitHandler);
        d.register(CMD_GO, GoHandler);
        d.register(CMD_MSG, MsgHandler { consumer });
        d.register(CMD_CLOSE, CloseHandler);
        d.register(CMD_RSP, RspHandler);
        d
    }

    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Add or replace the handler for `command`.
    pub fn register(&mut self, command: &str, handler: impl CommandHandler + 'static) {
        self.handlers.insert(command.to_string(), Arc::new(handler));
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Run the handler for `frame.command()` against `session`.
    ///
    /// # Panics
    /// If the session is already Closed; the host must never feed a released session.
    pub fn dispatch(&self, session: &mut Session, frame: &Frame) -> Result<(), ProtocolError> {
        assert!(
            session.state() != SessionState::Closed,
            "frame dispatched to closed session {}",
            session.id()
        );
        let handler = self
            .handlers
            .get(frame.command())
            .ok_or_else(|| ProtocolError::InvalidCommand(frame.command().to_string()))?;
        if frame.command() != CMD_RSP {
            session.accept_txnr(frame.txnr())?;
        }
        handler.handle(session, frame)
    }
}

/// Server: parse the client's offers, answer with the subset we support.
struct InitHandler;

impl CommandHandler for InitHandler {
    fn handle(&self, session: &mut Session, frame: &Frame) -> Result<(), ProtocolError> {
        session.require(Role::Server, SessionState::AwaitingInit, CMD_INIT)?;
        let offered = Offers::parse(frame.data())?;
        let ours = session.local_offers().relp_version();
        match offered.relp_version() {
            Some(v) if Some(v) == ours => {}
            other => {
                let reason = match other {
                    Some(v) => format!("unsupported relp_version {v}"),
                    None => "missing relp_version offer".to_string(),
                };
                session.respond(frame.txnr(), &Response::error(&reason))?;
                return Err(ProtocolError::Negotiation(reason));
            }
        }
        let mut accepted = Offers::new();
        for offer in &offered {
            if session.local_offers().contains(offer.name()) {
                accepted.insert(offer.clone());
            }
        }
        session.respond(frame.txnr(), &Response::ok_with_data(accepted.encode()))?;
        session.set_proposed(accepted);
        session.set_state(SessionState::OffersSent);
        Ok(())
    }
}

/// Server: the client's final selection must come from what we accepted.
struct GoHandler;

impl CommandHandler for GoHandler {
    fn handle(&self, session: &mut Session, frame: &Frame) -> Result<(), ProtocolError> {
        session.require(Role::Server, SessionState::OffersSent, CMD_GO)?;
        let selected = Offers::parse(frame.data())?;
        let stray = selected
            .iter()
            .find(|o| session.proposed().get(o.name()) != Some(*o));
        let reason = match stray {
            Some(o) => Some(format!("offer {} was not accepted", o.name())),
            None if selected.relp_version().is_none() => {
                Some("missing relp_version offer".to_string())
            }
            None => None,
        };
        if let Some(reason) = reason {
            session.respond(frame.txnr(), &Response::error(&reason))?;
            return Err(ProtocolError::Negotiation(reason));
        }
        session.set_proposed(selected);
        session.respond(frame.txnr(), &Response::ok())?;
        session.become_ready();
        Ok(())
    }
}

struct MsgHandler {
    consumer: Arc<dyn MessageConsumer>,
}

impl CommandHandler for MsgHandler {
    fn handle(&self, session: &mut Session, frame: &Frame) -> Result<(), ProtocolError> {
        session.require(Role::Server, SessionState::Ready, CMD_MSG)?;
        let response = match self.consumer.consume(session.id(), frame.data()) {
            Ok(()) => Response::ok(),
            Err(reason) => Response::error(&reason),
        };
        session.respond(frame.txnr(), &response)?;
        session.push_event(SessionEvent::Message {
            txnr: frame.txnr(),
            data: frame.data().to_vec(),
        });
        Ok(())
    }
}

struct CloseHandler;

impl CommandHandler for CloseHandler {
    fn handle(&self, session: &mut Session, frame: &Frame) -> Result<(), ProtocolError> {
        session.require(Role::Server, SessionState::Ready, CMD_CLOSE)?;
        session.respond(frame.txnr(), &Response::ok())?;
        session.finish_close();
        Ok(())
    }
}

/// Client: correlate a response with its command by transaction number.
struct RspHandler;

impl CommandHandler for RspHandler {
    fn handle(&self, session: &mut Session, frame: &Frame) -> Result<(), ProtocolError> {
        if session.role() != Role::Client {
            return Err(ProtocolError::ProtocolViolation {
                command: CMD_RSP.to_string(),
                state: session.state(),
            });
        }
        let pending = session.acknowledge(frame.txnr())?;
        let response = Response::parse(frame.data())?;
        match pending.command.as_str() {
            CMD_INIT => on_init_response(session, &response),
            CMD_GO => {
                if !response.is_success() {
                    return Err(refused(CMD_GO, &response));
                }
                session.become_ready();
                Ok(())
            }
            CMD_CLOSE => {
                session.finish_close();
                Ok(())
            }
            _ => {
                session.push_event(SessionEvent::Acknowledged {
                    txnr: pending.txnr,
                    command: pending.command.clone(),
                    response,
                });
                Ok(())
            }
        }
    }
}

/// Client: pick the offers to use from the server's accepted set and send `go`.
fn on_init_response(session: &mut Session, response: &Response) -> Result<(), ProtocolError> {
    if !response.is_success() {
        return Err(refused(CMD_INIT, response));
    }
    let accepted = Offers::parse(&response.data)?;
    if accepted.relp_version() != session.local_offers().relp_version() {
        return Err(ProtocolError::Negotiation(
            "server did not accept our relp_version".to_string(),
        ));
    }
    let mut selected = Offers::new();
    for offer in &accepted {
        if session.local_offers().contains(offer.name()) {
            selected.insert(offer.clone());
        }
    }
    session.send_command(CMD_GO, &selected.encode())?;
    session.set_proposed(selected);
    session.set_state(SessionState::AwaitingGo);
    Ok(())
}

fn refused(command: &str, response: &Response) -> ProtocolError {
    ProtocolError::Negotiation(format!(
        "{command} refused with {}: {}",
        response.code.as_u16(),
        response.message.as_deref().unwrap_or("")
    ))
}
