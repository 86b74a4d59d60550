//! Network engine for RELP: listeners, per-connection sessions and the
//! readiness loop that drives them, plus the `relpd` daemon's configuration.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod debug;
pub mod engine;
pub mod error;
pub mod listener;
pub mod poll;
pub mod registry;

pub use connection::{Connection, Received};
pub use consumer::LineConsumer;
pub use debug::{DebugSink, TracingSink};
pub use engine::Engine;
pub use error::EngineError;
pub use listener::{Listener, DEFAULT_PORT};
