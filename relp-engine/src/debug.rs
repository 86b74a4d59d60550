//! Pluggable debug output. Diagnostic only; nothing protocol-relevant goes through here.

use std::fmt;
use std::sync::{Arc, RwLock};

/// Receives formatted debug messages from the engine.
pub trait DebugSink: Send + Sync {
    fn debug(&self, args: fmt::Arguments<'_>);
}

impl<F> DebugSink for F
where
    F: Fn(fmt::Arguments<'_>) + Send + Sync,
{
    fn debug(&self, args: fmt::Arguments<'_>) {
        self(args)
    }
}

/// Forwards debug messages to `tracing` at trace level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DebugSink for TracingSink {
    fn debug(&self, args: fmt::Arguments<'_>) {
        tracing::trace!(target: "relp::debug", "{}", args);
    }
}

/// Swappable sink slot. Empty means no-op. The lock is released before the sink runs.
#[derive(Default)]
pub(crate) struct DebugSlot {
    sink: RwLock<Option<Arc<dyn DebugSink>>>,
}

impl DebugSlot {
    pub(crate) fn set(&self, sink: Option<Arc<dyn DebugSink>>) {
        match self.sink.write() {
            Ok(mut slot) => *slot = sink,
            Err(poisoned) => *poisoned.into_inner() = sink,
        }
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn DebugSink>> {
        match self.sink.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn emit(&self, args: fmt::Arguments<'_>) {
        if let Some(sink) = self.get() {
            sink.debug(args);
        }
    }
}

/// `debug_print!(slot, "fmt", args..)`: format lazily and hand to the current sink.
macro_rules! debug_print {
    ($slot:expr, $($arg:tt)*) => {
        $slot.emit(format_args!($($arg)*))
    };
}
pub(crate) use debug_print;
