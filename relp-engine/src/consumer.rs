use std::io::Write;
use std::sync::Mutex;

use relp_core::{MessageConsumer, SessionId};

/// Writes each received message as one line to a writer (stdout in `relpd`).
/// A write failure becomes a negative acknowledgement to the sender.
pub struct LineConsumer<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> LineConsumer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl LineConsumer<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> MessageConsumer for LineConsumer<W> {
    fn consume(&self, _session: SessionId, message: &[u8]) -> Result<(), String> {
        let mut out = self.out.lock().map_err(|_| "output lock poisoned".to_string())?;
        let line = message.strip_suffix(b"\n").unwrap_or(message);
        out.write_all(line)
            .and_then(|()| out.write_all(b"\n"))
            .and_then(|()| out.flush())
            .map_err(|e| format!("write failed: {e}"))
    }
}
