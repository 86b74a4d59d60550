//! Transaction numbering and the send window.
//!
//! Commands are numbered from 1 in strictly increasing order. The counter
//! wraps back to 1 at a configurable ceiling; 0 is never issued. A window
//! bounds how many commands may be outstanding (sent, no `rsp` yet) at once.
//! The ceiling must leave room for a whole window so a number still awaiting
//! its response is never reissued.

use std::collections::VecDeque;

use crate::error::ProtocolError;
use crate::frame::MAX_TXNR;

/// Default wrap point: numbers run 1..=999.
pub const DEFAULT_TXNR_WRAP: u32 = 1000;
/// Default number of commands allowed in flight.
pub const DEFAULT_WINDOW_SIZE: usize = 128;

/// Monotonic transaction number generator with wrap-around.
#[derive(Debug, Clone)]
pub struct TxnCounter {
    next: u32,
    wrap: u32,
}

impl TxnCounter {
    /// `wrap` is exclusive: the largest number issued is `wrap - 1`.
    pub fn new(wrap: u32) -> Result<Self, ProtocolError> {
        if wrap < 2 || wrap - 1 > MAX_TXNR {
            return Err(ProtocolError::InvalidTxnrWrap(wrap));
        }
        Ok(Self { next: 1, wrap })
    }

    /// The number `advance` would return.
    pub fn peek(&self) -> u32 {
        self.next
    }

    pub fn advance(&mut self) -> u32 {
        let current = self.next;
        self.next = if current + 1 >= self.wrap { 1 } else { current + 1 };
        current
    }

    /// How many distinct numbers the counter cycles through.
    pub fn span(&self) -> u32 {
        self.wrap - 1
    }
}

impl Default for TxnCounter {
    fn default() -> Self {
        Self {
            next: 1,
            wrap: DEFAULT_TXNR_WRAP,
        }
    }
}

/// A command that has been sent and awaits its `rsp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    pub txnr: u32,
    pub command: String,
}

/// Send-side window: assigns transaction numbers and tracks outstanding commands in send order.
#[derive(Debug, Clone)]
pub struct TxnWindow {
    counter: TxnCounter,
    size: usize,
    outstanding: VecDeque<Pending>,
}

impl TxnWindow {
    pub fn new(size: usize, wrap: u32) -> Result<Self, ProtocolError> {
        let counter = TxnCounter::new(wrap)?;
        if size == 0 || size >= counter.span() as usize {
            return Err(ProtocolError::InvalidWindow {
                window: size,
                span: counter.span(),
            });
        }
        Ok(Self {
            counter,
            size,
            outstanding: VecDeque::with_capacity(size),
        })
    }

    /// Assign the next transaction number to `command` and record it as outstanding.
    /// Rejected without any state change when the window is full.
    pub fn issue(&mut self, command: &str) -> Result<u32, ProtocolError> {
        if self.outstanding.len() >= self.size {
            return Err(ProtocolError::WindowExceeded { window: self.size });
        }
        let txnr = self.counter.peek();
        if self.is_outstanding(txnr) {
            return Err(ProtocolError::WindowExceeded { window: self.size });
        }
        self.counter.advance();
        self.outstanding.push_back(Pending {
            txnr,
            command: command.to_string(),
        });
        Ok(txnr)
    }

    /// Remove the outstanding entry for `txnr`. Responses may arrive in any order.
    pub fn acknowledge(&mut self, txnr: u32) -> Result<Pending, ProtocolError> {
        let idx = self
            .outstanding
            .iter()
            .position(|p| p.txnr == txnr)
            .ok_or(ProtocolError::UnknownTxnr(txnr))?;
        self.outstanding
            .remove(idx)
            .ok_or(ProtocolError::UnknownTxnr(txnr))
    }

    pub fn is_outstanding(&self, txnr: u32) -> bool {
        self.outstanding.iter().any(|p| p.txnr == txnr)
    }

    /// Outstanding commands, oldest first.
    pub fn outstanding(&self) -> impl Iterator<Item = &Pending> {
        self.outstanding.iter()
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.outstanding.len() >= self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn counter_starts_at_one_and_wraps_past_zero() {
        let mut c = TxnCounter::new(4).unwrap();
        let issued: Vec<u32> = (0..7).map(|_| c.advance()).collect();
        assert_eq!(issued, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn counter_rejects_bad_wrap() {
        assert!(TxnCounter::new(1).is_err());
        assert!(TxnCounter::new(MAX_TXNR + 2).is_err());
        assert!(TxnCounter::new(MAX_TXNR + 1).is_ok());
    }

    #[test]
    fn window_must_fit_in_txnr_span() {
        assert!(TxnWindow::new(0, 1000).is_err());
        assert!(TxnWindow::new(999, 1000).is_err());
        assert!(TxnWindow::new(998, 1000).is_ok());
    }

    #[test]
    fn full_window_rejects_without_change() {
        let mut w = TxnWindow::new(2, 1000).unwrap();
        assert_eq!(w.issue("msg").unwrap(), 1);
        assert_eq!(w.issue("msg").unwrap(), 2);
        let before: Vec<Pending> = w.outstanding().cloned().collect();
        assert!(matches!(
            w.issue("msg"),
            Err(ProtocolError::WindowExceeded { window: 2 })
        ));
        let after: Vec<Pending> = w.outstanding().cloned().collect();
        assert_eq!(before, after);
        // The rejected attempt did not consume a number.
        w.acknowledge(1).unwrap();
        assert_eq!(w.issue("msg").unwrap(), 3);
    }

    #[test]
    fn acknowledge_out_of_order() {
        let mut w = TxnWindow::new(8, 1000).unwrap();
        for _ in 0..3 {
            w.issue("msg").unwrap();
        }
        assert_eq!(w.acknowledge(2).unwrap().txnr, 2);
        assert_eq!(w.acknowledge(3).unwrap().command, "msg");
        assert!(matches!(w.acknowledge(3), Err(ProtocolError::UnknownTxnr(3))));
        let left: Vec<u32> = w.outstanding().map(|p| p.txnr).collect();
        assert_eq!(left, vec![1]);
    }

    #[test]
    fn stalled_oldest_blocks_reuse_after_wrap() {
        // span 4, window 3: txnr 1 stays outstanding while others cycle.
        let mut w = TxnWindow::new(3, 5).unwrap();
        assert_eq!(w.issue("msg").unwrap(), 1);
        for expected in [2, 3, 4] {
            assert_eq!(w.issue("msg").unwrap(), expected);
            w.acknowledge(expected).unwrap();
        }
        // Next number would be 1 again, which is still outstanding.
        assert!(matches!(w.issue("msg"), Err(ProtocolError::WindowExceeded { .. })));
        w.acknowledge(1).unwrap();
        assert_eq!(w.issue("msg").unwrap(), 1);
    }

    proptest! {
        #[test]
        fn outstanding_numbers_are_unique(
            window in 1usize..32,
            ops in proptest::collection::vec(any::<bool>(), 0..400),
        ) {
            let mut w = TxnWindow::new(window, 40).unwrap();
            for send in ops {
                if send {
                    let before = w.len();
                    match w.issue("msg") {
                        Ok(_) => prop_assert_eq!(w.len(), before + 1),
                        Err(_) => prop_assert_eq!(w.len(), before),
                    }
                } else {
                    let oldest = w.outstanding().next().map(|p| p.txnr);
                    if let Some(oldest) = oldest {
                        w.acknowledge(oldest).unwrap();
                    }
                }
                prop_assert!(w.len() <= window);
                let live: HashSet<u32> = w.outstanding().map(|p| p.txnr).collect();
                prop_assert_eq!(live.len(), w.len());
            }
        }

        #[test]
        fn numbers_distinct_until_wrap(n in 1usize..999) {
            let mut c = TxnCounter::default();
            let issued: HashSet<u32> = (0..n).map(|_| c.advance()).collect();
            prop_assert_eq!(issued.len(), n);
        }
    }
}
