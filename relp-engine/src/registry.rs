use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Lock-protected list of shared entries. Iteration works on a snapshot, so
/// the lock is never held while an entry is serviced.
///
/// Additions wake whoever waits on [`Registry::changed`]; the wake is kept
/// until someone waits, so an addition made between a snapshot and the wait
/// is not missed.
#[derive(Debug)]
pub struct Registry<T> {
    entries: Mutex<Vec<Arc<T>>>,
    wake: Notify,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, entry: Arc<T>) {
        self.lock().push(entry);
        self.wake.notify_one();
    }

    /// Wake the waiter without changing the set, e.g. when an entry needs a
    /// different kind of readiness than it was last polled for.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Resolves on the next `add` or `notify`.
    pub fn changed(&self) -> Notified<'_> {
        self.wake.notified()
    }

    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.lock().clone()
    }

    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<Arc<T>> {
        self.lock().iter().find(|e| pred(e)).cloned()
    }

    /// Remove the first matching entry. `release` runs while the lock is
    /// still held, so no other thread observes the entry half torn down.
    pub fn remove(
        &self,
        mut pred: impl FnMut(&T) -> bool,
        release: impl FnOnce(&T),
    ) -> Option<Arc<T>> {
        let mut entries = self.lock();
        let index = entries.iter().position(|e| pred(e))?;
        let entry = entries.remove(index);
        release(&entry);
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}
