//! Send-completion bookkeeping.
//!
//! Every send is assigned a monotonically increasing sequence number and its
//! completion callback is stored under that number. The callback is removed
//! from the map before it runs, so whichever of "flushed", "flush failed" or
//! "connection closed" happens first wins and the others become no-ops:
//!
//! ```text
//! register(cb) ──► seq ──► { seq: cb }
//!                             │
//!          complete(seq) ─────┼──► cb(Ok(()))
//!          fail(seq, e)  ─────┼──► cb(Err(e))
//!          fail_all(e)   ─────┴──► cb(Err(e)) for every remaining seq
//! ```

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::error::SendError;

/// A send-completion callback.
pub type Completion = Box<dyn FnOnce(Result<(), SendError>) + Send>;

/// Pending send callbacks keyed by sequence number.
pub struct PendingSends {
    next_seq: AtomicU64,
    callbacks: Mutex<BTreeMap<u64, Completion>>,
}

impl PendingSends {
    /// An empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_seq: AtomicU64::new(0),
            callbacks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Store `callback` and return its sequence number.
    pub fn register(
        &self,
        callback: impl FnOnce(Result<(), SendError>) + Send + 'static,
    ) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().insert(seq, Box::new(callback));
        seq
    }

    /// Resolve `seq` successfully. Returns `false` if it was already resolved.
    pub fn complete(&self, seq: u64) -> bool {
        self.resolve(seq, Ok(()))
    }

    /// Resolve `seq` with `error`. Returns `false` if it was already resolved.
    pub fn fail(&self, seq: u64, error: SendError) -> bool {
        self.resolve(seq, Err(error))
    }

    /// Resolve every pending callback with `error`, returning how many ran.
    ///
    /// The map is empty afterwards.
    pub fn fail_all(&self, error: &SendError) -> usize {
        let drained = core::mem::take(&mut *self.callbacks.lock());
        let count = drained.len();
        for (_seq, callback) in drained {
            callback(Err(error.clone()));
        }
        count
    }

    /// Number of unresolved callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Whether every callback has been resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }

    fn resolve(&self, seq: u64, result: Result<(), SendError>) -> bool {
        let callback = self.callbacks.lock().remove(&seq);
        match callback {
            Some(callback) => {
                callback(result);
                true
            }
            None => false,
        }
    }
}

impl Default for PendingSends {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for PendingSends {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PendingSends")
            .field("next_seq", &self.next_seq.load(Ordering::Relaxed))
            .field("pending", &self.len())
            .finish()
    }
}
