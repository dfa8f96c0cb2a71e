//! Replaceable event listeners.

use core::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// A shared event handler.
pub type Listener<A> = Arc<dyn Fn(A) + Send + Sync>;

/// Holds at most one listener for one kind of event.
///
/// Setting a listener replaces the previous one. The handler is cloned out
/// of the lock before it runs, so a handler may freely replace or clear
/// listeners (including its own).
pub struct Slot<A> {
    handler: Mutex<Option<Listener<A>>>,
}

impl<A> Slot<A> {
    /// An empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handler: Mutex::new(None),
        }
    }

    /// Install `handler`, replacing any previous one.
    pub fn set(&self, handler: impl Fn(A) + Send + Sync + 'static) {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    /// Remove the installed handler.
    pub fn clear(&self) {
        self.handler.lock().take();
    }

    /// Whether a handler is installed.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.handler.lock().is_some()
    }

    /// Run the installed handler, if any. Returns whether one ran.
    pub fn emit(&self, arg: A) -> bool {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => {
                handler(arg);
                true
            }
            None => false,
        }
    }
}

impl<A> Default for Slot<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for Slot<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").field("set", &self.is_set()).finish()
    }
}
