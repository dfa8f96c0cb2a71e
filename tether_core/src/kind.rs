//! Transport kinds and connection phases.

use core::fmt;

/// The underlying channel a connection runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Native full-duplex socket obtained through an HTTP upgrade.
    Primary,

    /// Request/response long-polling that emulates the same event stream.
    Fallback,
}

impl TransportKind {
    /// The wire name of this transport.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            TransportKind::Primary => "websocket",
            TransportKind::Fallback => "polling",
        }
    }

    /// The kind to retry with when this one fails to open, if any.
    #[must_use]
    pub const fn fallback(self) -> Option<Self> {
        match self {
            TransportKind::Primary => Some(TransportKind::Fallback),
            TransportKind::Fallback => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of a logical connection.
///
/// A connection starts [`Negotiating`](ConnectionPhase::Negotiating), becomes
/// [`Established`](ConnectionPhase::Established) at most once, and ends
/// [`Closed`](ConnectionPhase::Closed) exactly once. It never goes back to
/// negotiating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    /// No transport has opened yet.
    Negotiating,

    /// A transport opened; events flow to the application.
    Established,

    /// Terminal.
    Closed,
}

impl ConnectionPhase {
    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (ConnectionPhase::Negotiating, ConnectionPhase::Established)
                | (ConnectionPhase::Negotiating, ConnectionPhase::Closed)
                | (ConnectionPhase::Established, ConnectionPhase::Closed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names() {
        assert_eq!(TransportKind::Primary.to_string(), "websocket");
        assert_eq!(TransportKind::Fallback.to_string(), "polling");
    }

    #[test]
    fn only_primary_has_a_fallback() {
        assert_eq!(
            TransportKind::Primary.fallback(),
            Some(TransportKind::Fallback)
        );
        assert_eq!(TransportKind::Fallback.fallback(), None);
    }

    #[test]
    fn phases_never_go_backwards() {
        use ConnectionPhase::{Closed, Established, Negotiating};

        assert!(Negotiating.can_advance_to(Established));
        assert!(Negotiating.can_advance_to(Closed));
        assert!(Established.can_advance_to(Closed));

        assert!(!Established.can_advance_to(Negotiating));
        assert!(!Closed.can_advance_to(Negotiating));
        assert!(!Closed.can_advance_to(Established));
        assert!(!Established.can_advance_to(Established));
    }
}
