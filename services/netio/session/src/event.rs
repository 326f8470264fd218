//! Event kinds exchanged between event generators and sessions.

use std::time::Duration;

/// Registration change requested of an event generator.
///
/// Commands issued on the generator thread are applied immediately; from
/// other threads they are queued and applied at the top of the next loop
/// iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Add the session's transport to the selector
    Register,
    /// Remove the session and tear it down
    Unregister,
    /// The write queue became non-empty
    EnableWrite,
}

/// Readiness or housekeeping event delivered to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// A listening transport has connections to accept
    Acceptable,
    /// A pending connect has resolved
    Connectable,
    /// Bytes can be read
    Readable,
    /// Bytes can be written
    Writable,
    /// No activity since the last sweep, which was this long ago
    CheckTimeout(Duration),
    /// The session had readiness events in this iteration
    Activity,
}

/// What a registered transport is currently waiting for.
///
/// The generator uses this to turn raw readiness into [`IoEvent`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPhase {
    /// Passive listener waiting for connections
    Listening,
    /// Outbound connect in progress
    Connecting,
    /// Connected or bound, exchanging data
    Open,
}

impl IoPhase {
    /// Map readiness flags to events in delivery order.
    pub fn events(self, readable: bool, writable: bool) -> impl Iterator<Item = IoEvent> {
        let (first, second) = match self {
            IoPhase::Listening => (readable.then_some(IoEvent::Acceptable), None),
            IoPhase::Connecting => ((readable || writable).then_some(IoEvent::Connectable), None),
            IoPhase::Open => (
                readable.then_some(IoEvent::Readable),
                writable.then_some(IoEvent::Writable),
            ),
        };
        first.into_iter().chain(second)
    }
}
