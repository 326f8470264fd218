//! Session and statistic listeners.

use crate::error::SessionError;
use crate::message::MessageRef;
use crate::session::Session;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Receives session lifecycle and data events.
///
/// Every method has a no-op default. A returned error, or a panic, is caught
/// by the session and re-delivered through [`exception_caught`]; it never
/// prevents other listeners from seeing the event.
///
/// [`exception_caught`]: SessionListener::exception_caught
#[allow(unused_variables)]
pub trait SessionListener: Send + Sync {
    /// The session is established and ready for writes.
    fn session_established(&self, session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    /// The session has been torn down.
    fn session_closed(&self, session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    /// The write queue drained, or a timeout sweep found nothing to write.
    fn session_idle(&self, session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    /// No I/O happened for the configured session timeout.
    fn session_timeout(&self, session: &Session) -> anyhow::Result<()> {
        Ok(())
    }

    /// A complete message was recognized.
    fn message_received(&self, session: &Session, message: &MessageRef) -> anyhow::Result<()> {
        Ok(())
    }

    /// A queued message was fully written.
    fn message_sent(&self, session: &Session, message: &MessageRef) -> anyhow::Result<()> {
        Ok(())
    }

    /// An error was caught. Errors returned from here are only logged.
    fn exception_caught(&self, session: &Session, cause: &SessionError) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Receives per-delta byte counts from a session statistic.
#[allow(unused_variables)]
pub trait StatisticListener: Send + Sync {
    /// `bytes` were read from the transport.
    fn received(&self, session: &Session, bytes: u64) {}

    /// `bytes` were written to the transport.
    fn sent(&self, session: &Session, bytes: u64) {}
}

/// Copy-on-write listener list.
///
/// Iteration works on a snapshot, so listeners may add or remove listeners
/// (including themselves) while being notified.
pub(crate) struct ListenerSet<L: ?Sized> {
    items: ArcSwap<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            items: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl<L: ?Sized> ListenerSet<L> {
    pub(crate) fn add(&self, listener: Arc<L>) {
        self.items.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&listener));
            next
        });
    }

    pub(crate) fn remove(&self, listener: &Arc<L>) {
        self.items.rcu(|current| {
            current
                .iter()
                .filter(|l| !same_listener(l, listener))
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        self.items.load_full()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.load().len()
    }
}

fn same_listener<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
