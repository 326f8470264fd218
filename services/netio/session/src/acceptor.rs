//! Listener sessions: accepting connections and tracking children.
//!
//! Each accepted connection is handed to a [`SessionFactory`], which builds
//! the child session. The child adopts the stream, is started on the
//! listener's event generator and stays in the listener's children map until
//! it closes.

use crate::error::{Result, SessionError};
use crate::listener::{ListenerSet, SessionListener};
use crate::session::{Session, WeakSession};
use crate::transport;
use mio::net::TcpStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(feature = "tls")]
use crate::session::SessionKind;
#[cfg(feature = "tls")]
use crate::tls::TlsRole;

/// Builds the session for an accepted connection.
pub trait SessionFactory: Send + Sync {
    /// Child session for a connection from `peer`, or `None` to reject it.
    fn build(&self, listener: &Session, peer: SocketAddr) -> Option<Session>;
}

/// Default factory: a TCP (or TLS, if the listener has a server
/// configuration) child inheriting the listener's recognizer, dispatcher,
/// event generator, timeout and logging settings.
#[derive(Default)]
pub struct SimpleSessionFactory {
    listeners: ListenerSet<dyn SessionListener>,
}

impl SimpleSessionFactory {
    /// Factory without listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener every child gets.
    pub fn with_listener(self, listener: Arc<dyn SessionListener>) -> Self {
        self.listeners.add(listener);
        self
    }

    /// Add a listener every future child gets.
    pub fn add_session_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.add(listener);
    }
}

impl SessionFactory for SimpleSessionFactory {
    fn build(&self, listener: &Session, _peer: SocketAddr) -> Option<Session> {
        let settings = listener.settings_snapshot();
        #[cfg(feature = "tls")]
        let child = match settings.tls.as_ref() {
            Some(TlsRole::Server { config }) => Session::tls_server(Arc::clone(config)),
            _ => Session::tcp(),
        };
        #[cfg(not(feature = "tls"))]
        let child = Session::tcp();

        let inherited = child.configure(|s| {
            s.recognizer = settings.recognizer;
            s.dispatcher = settings.dispatcher;
            s.generator = settings.generator;
            s.session_timeout = settings.session_timeout;
            s.log_exceptions = settings.log_exceptions;
            s.buffer_capacity_limit = settings.buffer_capacity_limit;
            s.statistics_enabled = settings.statistics_enabled;
        });
        if inherited.is_err() {
            return None;
        }
        for l in self.listeners.snapshot().iter() {
            child.add_session_listener(Arc::clone(l));
        }
        Some(child)
    }
}

pub(crate) struct Acceptor {
    factory: Mutex<Arc<dyn SessionFactory>>,
    children: Mutex<HashMap<u64, Session>>,
    close_children_on_close: AtomicBool,
}

impl Default for Acceptor {
    fn default() -> Self {
        Self {
            factory: Mutex::new(Arc::new(SimpleSessionFactory::new())),
            children: Mutex::new(HashMap::new()),
            close_children_on_close: AtomicBool::new(false),
        }
    }
}

/// Drops a child from its listener's map once it closes.
struct ChildTracker {
    listener: WeakSession,
}

impl SessionListener for ChildTracker {
    fn session_closed(&self, session: &Session) -> anyhow::Result<()> {
        if let Some(listener) = self.listener.upgrade() {
            if let Some(acceptor) = listener.inner.acceptor.as_ref() {
                acceptor.children.lock().remove(&session.id());
            }
        }
        Ok(())
    }
}

impl Session {
    fn acceptor(&self) -> Result<&Acceptor> {
        self.inner
            .acceptor
            .as_ref()
            .ok_or(SessionError::Unsupported("not a listening session"))
    }

    /// Replace the factory building child sessions. Listener sessions only.
    pub fn set_session_factory(&self, factory: Arc<dyn SessionFactory>) -> Result<()> {
        let acceptor = self.acceptor()?;
        self.configure(|_| ())?;
        *acceptor.factory.lock() = factory;
        Ok(())
    }

    /// Close every child when the listener closes. Listener sessions only.
    pub fn set_close_children_on_close(&self, enabled: bool) -> Result<()> {
        self.acceptor()?
            .close_children_on_close
            .store(enabled, Ordering::Release);
        Ok(())
    }

    /// Children accepted by this listener that are still open.
    pub fn connected_sessions(&self) -> Vec<Session> {
        self.inner
            .acceptor
            .as_ref()
            .map(|a| a.children.lock().values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn accept_children(&self, accepted: Vec<(TcpStream, SocketAddr)>) {
        let Some(acceptor) = self.inner.acceptor.as_ref() else {
            return;
        };
        for (stream, peer) in accepted {
            let factory = Arc::clone(&*acceptor.factory.lock());
            let Some(child) = factory.build(self, peer) else {
                debug!("Listener {} rejected connection from {}", self.id(), peer);
                transport::discard(stream);
                continue;
            };

            #[cfg(feature = "tls")]
            if child.kind() == SessionKind::Tls && child.tls_role().is_none() {
                if let Some(TlsRole::Server { config }) = self.tls_role() {
                    let _ = child.set_tls_server(config);
                }
            }

            if let Err(e) = child.adopt_stream(stream, peer) {
                warn!("Listener {} can't hand {} to session {}: {}", self.id(), peer, child.id(), e);
                self.dispatch_exception(e);
                continue;
            }
            child.add_session_listener(Arc::new(ChildTracker {
                listener: self.downgrade(),
            }));
            acceptor.children.lock().insert(child.id(), child.clone());
            debug!("Listener {} accepted {} as session {}", self.id(), peer, child.id());

            if let Err(e) = child.start(false) {
                acceptor.children.lock().remove(&child.id());
                self.dispatch_exception(e);
            }
        }
    }

    /// Called during listener teardown.
    pub(crate) fn on_listener_closed(&self) {
        let Some(acceptor) = self.inner.acceptor.as_ref() else {
            return;
        };
        if !acceptor.close_children_on_close.load(Ordering::Acquire) {
            return;
        }
        let children: Vec<Session> = acceptor.children.lock().drain().map(|(_, s)| s).collect();
        for child in children {
            child.close(false);
        }
    }
}
