//! The session: one logical connection or datagram endpoint.
//!
//! A [`Session`] is a cheap, cloneable handle. Its behavior is selected by
//! [`SessionKind`] at construction; every kind shares the same lifecycle,
//! configuration surface, write queue and listener fan-out:
//!
//! ```text
//! idle --start--> starting --(connected/bound)--> established
//!   ^                                                  |
//!   +-------------- closed <---- closing <---close-----+
//! ```
//!
//! Configuration setters only succeed before [`Session::start`]. Events are
//! delivered to [`SessionListener`]s through the session's [`Dispatcher`];
//! a failing listener is reported through `exception_caught` and never keeps
//! other listeners from seeing the event.

use crate::dispatcher::{Dispatcher, SimpleDispatcher, Task};
use crate::engine::Engine;
use crate::error::{Result, SessionError};
use crate::event::Command;
use crate::generator::EventGenerator;
use crate::listener::{ListenerSet, SessionListener};
use crate::message::MessageRef;
use crate::recognizer::{ByteArrayRecognizer, MessageRecognizer};
use crate::registry;
use crate::statistic::SessionStatistic;
use crate::write_queue::{PendingWrite, WriteQueue, WriteReceipt};
use crate::acceptor::Acceptor;
use crate::simulated::Simulated;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

#[cfg(feature = "tls")]
use crate::tls::TlsRole;

/// Transport and framing a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// TCP stream, outbound or accepted
    Tcp,
    /// UDP datagrams
    Udp,
    /// In-process loopback pipe
    Pipe,
    /// Passive TCP listener spawning child sessions
    Listener,
    /// TLS over TCP
    Tls,
    /// Multicast UDP driven by a dedicated worker thread
    Multicast,
}

/// Opaque application data attached to a session.
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// Configuration surface, frozen once the session starts.
#[derive(Clone)]
pub(crate) struct Settings {
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) session_timeout: Duration,
    pub(crate) buffer_capacity: usize,
    pub(crate) buffer_capacity_limit: usize,
    pub(crate) statistics_enabled: bool,
    pub(crate) log_exceptions: bool,
    pub(crate) recognizer: Arc<dyn MessageRecognizer>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) generator: EventGenerator,
    pub(crate) multicast_group: Option<IpAddr>,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<TlsRole>,
}

impl Settings {
    fn from_defaults() -> Self {
        let registry = registry::global();
        let defaults = registry.defaults();
        Self {
            local_addr: None,
            remote_addr: None,
            session_timeout: defaults.session_timeout,
            buffer_capacity: defaults.buffer_capacity,
            buffer_capacity_limit: defaults.buffer_capacity_limit,
            statistics_enabled: false,
            log_exceptions: defaults.log_exceptions,
            recognizer: Arc::new(ByteArrayRecognizer),
            dispatcher: Arc::new(SimpleDispatcher),
            generator: registry.shared_generator().clone(),
            multicast_group: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct Waiters {
    start: Vec<oneshot::Sender<bool>>,
    close: Vec<oneshot::Sender<()>>,
}

/// Addresses observed on the live transport.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BoundAddrs {
    pub(crate) local: Option<SocketAddr>,
    pub(crate) remote: Option<SocketAddr>,
}

pub(crate) struct SessionInner {
    pub(crate) id: u64,
    pub(crate) kind: SessionKind,
    pub(crate) settings: Mutex<Settings>,
    pub(crate) attachment: Mutex<Option<Attachment>>,
    pub(crate) started: AtomicBool,
    pub(crate) closing: AtomicBool,
    pub(crate) established: AtomicBool,
    pub(crate) handshake_completed: AtomicBool,
    pub(crate) listeners: ListenerSet<dyn SessionListener>,
    pub(crate) statistic: SessionStatistic,
    pub(crate) waiters: Mutex<Waiters>,
    pub(crate) writes: WriteQueue,
    pub(crate) engine: Mutex<Engine>,
    pub(crate) addrs: Mutex<BoundAddrs>,
    pub(crate) acceptor: Option<Acceptor>,
    pub(crate) simulated: Option<Simulated>,
}

/// Handle to a session. Clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

/// Non-owning session handle.
#[derive(Clone, Debug, Default)]
pub struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    /// Whether the session still exists.
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// Upgrade to a session handle.
    pub fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("started", &self.is_started())
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Session {}

/// Something for the session to report once its engine is unlocked.
#[derive(Debug)]
pub(crate) enum Notice {
    Established,
    Idle,
    Timeout,
    Received(MessageRef),
    Sent(MessageRef, Option<oneshot::Sender<bool>>),
    Exception(SessionError),
    StatReceived(u64),
    StatSent(u64),
}

/// Result of one engine step: notices to deliver, children accepted by a
/// listener, and whether the session must close.
#[derive(Default)]
pub(crate) struct Outcome {
    pub(crate) notices: Vec<Notice>,
    pub(crate) accepted: Vec<(mio::net::TcpStream, SocketAddr)>,
    pub(crate) close: bool,
}

impl Outcome {
    pub(crate) fn notify(&mut self, notice: Notice) {
        self.notices.push(notice);
    }

    pub(crate) fn exception(&mut self, cause: SessionError) {
        self.notices.push(Notice::Exception(cause));
    }

    /// Report `cause` and close the session.
    pub(crate) fn fail(&mut self, cause: SessionError) {
        self.exception(cause);
        self.close = true;
    }
}

#[derive(Debug)]
enum Event {
    Established,
    Closed,
    Idle,
    Timeout,
    Received(MessageRef),
    Sent(MessageRef),
}

impl Session {
    fn new(kind: SessionKind) -> Self {
        let id = registry::global().next_session_id();
        trace!("Created {:?} session {}", kind, id);
        Self {
            inner: Arc::new(SessionInner {
                id,
                kind,
                settings: Mutex::new(Settings::from_defaults()),
                attachment: Mutex::new(None),
                started: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                established: AtomicBool::new(false),
                handshake_completed: AtomicBool::new(false),
                listeners: ListenerSet::default(),
                statistic: SessionStatistic::default(),
                waiters: Mutex::new(Waiters::default()),
                writes: WriteQueue::default(),
                engine: Mutex::new(Engine::default()),
                addrs: Mutex::new(BoundAddrs::default()),
                acceptor: (kind == SessionKind::Listener).then(Acceptor::default),
                simulated: (kind == SessionKind::Multicast).then(Simulated::default),
            }),
        }
    }

    /// Outbound TCP session. Set the remote address before starting.
    pub fn tcp() -> Self {
        Self::new(SessionKind::Tcp)
    }

    /// UDP session. Binds the local address (any port if unset) and, if a
    /// remote address is set, connects to it.
    pub fn udp() -> Self {
        Self::new(SessionKind::Udp)
    }

    /// In-process loopback pipe: every write comes back as received data.
    #[cfg(unix)]
    pub fn pipe() -> Self {
        Self::new(SessionKind::Pipe)
    }

    /// Listening TCP session. Binds `0.0.0.0:0` unless a local address is
    /// set.
    pub fn listener() -> Self {
        Self::new(SessionKind::Listener)
    }

    /// Multicast session driven by its own worker thread.
    pub fn multicast() -> Self {
        Self::new(SessionKind::Multicast)
    }

    /// TLS session without a role; set one with [`set_tls_client`] or
    /// [`set_tls_server`] before starting.
    ///
    /// [`set_tls_client`]: Session::set_tls_client
    /// [`set_tls_server`]: Session::set_tls_server
    #[cfg(feature = "tls")]
    pub fn tls() -> Self {
        Self::new(SessionKind::Tls)
    }

    /// TLS client session.
    #[cfg(feature = "tls")]
    pub fn tls_client(
        config: Arc<rustls::ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> Self {
        let session = Self::tls();
        session.settings().tls = Some(TlsRole::Client { config, server_name });
        session
    }

    /// TLS server session, normally created by a listener for an accepted
    /// connection.
    #[cfg(feature = "tls")]
    pub fn tls_server(config: Arc<rustls::ServerConfig>) -> Self {
        let session = Self::tls();
        session.settings().tls = Some(TlsRole::Server { config });
        session
    }

    /// Process-unique session id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Session kind.
    pub fn kind(&self) -> SessionKind {
        self.inner.kind
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn settings(&self) -> MutexGuard<'_, Settings> {
        self.inner.settings.lock()
    }

    pub(crate) fn settings_snapshot(&self) -> Settings {
        self.settings().clone()
    }

    /// Apply a configuration change, refused once started.
    pub(crate) fn configure<R>(&self, change: impl FnOnce(&mut Settings) -> R) -> Result<R> {
        let mut settings = self.settings();
        if self.is_started() {
            return Err(SessionError::IllegalState("can't change settings after session started"));
        }
        Ok(change(&mut settings))
    }

    /// Local address: the bound one while established, else the configured
    /// one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let bound = self.inner.addrs.lock().local;
        bound
            .filter(|_| self.is_established())
            .or_else(|| self.settings().local_addr)
    }

    /// Remote address: the connected peer while established, else the
    /// configured one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        let bound = self.inner.addrs.lock().remote;
        bound
            .filter(|_| self.is_established())
            .or_else(|| self.settings().remote_addr)
    }

    /// Set the local address to bind.
    pub fn set_local_addr(&self, addr: SocketAddr) -> Result<()> {
        self.configure(|s| s.local_addr = Some(addr))
    }

    /// Set the remote address to connect to.
    pub fn set_remote_addr(&self, addr: SocketAddr) -> Result<()> {
        self.configure(|s| s.remote_addr = Some(addr))
    }

    /// Idle time after which `session_timeout` fires; zero disables it.
    pub fn session_timeout(&self) -> Duration {
        self.settings().session_timeout
    }

    /// Set the session timeout.
    pub fn set_session_timeout(&self, timeout: Duration) -> Result<()> {
        self.configure(|s| s.session_timeout = timeout)
    }

    /// Read buffer size at which the session is closed.
    pub fn buffer_capacity_limit(&self) -> usize {
        self.settings().buffer_capacity_limit
    }

    /// Set the read buffer limit in bytes.
    pub fn set_buffer_capacity_limit(&self, limit: usize) -> Result<()> {
        if limit == 0 {
            return Err(SessionError::IllegalArgument("buffer capacity limit must be positive"));
        }
        self.configure(|s| s.buffer_capacity_limit = limit)
    }

    /// Whether traffic statistics are collected.
    pub fn is_statistics_enabled(&self) -> bool {
        self.settings().statistics_enabled
    }

    /// Enable or disable traffic statistics.
    pub fn set_statistics_enabled(&self, enabled: bool) -> Result<()> {
        self.configure(|s| s.statistics_enabled = enabled)
    }

    /// Whether caught exceptions are logged before dispatch.
    pub fn is_log_exceptions(&self) -> bool {
        self.settings().log_exceptions
    }

    /// Log caught exceptions at error level.
    pub fn set_log_exceptions(&self, enabled: bool) -> Result<()> {
        self.configure(|s| s.log_exceptions = enabled)
    }

    /// Recognizer classifying received bytes.
    pub fn message_recognizer(&self) -> Arc<dyn MessageRecognizer> {
        Arc::clone(&self.settings().recognizer)
    }

    /// Set the message recognizer.
    pub fn set_message_recognizer(&self, recognizer: Arc<dyn MessageRecognizer>) -> Result<()> {
        self.configure(|s| s.recognizer = recognizer)
    }

    /// Dispatcher delivering listener callbacks.
    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        Arc::clone(&self.settings().dispatcher)
    }

    /// Set the dispatcher.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<()> {
        self.configure(|s| s.dispatcher = dispatcher)
    }

    /// Event generator driving this session.
    pub fn event_generator(&self) -> EventGenerator {
        self.settings().generator.clone()
    }

    /// Set the event generator.
    pub fn set_event_generator(&self, generator: EventGenerator) -> Result<()> {
        self.configure(|s| s.generator = generator)
    }

    /// Multicast group joined on start.
    pub fn multicast_group(&self) -> Option<IpAddr> {
        self.settings().multicast_group
    }

    /// Set the multicast group. Multicast sessions only.
    pub fn set_multicast_group(&self, group: IpAddr) -> Result<()> {
        if self.kind() != SessionKind::Multicast {
            return Err(SessionError::Unsupported("multicast group on a non-multicast session"));
        }
        if !group.is_multicast() {
            return Err(SessionError::IllegalArgument("not a multicast address"));
        }
        self.configure(|s| s.multicast_group = Some(group))
    }

    /// TLS role, if one is configured.
    #[cfg(feature = "tls")]
    pub fn tls_role(&self) -> Option<TlsRole> {
        self.settings().tls.clone()
    }

    /// Make this TLS session a client.
    #[cfg(feature = "tls")]
    pub fn set_tls_client(
        &self,
        config: Arc<rustls::ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> Result<()> {
        if self.kind() != SessionKind::Tls {
            return Err(SessionError::Unsupported("tls client config on a non-tls session"));
        }
        self.configure(|s| s.tls = Some(TlsRole::Client { config, server_name }))
    }

    /// Make this TLS session a server. On a listener, accepted children
    /// become TLS server sessions using this configuration.
    #[cfg(feature = "tls")]
    pub fn set_tls_server(&self, config: Arc<rustls::ServerConfig>) -> Result<()> {
        if !matches!(self.kind(), SessionKind::Tls | SessionKind::Listener) {
            return Err(SessionError::Unsupported("tls server config on this session kind"));
        }
        self.configure(|s| s.tls = Some(TlsRole::Server { config }))
    }

    /// Attached application data.
    pub fn attachment(&self) -> Option<Attachment> {
        self.inner.attachment.lock().clone()
    }

    /// Attach application data; allowed at any time.
    pub fn set_attachment(&self, attachment: Option<Attachment>) {
        *self.inner.attachment.lock() = attachment;
    }

    /// Register a listener.
    pub fn add_session_listener(&self, listener: Arc<dyn SessionListener>) {
        self.inner.listeners.add(listener);
    }

    /// Remove a listener. Safe to call from inside a callback.
    pub fn remove_session_listener(&self, listener: &Arc<dyn SessionListener>) {
        self.inner.listeners.remove(listener);
    }

    /// Traffic statistics, when enabled.
    pub fn statistic(&self) -> Option<&SessionStatistic> {
        self.is_statistics_enabled().then_some(&self.inner.statistic)
    }

    /// Started and not yet torn down.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Between `close` and teardown.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Started and not closing; writes are accepted.
    pub fn is_available(&self) -> bool {
        self.is_started() && !self.is_closing()
    }

    /// Connected (or bound) and ready for I/O.
    pub fn is_established(&self) -> bool {
        self.inner.established.load(Ordering::Acquire)
    }

    /// Whether the TLS handshake has completed. Always `false` for non-TLS
    /// sessions.
    pub fn is_handshake_completed(&self) -> bool {
        self.inner.handshake_completed.load(Ordering::Acquire)
    }

    /// Application writes waiting to be sent.
    pub fn write_queue_size(&self) -> usize {
        self.inner.writes.len()
    }

    /// Whether the caller runs on the thread driving this session's I/O.
    pub(crate) fn on_driver_thread(&self) -> bool {
        match self.kind() {
            SessionKind::Multicast => self.on_simulated_worker(),
            _ => self.event_generator().is_generator_thread(),
        }
    }

    /// Start the session.
    ///
    /// Fails with `IllegalState` if already started or if required
    /// configuration is missing. If opening the transport fails, an
    /// exception and then `session_closed` are dispatched instead.
    ///
    /// With `block`, waits until the session is established or has failed,
    /// unless called from the thread driving the session.
    pub fn start(&self, block: bool) -> Result<()> {
        {
            let _settings = self.settings();
            if self
                .inner
                .started
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(SessionError::IllegalState("session already started"));
            }
        }
        self.inner.closing.store(false, Ordering::Release);

        if let Err(e) = self.validate_start() {
            self.inner.started.store(false, Ordering::Release);
            return Err(e);
        }

        let waiter = if block && !self.on_driver_thread() {
            self.start_waiter()
        } else {
            None
        };

        debug!("Starting {:?} session {}", self.kind(), self.id());
        let launched = match self.kind() {
            SessionKind::Multicast => self.start_simulated(),
            _ => self.start_channel(),
        };
        if let Err(e) = launched {
            self.dispatch_exception(e);
            self.finish_teardown();
        }

        if let Some(waiter) = waiter {
            let _ = waiter.blocking_recv();
        }
        Ok(())
    }

    fn validate_start(&self) -> Result<()> {
        if !matches!(self.kind(), SessionKind::Tcp | SessionKind::Tls) {
            return Ok(());
        }
        let has_remote = self.settings().remote_addr.is_some();
        if !has_remote && !self.inner.engine.lock().has_adopted() {
            return Err(SessionError::IllegalState("remote address not set"));
        }
        #[cfg(feature = "tls")]
        if self.kind() == SessionKind::Tls && self.settings().tls.is_none() {
            return Err(SessionError::IllegalState("tls config not set"));
        }
        Ok(())
    }

    fn start_channel(&self) -> Result<()> {
        let settings = self.settings_snapshot();
        self.inner.engine.lock().open(self.kind(), &settings)?;
        if self.kind() == SessionKind::Tls {
            self.inner.writes.hold();
        }
        if let Err(e) = settings.generator.register(self, Command::Register) {
            self.inner.engine.lock().release(None);
            return Err(e);
        }
        Ok(())
    }

    fn start_waiter(&self) -> Option<oneshot::Receiver<bool>> {
        let mut waiters = self.inner.waiters.lock();
        if !self.is_started() || self.is_established() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        waiters.start.push(tx);
        Some(rx)
    }

    fn close_waiter(&self) -> Option<oneshot::Receiver<()>> {
        let mut waiters = self.inner.waiters.lock();
        if !self.is_started() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        waiters.close.push(tx);
        Some(rx)
    }

    /// Close the session. Idempotent.
    ///
    /// With `block`, waits for teardown to finish unless called from the
    /// thread driving the session.
    pub fn close(&self, block: bool) {
        if !self.is_started() {
            return;
        }
        let first = !self.inner.closing.swap(true, Ordering::AcqRel);
        let waiter = if block && !self.on_driver_thread() {
            self.close_waiter()
        } else {
            None
        };

        if first {
            debug!("Closing session {}", self.id());
            match self.kind() {
                SessionKind::Multicast => self.close_simulated(),
                _ => {
                    if let Err(e) = self.event_generator().register(self, Command::Unregister) {
                        error!("Failed to unregister session {}: {}", self.id(), e);
                        self.inner.engine.lock().release(None);
                        self.finish_teardown();
                    }
                }
            }
        }

        if let Some(waiter) = waiter {
            let _ = waiter.blocking_recv();
        }
    }

    /// Mark established and release blocked starters.
    pub(crate) fn mark_established(&self) {
        let waiters = {
            let mut waiters = self.inner.waiters.lock();
            self.inner.established.store(true, Ordering::Release);
            std::mem::take(&mut waiters.start)
        };
        for waiter in waiters {
            let _ = waiter.send(true);
        }
    }

    /// Final teardown shared by every kind: discard queued writes, reset
    /// state, wake waiters and dispatch `session_closed`.
    pub(crate) fn finish_teardown(&self) {
        let (start_waiters, close_waiters) = {
            let mut waiters = self.inner.waiters.lock();
            if !self.inner.started.swap(false, Ordering::AcqRel) {
                return;
            }
            self.inner.closing.store(false, Ordering::Release);
            self.inner.established.store(false, Ordering::Release);
            self.inner.handshake_completed.store(false, Ordering::Release);
            (
                std::mem::take(&mut waiters.start),
                std::mem::take(&mut waiters.close),
            )
        };

        for receipt in self.inner.writes.clear() {
            let _ = receipt.send(false);
        }
        self.inner.statistic.stop();
        for waiter in start_waiters {
            let _ = waiter.send(false);
        }
        if self.inner.acceptor.is_some() {
            self.on_listener_closed();
        }

        debug!("Session {} closed", self.id());
        self.dispatch_event(Event::Closed);
        for waiter in close_waiters {
            let _ = waiter.send(());
        }
    }

    fn check_writable(&self, message: &MessageRef) -> Result<()> {
        if self.kind() == SessionKind::Listener {
            return Err(SessionError::Unsupported("can't write to a listening session"));
        }
        if !self.is_available() {
            return Err(SessionError::IllegalState("session is not available"));
        }
        if matches!(self.kind(), SessionKind::Udp | SessionKind::Multicast)
            && self.settings().remote_addr.is_none()
            && message.peer_addr().is_none()
        {
            return Err(SessionError::IllegalArgument(
                "can't send a datagram without a destination address",
            ));
        }
        Ok(())
    }

    fn enqueue(&self, message: MessageRef, receipt: Option<oneshot::Sender<bool>>) -> Result<()> {
        self.check_writable(&message)?;
        trace!("Session {} write {:?}", self.id(), message);
        let needs_enable = self.inner.writes.push(PendingWrite::message(message, receipt));
        if needs_enable && self.kind() != SessionKind::Multicast {
            self.event_generator().register(self, Command::EnableWrite)?;
        }
        Ok(())
    }

    /// Queue a message. `message_sent` fires once it is written.
    pub fn write(&self, message: MessageRef) -> Result<()> {
        self.enqueue(message, None)
    }

    /// Queue a message and get a receipt for its completion.
    pub fn write_with_receipt(&self, message: MessageRef) -> Result<WriteReceipt> {
        let (tx, receipt) = WriteReceipt::channel();
        self.enqueue(message, Some(tx))?;
        Ok(receipt)
    }

    /// Write and wait for completion. Returns whether the message was sent.
    ///
    /// On the thread driving the session the queue is drained in place
    /// instead of waiting; an I/O error there closes the session and
    /// returns `false`. Must not be called from within an async runtime.
    pub fn block_write(&self, message: MessageRef) -> Result<bool> {
        if self.kind() == SessionKind::Tls && !self.is_handshake_completed() {
            return Err(SessionError::IllegalState("can't block write until handshake completed"));
        }
        if self.is_engine_busy() {
            return Err(SessionError::IllegalState("can't block write during message recognition"));
        }
        let mut receipt = self.write_with_receipt(message)?;
        if !self.on_driver_thread() {
            return Ok(receipt.wait());
        }
        Ok(match self.kind() {
            SessionKind::Multicast => self.send_inline(&mut receipt),
            _ => self.drive_writes(&mut receipt),
        })
    }

    /// Start a new TLS key exchange on an established session.
    ///
    /// Does nothing until the first handshake has completed. Queued
    /// application data is unaffected.
    #[cfg(feature = "tls")]
    pub fn handshake(&self) -> Result<()> {
        if self.kind() != SessionKind::Tls {
            return Err(SessionError::Unsupported("handshake on a non-tls session"));
        }
        if !self.is_handshake_completed() {
            return Ok(());
        }
        if self.is_engine_busy() {
            return Err(SessionError::IllegalState("can't handshake during message recognition"));
        }
        if !self.inner.engine.lock().refresh_tls_keys()? {
            return Ok(());
        }
        if self.inner.writes.push_handshake_flush() {
            self.event_generator().register(self, Command::EnableWrite)?;
        }
        Ok(())
    }

    /// Run a task through this session's dispatcher.
    pub(crate) fn dispatch_task(&self, task: Task) {
        let dispatcher = self.dispatcher();
        dispatcher.dispatch(self, task);
    }

    /// Deliver everything an engine step produced, then close if asked.
    pub(crate) fn complete(&self, outcome: Outcome) {
        for notice in outcome.notices {
            self.fire(notice);
        }
        if !outcome.accepted.is_empty() {
            self.accept_children(outcome.accepted);
        }
        if outcome.close {
            self.close(false);
        }
    }

    pub(crate) fn fire(&self, notice: Notice) {
        match notice {
            Notice::Established => {
                self.mark_established();
                self.dispatch_event(Event::Established);
            }
            Notice::Idle => self.dispatch_event(Event::Idle),
            Notice::Timeout => self.dispatch_event(Event::Timeout),
            Notice::Received(message) => self.dispatch_event(Event::Received(message)),
            Notice::Sent(message, receipt) => {
                self.dispatch_event(Event::Sent(message));
                if let Some(receipt) = receipt {
                    let _ = receipt.send(true);
                }
            }
            Notice::Exception(cause) => self.dispatch_exception(cause),
            Notice::StatReceived(bytes) => self.inner.statistic.record_received(self, bytes),
            Notice::StatSent(bytes) => self.inner.statistic.record_sent(self, bytes),
        }
    }

    fn dispatch_event(&self, event: Event) {
        trace!("Session {} {:?}", self.id(), event);
        let session = self.clone();
        self.dispatch_task(Box::new(move || session.notify_listeners(&event)));
    }

    fn notify_listeners(&self, event: &Event) {
        for listener in self.inner.listeners.snapshot().iter() {
            let result = catch_unwind(AssertUnwindSafe(|| match event {
                Event::Established => listener.session_established(self),
                Event::Closed => listener.session_closed(self),
                Event::Idle => listener.session_idle(self),
                Event::Timeout => listener.session_timeout(self),
                Event::Received(message) => listener.message_received(self, message),
                Event::Sent(message) => listener.message_sent(self, message),
            }));
            let failure = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => anyhow::anyhow!("listener panicked: {}", panic_message(panic.as_ref())),
            };
            self.dispatch_exception(SessionError::Listener(failure));
        }
    }

    /// Deliver `cause` to every listener's `exception_caught`.
    pub(crate) fn dispatch_exception(&self, cause: SessionError) {
        let log = self.is_log_exceptions();
        if log {
            error!("Session {} caught exception: {}", self.id(), cause);
        } else {
            debug!("Session {} caught exception: {}", self.id(), cause);
        }
        let session = self.clone();
        self.dispatch_task(Box::new(move || {
            for listener in session.inner.listeners.snapshot().iter() {
                let result = catch_unwind(AssertUnwindSafe(|| listener.exception_caught(&session, &cause)));
                let failure = match result {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e.to_string(),
                    Err(panic) => panic_message(panic.as_ref()).to_string(),
                };
                if log {
                    warn!("Session {} exception listener failed: {}", session.id(), failure);
                }
            }
        }));
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
