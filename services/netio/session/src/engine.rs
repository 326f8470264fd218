//! Per-session I/O engine run by the event generator.
//!
//! Handlers execute on the generator thread with the engine locked. They
//! never call listeners directly: everything to report is collected in an
//! [`Outcome`] and delivered by [`Session::complete`] once the lock is
//! released, so listeners are free to write, close or block-write.

use crate::error::{Result, SessionError};
use crate::event::{IoEvent, IoPhase};
use crate::message::MessageRef;
use crate::recognizer::{ByteArrayRecognizer, MessageRecognizer};
use crate::session::{panic_message, BoundAddrs, Notice, Outcome, Session, SessionKind, Settings};
use crate::transport::Transport;
use crate::write_queue::{PendingWrite, WriteReceipt};
use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use netio_util::buffer;
use std::cell::Cell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

#[cfg(feature = "tls")]
use crate::tls::{TlsRole, TlsState};

/// Largest UDP payload.
pub(crate) const MAX_DATAGRAM: usize = 64 * 1024;

/// Pause between in-place write attempts of a blocking write on the
/// generator thread.
const BLOCK_WRITE_BACKOFF: Duration = Duration::from_millis(10);

thread_local! {
    static BUSY_SESSION: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Marks the session whose engine this thread holds.
struct BusyGuard {
    previous: Option<u64>,
}

impl BusyGuard {
    fn enter(session_id: u64) -> Self {
        Self {
            previous: BUSY_SESSION.with(|busy| busy.replace(Some(session_id))),
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        BUSY_SESSION.with(|busy| busy.set(self.previous));
    }
}

pub(crate) struct Engine {
    transport: Option<Transport>,
    adopted: Option<TcpStream>,
    token: Option<Token>,
    interest: Option<Interest>,
    phase: IoPhase,
    read_buf: BytesMut,
    scratch: Vec<u8>,
    idle: Duration,
    buffer_capacity: usize,
    buffer_limit: usize,
    session_timeout: Duration,
    statistics: bool,
    recognizer: Arc<dyn MessageRecognizer>,
    #[cfg(feature = "tls")]
    tls_role: Option<TlsRole>,
    #[cfg(feature = "tls")]
    tls: Option<TlsState>,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            transport: None,
            adopted: None,
            token: None,
            interest: None,
            phase: IoPhase::Open,
            read_buf: BytesMut::new(),
            scratch: Vec::new(),
            idle: Duration::ZERO,
            buffer_capacity: 0,
            buffer_limit: 0,
            session_timeout: Duration::ZERO,
            statistics: false,
            recognizer: Arc::new(ByteArrayRecognizer),
            #[cfg(feature = "tls")]
            tls_role: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl Engine {
    /// Open the transport for `kind`, taking the tunables from `settings`.
    pub(crate) fn open(&mut self, kind: SessionKind, settings: &Settings) -> Result<()> {
        let (transport, phase) = match kind {
            SessionKind::Tcp | SessionKind::Tls => match self.adopted.take() {
                Some(stream) => (Transport::adopt(stream), IoPhase::Open),
                None => {
                    let remote = settings
                        .remote_addr
                        .ok_or(SessionError::IllegalState("remote address not set"))?;
                    (Transport::connect(settings.local_addr, remote)?, IoPhase::Connecting)
                }
            },
            SessionKind::Udp => (
                Transport::bind_udp(settings.local_addr, settings.remote_addr)?,
                IoPhase::Open,
            ),
            #[cfg(unix)]
            SessionKind::Pipe => (Transport::pipe()?, IoPhase::Open),
            #[cfg(not(unix))]
            SessionKind::Pipe => return Err(SessionError::Unsupported("pipe sessions need a unix platform")),
            SessionKind::Listener => (Transport::listen(settings.local_addr)?, IoPhase::Listening),
            SessionKind::Multicast => {
                return Err(SessionError::Unsupported("multicast sessions have their own worker"))
            }
        };

        self.transport = Some(transport);
        self.phase = phase;
        self.idle = Duration::ZERO;
        self.buffer_capacity = settings.buffer_capacity.max(1);
        self.buffer_limit = settings.buffer_capacity_limit;
        self.session_timeout = settings.session_timeout;
        self.statistics = settings.statistics_enabled;
        self.recognizer = Arc::clone(&settings.recognizer);
        #[cfg(feature = "tls")]
        {
            self.tls_role = settings.tls.clone();
        }
        Ok(())
    }

    pub(crate) fn has_adopted(&self) -> bool {
        self.adopted.is_some()
    }

    /// Drop the transport and reset all per-connection state. A TLS
    /// `close_notify` is sent on a best-effort basis first.
    pub(crate) fn release(&mut self, registry: Option<&Registry>) {
        #[cfg(feature = "tls")]
        if let (Some(tls), Some(transport)) = (self.tls.as_mut(), self.transport.as_mut()) {
            let alert = tls.close_notify();
            if !alert.is_empty() {
                let _ = transport.write_vectored(&[io::IoSlice::new(&alert)]);
            }
        }
        if let Some(mut transport) = self.transport.take() {
            if let (Some(registry), Some(_)) = (registry, self.token) {
                if let Err(e) = transport.deregister(registry) {
                    debug!("Failed to deregister transport: {}", e);
                }
            }
        }
        self.token = None;
        self.interest = None;
        self.phase = IoPhase::Open;
        self.read_buf = BytesMut::new();
        self.scratch = Vec::new();
        self.idle = Duration::ZERO;
        #[cfg(feature = "tls")]
        {
            self.tls = None;
        }
    }

    /// Start a TLS key update. `false` if there is no TLS connection.
    #[cfg(feature = "tls")]
    pub(crate) fn refresh_tls_keys(&mut self) -> Result<bool> {
        match self.tls.as_mut() {
            Some(tls) => {
                tls.refresh_keys()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn wanted_interest(&self, writes_pending: bool) -> Interest {
        match self.phase {
            IoPhase::Listening => Interest::READABLE,
            IoPhase::Connecting => Interest::READABLE | Interest::WRITABLE,
            IoPhase::Open if writes_pending => Interest::READABLE | Interest::WRITABLE,
            IoPhase::Open => Interest::READABLE,
        }
    }

    /// Produce the bytes for the write at the head of the queue.
    ///
    /// A panicking message surfaces as [`Encoding::Rejected`]; the caller
    /// drops that write and keeps the session.
    fn encode(&mut self, write: &PendingWrite) -> Encoding {
        let segments = match write.message.as_ref() {
            Some(message) => match guarded("message encoding", || message.to_segments()) {
                Ok(segments) => Some(segments),
                Err(e) => return Encoding::Rejected(e),
            },
            None => None,
        };
        #[cfg(feature = "tls")]
        if let Some(tls) = self.tls.as_mut() {
            let encoded = match segments {
                Some(segments) => tls.encode(&segments),
                None => tls.flush(),
            };
            return match encoded {
                Ok(records) => Encoding::Ready(records),
                Err(e) => Encoding::Failed(e),
            };
        }
        Encoding::Ready(segments.map(|s| s.into_iter().collect()).unwrap_or_default())
    }
}

/// Result of encoding the head of the write queue.
enum Encoding {
    Ready(VecDeque<Bytes>),
    /// The message itself could not be encoded
    Rejected(SessionError),
    /// The session's TLS state broke
    #[cfg_attr(not(feature = "tls"), allow(dead_code))]
    Failed(SessionError),
}

/// Run user-supplied recognizer or message code on the generator thread.
/// A panic becomes a recognizer error instead of unwinding the loop.
pub(crate) fn guarded<R>(what: &str, f: impl FnOnce() -> R) -> Result<R> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|panic| {
        SessionError::Recognizer(anyhow::anyhow!(
            "{} panicked: {}",
            what,
            panic_message(panic.as_ref())
        ))
    })
}

impl Session {
    /// Whether this thread is inside an engine handler of this session.
    pub(crate) fn is_engine_busy(&self) -> bool {
        BUSY_SESSION.with(|busy| busy.get() == Some(self.id()))
    }

    /// Run one engine step and deliver what it produced.
    fn step(&self, handler: impl FnOnce(&Self, &mut Engine, &mut Outcome)) {
        let mut outcome = Outcome::default();
        {
            let mut engine = self.inner.engine.lock();
            let _busy = BusyGuard::enter(self.id());
            handler(self, &mut *engine, &mut outcome);
        }
        self.complete(outcome);
    }

    pub(crate) fn io_phase(&self) -> IoPhase {
        self.inner.engine.lock().phase
    }

    /// Hand an accepted stream to this session; `start` then skips the
    /// connect.
    pub(crate) fn adopt_stream(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if !matches!(self.kind(), SessionKind::Tcp | SessionKind::Tls) {
            return Err(SessionError::Unsupported("only stream sessions can adopt a connection"));
        }
        self.configure(|s| s.remote_addr = Some(peer))?;
        self.inner.engine.lock().adopted = Some(stream);
        Ok(())
    }

    pub(crate) fn on_register(&self, registry: &Registry, token: Token) {
        self.step(|session, engine, out| {
            let interest = engine.wanted_interest(false);
            let Some(transport) = engine.transport.as_mut() else {
                return;
            };
            if let Err(e) = transport.register(registry, token, interest) {
                out.fail(e.into());
                return;
            }
            engine.token = Some(token);
            engine.interest = Some(interest);
            trace!("Session {} registered as {:?} in {:?}", session.id(), token, engine.phase);
            if engine.phase != IoPhase::Connecting {
                session.establish(engine, registry, out);
            }
        });
    }

    pub(crate) fn on_unregister(&self, registry: &Registry) {
        {
            let mut engine = self.inner.engine.lock();
            let _busy = BusyGuard::enter(self.id());
            engine.release(Some(registry));
        }
        self.finish_teardown();
    }

    pub(crate) fn on_enable_write(&self, registry: &Registry) {
        self.step(|session, engine, out| {
            if engine.transport.is_none() || engine.phase != IoPhase::Open {
                return;
            }
            session.drain_writes(engine, out);
            session.sync_interest(engine, registry, out);
        });
    }

    pub(crate) fn on_io_event(&self, registry: &Registry, event: IoEvent) {
        self.step(|session, engine, out| {
            if engine.transport.is_none() {
                return;
            }
            match event {
                IoEvent::Acceptable => session.accept_ready(engine, out),
                IoEvent::Connectable => session.connect_ready(engine, registry, out),
                IoEvent::Readable => {
                    session.read_ready(engine, out);
                    if !out.close {
                        session.drain_writes(engine, out);
                        session.sync_interest(engine, registry, out);
                    }
                }
                IoEvent::Writable => {
                    session.drain_writes(engine, out);
                    session.sync_interest(engine, registry, out);
                }
                IoEvent::CheckTimeout(elapsed) => session.check_timeout(engine, elapsed, out),
                IoEvent::Activity => engine.idle = Duration::ZERO,
            }
        });
    }

    /// Transport is ready: cache addresses, set up buffers and TLS, report
    /// `Established` and pick up anything already waiting.
    fn establish(&self, engine: &mut Engine, registry: &Registry, out: &mut Outcome) {
        if let Some(transport) = engine.transport.as_ref() {
            *self.inner.addrs.lock() = BoundAddrs {
                local: transport.local_addr(),
                remote: transport.peer_addr(),
            };
        }
        engine.read_buf = buffer::allocate(engine.buffer_capacity);
        engine.idle = Duration::ZERO;
        self.inner.established.store(true, Ordering::Release);
        if engine.statistics {
            self.inner.statistic.start();
        }
        debug!("Session {} established", self.id());
        out.notify(Notice::Established);

        #[cfg(feature = "tls")]
        if self.kind() == SessionKind::Tls {
            let state = match engine.tls_role.as_ref() {
                Some(role) => TlsState::new(role),
                None => Err(SessionError::IllegalState("tls config not set")),
            };
            match state {
                Ok(tls) => {
                    if tls.wants_write() {
                        self.inner.writes.push_handshake_flush();
                    }
                    engine.tls = Some(tls);
                }
                Err(e) => {
                    out.fail(e);
                    return;
                }
            }
        }

        if engine.phase == IoPhase::Open {
            // Data may have arrived while connecting; the edge is gone.
            self.read_ready(engine, out);
            if out.close {
                return;
            }
            self.drain_writes(engine, out);
        }
        self.sync_interest(engine, registry, out);
    }

    fn connect_ready(&self, engine: &mut Engine, registry: &Registry, out: &mut Outcome) {
        let Some(transport) = engine.transport.as_mut() else {
            return;
        };
        match transport.finish_connect() {
            Ok(true) => {
                engine.phase = IoPhase::Open;
                self.establish(engine, registry, out);
            }
            Ok(false) => {}
            Err(e) => out.fail(e.into()),
        }
    }

    fn accept_ready(&self, engine: &mut Engine, out: &mut Outcome) {
        let Some(transport) = engine.transport.as_mut() else {
            return;
        };
        loop {
            match transport.accept() {
                Ok((stream, peer)) => {
                    trace!("Session {} accepted {}", self.id(), peer);
                    out.accepted.push((stream, peer));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    out.exception(e.into());
                    break;
                }
            }
        }
    }

    fn read_ready(&self, engine: &mut Engine, out: &mut Outcome) {
        match engine.transport.as_ref() {
            Some(transport) if transport.is_packet() => self.read_datagrams(engine, out),
            Some(_) => self.read_stream(engine, out),
            None => {}
        }
    }

    fn read_stream(&self, engine: &mut Engine, out: &mut Outcome) {
        loop {
            let room = engine.buffer_limit.saturating_sub(engine.read_buf.len());
            if room == 0 {
                self.exhausted(engine, out);
                return;
            }
            let want = engine.buffer_capacity.min(room);
            if engine.scratch.len() < want {
                engine.scratch.resize(want, 0);
            }
            let Some(transport) = engine.transport.as_mut() else {
                return;
            };
            let n = match transport.read(&mut engine.scratch[..want]) {
                Ok(0) => {
                    trace!("Session {} reached end of stream", self.id());
                    out.close = true;
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    out.fail(e.into());
                    return;
                }
            };
            engine.idle = Duration::ZERO;
            if engine.statistics {
                out.notify(Notice::StatReceived(n as u64));
            }
            if !self.absorb(engine, n, out) {
                return;
            }
            if engine.read_buf.len() >= engine.buffer_limit {
                self.exhausted(engine, out);
                return;
            }
        }
    }

    /// Move `n` freshly read bytes into the read buffer and recognize.
    /// Returns `false` when reading has to stop.
    fn absorb(&self, engine: &mut Engine, n: usize, out: &mut Outcome) -> bool {
        #[cfg(feature = "tls")]
        if let Some(tls) = engine.tls.as_mut() {
            let progress = match tls.feed(&engine.scratch[..n], &mut engine.read_buf) {
                Ok(progress) => progress,
                Err(e) => {
                    out.fail(e);
                    return false;
                }
            };
            if progress.wants_write {
                self.inner.writes.push_handshake_flush();
            }
            if progress.handshake_completed {
                debug!("Session {} completed TLS handshake", self.id());
                self.inner.handshake_completed.store(true, Ordering::Release);
                self.inner.writes.release_held();
            }
            self.recognize_stream(engine, out);
            if progress.peer_closed {
                out.close = true;
                return false;
            }
            return true;
        }

        engine.read_buf.extend_from_slice(&engine.scratch[..n]);
        self.recognize_stream(engine, out);
        true
    }

    fn exhausted(&self, engine: &mut Engine, out: &mut Outcome) {
        out.fail(SessionError::ResourceExhausted {
            buffered: engine.read_buf.len(),
            limit: engine.buffer_limit,
        });
        engine.read_buf.clear();
    }

    /// Turn buffered bytes into messages until the recognizer needs more.
    fn recognize_stream(&self, engine: &mut Engine, out: &mut Outcome) {
        while !engine.read_buf.is_empty() {
            let recognized = guarded("recognizer", || {
                engine.recognizer.recognize(self, &engine.read_buf)
            });
            let mut message = match recognized {
                Ok(Ok(Some(message))) => message,
                Ok(Ok(None)) => return,
                Ok(Err(e)) => {
                    out.exception(SessionError::Recognizer(e));
                    return;
                }
                Err(e) => {
                    // The same bytes would fail again on the next read.
                    engine.read_buf.clear();
                    out.exception(e);
                    return;
                }
            };
            let before = engine.read_buf.len();
            match guarded("message decoding", || message.read_from(&mut engine.read_buf)) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    engine.read_buf.clear();
                    out.exception(e);
                    return;
                }
            }
            out.notify(Notice::Received(MessageRef::from(message)));
            if engine.read_buf.len() == before {
                return;
            }
        }
    }

    fn read_datagrams(&self, engine: &mut Engine, out: &mut Outcome) {
        if engine.scratch.len() < MAX_DATAGRAM {
            engine.scratch.resize(MAX_DATAGRAM, 0);
        }
        loop {
            let Some(transport) = engine.transport.as_mut() else {
                return;
            };
            let (n, peer) = match transport.recv_from(&mut engine.scratch) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    out.fail(e.into());
                    return;
                }
            };
            engine.idle = Duration::ZERO;
            if engine.statistics {
                out.notify(Notice::StatReceived(n as u64));
            }
            match self.recognize_datagram(engine.recognizer.as_ref(), &engine.scratch[..n], peer) {
                Ok(Some(message)) => out.notify(Notice::Received(message)),
                Ok(None) => {}
                Err(e) => out.exception(e),
            }
        }
    }

    /// Recognize one datagram as one message stamped with its source.
    pub(crate) fn recognize_datagram(
        &self,
        recognizer: &dyn MessageRecognizer,
        data: &[u8],
        peer: SocketAddr,
    ) -> Result<Option<MessageRef>> {
        let mut buf = BytesMut::from(data);
        let Some(mut message) = guarded("recognizer", || recognizer.recognize(self, &buf))?
            .map_err(SessionError::Recognizer)?
        else {
            return Ok(None);
        };
        if !guarded("message decoding", || message.read_from(&mut buf))? {
            trace!("Session {} dropped an incomplete datagram from {}", self.id(), peer);
            return Ok(None);
        }
        message.set_peer_addr(peer);
        Ok(Some(MessageRef::from(message)))
    }

    /// Write queued messages until the queue is empty or the transport
    /// would block.
    fn drain_writes(&self, engine: &mut Engine, out: &mut Outcome) {
        if engine.phase != IoPhase::Open || engine.transport.is_none() {
            return;
        }
        let mut wrote = false;
        loop {
            let mut queue = self.inner.writes.lock();
            let Some(head) = queue.items.front_mut() else {
                break;
            };
            if head.segments.is_none() {
                match engine.encode(head) {
                    Encoding::Ready(segments) => head.segments = Some(segments),
                    Encoding::Rejected(e) => {
                        let rejected = queue.items.pop_front();
                        drop(queue);
                        if let Some(tx) = rejected.and_then(|w| w.receipt) {
                            let _ = tx.send(false);
                        }
                        out.exception(e);
                        continue;
                    }
                    Encoding::Failed(e) => {
                        drop(queue);
                        out.fail(e);
                        return;
                    }
                }
            }
            let target = head.message.as_ref().and_then(|m| m.peer_addr());
            let (Some(transport), Some(segments)) = (engine.transport.as_mut(), head.segments.as_mut()) else {
                return;
            };
            let done = match write_segments(transport, segments, target, engine.statistics, out) {
                Ok(done) => done,
                Err(e) => {
                    drop(queue);
                    out.fail(e.into());
                    return;
                }
            };
            if !done {
                break;
            }
            let finished = queue.items.pop_front();
            drop(queue);
            if let Some(PendingWrite {
                message: Some(message),
                receipt,
                ..
            }) = finished
            {
                engine.idle = Duration::ZERO;
                wrote = true;
                out.notify(Notice::Sent(message, receipt));
            }
        }
        if wrote && self.inner.writes.is_idle() {
            out.notify(Notice::Idle);
        }
    }

    fn sync_interest(&self, engine: &mut Engine, registry: &Registry, out: &mut Outcome) {
        let Some(token) = engine.token else {
            return;
        };
        let wanted = engine.wanted_interest(self.inner.writes.has_items());
        if engine.interest == Some(wanted) {
            return;
        }
        let Some(transport) = engine.transport.as_mut() else {
            return;
        };
        match transport.reregister(registry, token, wanted) {
            Ok(()) => engine.interest = Some(wanted),
            Err(e) => out.fail(e.into()),
        }
    }

    fn check_timeout(&self, engine: &mut Engine, elapsed: Duration, out: &mut Outcome) {
        if !self.is_established() {
            return;
        }
        if !engine.session_timeout.is_zero() {
            engine.idle += elapsed;
            if engine.idle >= engine.session_timeout {
                debug!("Session {} idle for {:?}, timing out", self.id(), engine.idle);
                engine.idle = Duration::ZERO;
                out.notify(Notice::Timeout);
            }
        }
        if self.inner.writes.is_idle() {
            out.notify(Notice::Idle);
        }
    }

    /// Drain the queue in place until `receipt` resolves. Used by a
    /// blocking write issued on the generator thread.
    pub(crate) fn drive_writes(&self, receipt: &mut WriteReceipt) -> bool {
        let generator = self.event_generator();
        loop {
            if let Some(sent) = receipt.try_result() {
                return sent;
            }
            if !self.is_started() || !generator.deliver_now(self, IoEvent::Writable) {
                return receipt.try_result().unwrap_or(false);
            }
            if let Some(sent) = receipt.try_result() {
                return sent;
            }
            thread::sleep(BLOCK_WRITE_BACKOFF);
        }
    }
}

/// Write what the transport accepts. `Ok(true)` once every segment is out.
fn write_segments(
    transport: &mut Transport,
    segments: &mut VecDeque<Bytes>,
    target: Option<SocketAddr>,
    statistics: bool,
    out: &mut Outcome,
) -> io::Result<bool> {
    if transport.is_packet() {
        let datagram = buffer::gather(segments.make_contiguous());
        return match transport.send(&datagram, target) {
            Ok(n) => {
                if statistics {
                    out.notify(Notice::StatSent(n as u64));
                }
                segments.clear();
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        };
    }

    while !segments.is_empty() {
        let written = match transport.write_vectored(&buffer::io_slices(segments)) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        buffer::advance(segments, written);
        if statistics {
            out.notify(Notice::StatSent(written as u64));
        }
    }
    Ok(true)
}
