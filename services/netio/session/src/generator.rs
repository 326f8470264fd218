//! Readiness multiplexer driving sessions from a dedicated thread.
//!
//! An [`EventGenerator`] owns one `mio::Poll` and, while started, one thread
//! running the loop:
//!
//! 1. apply queued registration commands
//! 2. wait for readiness, bounded by the timeout-check interval
//! 3. deliver readiness to each ready session as [`IoEvent`]s
//! 4. run the timeout sweep once a full interval has elapsed
//!
//! All selector mutations happen on the generator thread. Commands issued
//! from other threads are queued and the poll is woken. Stopping the loop
//! closes every session still registered.
//!
//! The auto-closing variant stops its loop once every session it has seen
//! has gone away, so short-lived generators do not leak a thread.

use crate::error::Result;
use crate::event::{Command, IoEvent};
use crate::registry;
use crate::session::Session;
use mio::{Events, Poll, Token, Waker};
use netio_util::ElapsedTime;
use parking_lot::Mutex;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace};

const WAKE_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

thread_local! {
    static CURRENT_RUN: RefCell<Option<Arc<Run>>> = const { RefCell::new(None) };
}

/// Handle to an event generator. Clones share the same loop.
#[derive(Clone)]
pub struct EventGenerator {
    inner: Arc<GeneratorInner>,
}

struct GeneratorInner {
    id: usize,
    name: String,
    auto_close: bool,
    check_interval: Duration,
    current: Mutex<Option<Arc<Run>>>,
}

/// One started period of the loop, from start to stop.
struct Run {
    generator_id: usize,
    registry: mio::Registry,
    waker: Waker,
    pending: Mutex<Vec<(Session, Command)>>,
    sessions: Mutex<HashMap<Token, Session>>,
    stop: AtomicBool,
    added_session: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Point-in-time generator state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratorSnapshot {
    /// Generator id
    pub id: usize,
    /// Thread name used by the loop
    pub name: String,
    /// Whether the loop stops once it has no sessions
    pub auto_close: bool,
    /// Whether the loop is running
    pub started: bool,
    /// Registered sessions
    pub session_count: usize,
}

impl Default for EventGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventGenerator")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("auto_close", &self.inner.auto_close)
            .finish()
    }
}

impl PartialEq for EventGenerator {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventGenerator {}

impl EventGenerator {
    /// Generator that runs until explicitly stopped.
    pub fn new() -> Self {
        Self::custom(false, registry::global().defaults().check_interval)
    }

    /// Generator that stops once its last session is gone.
    pub fn auto_close() -> Self {
        Self::custom(true, registry::global().defaults().check_interval)
    }

    /// Generator with an explicit timeout-check interval.
    pub fn custom(auto_close: bool, check_interval: Duration) -> Self {
        let id = registry::global().next_thread_index("EventGenerator");
        Self {
            inner: Arc::new(GeneratorInner {
                id,
                name: format!("EventGenerator-{}", id),
                auto_close,
                check_interval: check_interval.max(Duration::from_millis(1)),
                current: Mutex::new(None),
            }),
        }
    }

    /// Generator id.
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Interval between timeout sweeps.
    pub fn check_interval(&self) -> Duration {
        self.inner.check_interval
    }

    /// Whether the loop thread is running.
    pub fn is_started(&self) -> bool {
        self.inner.current.lock().is_some()
    }

    /// Whether the caller is this generator's loop thread.
    pub fn is_generator_thread(&self) -> bool {
        current_run(self.inner.id).is_some()
    }

    /// Start the loop. Starting a running generator cancels a pending
    /// auto-close stop.
    pub fn start(&self) -> Result<()> {
        let mut current = self.inner.current.lock();
        self.ensure_running(&mut current)?;
        Ok(())
    }

    /// Stop the loop, closing every registered session. Blocks until the
    /// loop thread has finished unless called from that thread.
    pub fn stop(&self) {
        let Some(run) = self.inner.current.lock().take() else {
            return;
        };
        info!("Stopping {}", self.inner.name);
        run.stop.store(true, Ordering::Release);
        if let Err(e) = run.waker.wake() {
            error!("Failed to wake {}: {}", self.inner.name, e);
        }
        if self.is_generator_thread() {
            return;
        }
        let handle = run.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("{} terminated abnormally", self.inner.name);
            }
        }
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.inner
            .current
            .lock()
            .as_ref()
            .map_or(0, |run| run.sessions.lock().len())
    }

    /// Capture the generator state.
    pub fn snapshot(&self) -> GeneratorSnapshot {
        let current = self.inner.current.lock();
        GeneratorSnapshot {
            id: self.inner.id,
            name: self.inner.name.clone(),
            auto_close: self.inner.auto_close,
            started: current.is_some(),
            session_count: current.as_ref().map_or(0, |run| run.sessions.lock().len()),
        }
    }

    /// Submit a command for `session`.
    ///
    /// On the generator thread the command is applied immediately, so the
    /// session sees its effect before this returns. Commands issued while
    /// the session's engine is busy (from a recognizer) are deferred to the
    /// next loop iteration.
    pub(crate) fn register(&self, session: &Session, command: Command) -> Result<()> {
        if let Some(run) = current_run(self.inner.id) {
            run.added_session.store(true, Ordering::Release);
            if session.is_engine_busy() {
                run.pending.lock().push((session.clone(), command));
            } else {
                run.apply(session.clone(), command);
            }
            return Ok(());
        }

        let mut current = self.inner.current.lock();
        let run = self.ensure_running(&mut current)?;
        run.added_session.store(true, Ordering::Release);
        run.pending.lock().push((session.clone(), command));
        run.waker.wake()?;
        Ok(())
    }

    /// Deliver `event` to `session` right away. Only works on the generator
    /// thread; returns `false` elsewhere.
    pub(crate) fn deliver_now(&self, session: &Session, event: IoEvent) -> bool {
        match current_run(self.inner.id) {
            Some(run) => {
                session.on_io_event(&run.registry, event);
                true
            }
            None => false,
        }
    }

    fn ensure_running(&self, current: &mut Option<Arc<Run>>) -> Result<Arc<Run>> {
        if let Some(run) = current.as_ref() {
            run.stop.store(false, Ordering::Release);
            return Ok(Arc::clone(run));
        }

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let run = Arc::new(Run {
            generator_id: self.inner.id,
            registry,
            waker,
            pending: Mutex::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
            added_session: AtomicBool::new(false),
            handle: Mutex::new(None),
        });

        let inner = Arc::clone(&self.inner);
        let thread_run = Arc::clone(&run);
        let handle = thread::Builder::new()
            .name(self.inner.name.clone())
            .spawn(move || run_loop(inner, thread_run, poll))?;
        *run.handle.lock() = Some(handle);

        info!("Started {}", self.inner.name);
        *current = Some(Arc::clone(&run));
        Ok(run)
    }
}

fn current_run(generator_id: usize) -> Option<Arc<Run>> {
    CURRENT_RUN.with(|current| {
        current
            .borrow()
            .as_ref()
            .filter(|run| run.generator_id == generator_id)
            .cloned()
    })
}

/// Closes the sessions of a loop that unwound and forgets the run, so the
/// next registration starts a fresh thread.
struct UnwindCleanup<'a> {
    inner: &'a GeneratorInner,
    run: &'a Arc<Run>,
}

impl Drop for UnwindCleanup<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        error!("{} loop panicked, closing its sessions", self.inner.name);
        self.run.stop.store(true, Ordering::Release);
        {
            let mut current = self.inner.current.lock();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, self.run)) {
                *current = None;
            }
        }
        if catch_unwind(AssertUnwindSafe(|| self.run.finish())).is_err() {
            error!("{} failed to close sessions after a panic", self.inner.name);
        }
        CURRENT_RUN.with(|current| *current.borrow_mut() = None);
    }
}

fn run_loop(inner: Arc<GeneratorInner>, run: Arc<Run>, mut poll: Poll) {
    CURRENT_RUN.with(|current| *current.borrow_mut() = Some(Arc::clone(&run)));
    let _cleanup = UnwindCleanup {
        inner: &inner,
        run: &run,
    };

    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    let mut sweep_clock: Option<ElapsedTime> = None;

    loop {
        while !run.stop.load(Ordering::Acquire) {
            run.apply_pending();

            if inner.auto_close
                && run.added_session.load(Ordering::Acquire)
                && run.sessions.lock().is_empty()
            {
                debug!("{} has no sessions left, stopping", inner.name);
                run.stop.store(true, Ordering::Release);
                break;
            }

            if let Err(e) = poll.poll(&mut events, Some(inner.check_interval)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("{} poll failed: {}", inner.name, e);
                run.stop.store(true, Ordering::Release);
                break;
            }

            let active = run.deliver(&events);
            run.sweep(&mut sweep_clock, &active, inner.check_interval);
        }

        // A start or register racing with an auto-close stop keeps the loop
        // alive; the decision is made under the same lock they take.
        let mut current = inner.current.lock();
        if !run.stop.load(Ordering::Acquire) {
            continue;
        }
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &run)) {
            *current = None;
        }
        break;
    }

    run.finish();
    info!("{} stopped", inner.name);
    CURRENT_RUN.with(|current| *current.borrow_mut() = None);
}

impl Run {
    fn apply(&self, session: Session, command: Command) {
        trace!("Session {} command {:?}", session.id(), command);
        let token = Token(session.id() as usize);
        match command {
            Command::Register => {
                self.sessions.lock().insert(token, session.clone());
                session.on_register(&self.registry, token);
            }
            Command::Unregister => {
                self.sessions.lock().remove(&token);
                session.on_unregister(&self.registry);
            }
            Command::EnableWrite => session.on_enable_write(&self.registry),
        }
    }

    fn apply_pending(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (session, command) in pending {
            self.apply(session, command);
        }
    }

    fn session(&self, token: Token) -> Option<Session> {
        self.sessions.lock().get(&token).cloned()
    }

    /// Deliver readiness, returning the tokens that saw events.
    fn deliver(&self, events: &Events) -> HashSet<Token> {
        let mut active = HashSet::new();
        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            active.insert(token);
            let Some(session) = self.session(token) else {
                continue;
            };
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed() || event.is_error();
            for io_event in session.io_phase().events(readable, writable) {
                session.on_io_event(&self.registry, io_event);
            }
        }
        active
    }

    fn sweep(&self, clock: &mut Option<ElapsedTime>, active: &HashSet<Token>, interval: Duration) {
        // The first iteration only starts the clock.
        let Some(clock) = clock.as_mut() else {
            *clock = Some(ElapsedTime::new());
            return;
        };

        for token in active {
            if let Some(session) = self.session(*token) {
                session.on_io_event(&self.registry, IoEvent::Activity);
            }
        }

        if clock.elapsed() < interval {
            return;
        }
        let waited = clock.reset();
        let idle: Vec<Session> = self
            .sessions
            .lock()
            .iter()
            .filter(|(token, _)| !active.contains(token))
            .map(|(_, session)| session.clone())
            .collect();
        for session in idle {
            session.on_io_event(&self.registry, IoEvent::CheckTimeout(waited));
        }
    }

    fn finish(&self) {
        self.apply_pending();
        let sessions: Vec<Session> = self.sessions.lock().values().cloned().collect();
        for session in sessions {
            session.close(false);
        }
        self.sessions.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_start_stop_idempotent() {
        let generator = EventGenerator::new();
        assert!(!generator.is_started());
        generator.start().unwrap();
        generator.start().unwrap();
        assert!(generator.is_started());
        assert!(!generator.is_generator_thread());

        generator.stop();
        generator.stop();
        assert!(!generator.is_started());
    }

    #[test]
    fn test_restart_after_stop() {
        let generator = EventGenerator::new();
        generator.start().unwrap();
        generator.stop();
        generator.start().unwrap();
        assert!(generator.is_started());
        generator.stop();
    }

    #[test]
    fn test_auto_close_without_sessions_keeps_running() {
        let generator = EventGenerator::custom(true, Duration::from_millis(10));
        generator.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        // Nothing was ever registered, so there is nothing to wait for.
        assert!(generator.is_started());
        generator.stop();
    }

    #[cfg(unix)]
    #[test]
    fn test_auto_close_stops_after_last_session() {
        let generator = EventGenerator::custom(true, Duration::from_millis(10));
        let session = Session::pipe();
        session.set_event_generator(generator.clone()).unwrap();
        session.start(true).unwrap();
        assert!(session.is_available());
        assert_eq!(generator.session_count(), 1);

        session.close(true);
        assert!(wait_until(|| !generator.is_started()));
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_closes_registered_sessions() {
        let generator = EventGenerator::new();
        let session = Session::pipe();
        session.set_event_generator(generator.clone()).unwrap();
        session.start(true).unwrap();
        assert!(session.is_started());

        generator.stop();
        assert!(!session.is_started());
        assert_eq!(generator.snapshot().session_count, 0);
    }
}
