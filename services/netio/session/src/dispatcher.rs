//! Event dispatch strategies.
//!
//! A [`Dispatcher`] decides on which thread listener callbacks run:
//!
//! - [`SimpleDispatcher`] runs them inline on the delivering thread, which
//!   for I/O events is the event generator thread
//! - [`PooledDispatcher`] hands them to a pool of worker threads, either
//!   round-robin or, in ordered mode, pinned to one worker per session so a
//!   session's callbacks keep their order

use crate::registry;
use crate::session::{Session, WeakSession};
use netio_util::pool::{QueueThreadPool, WorkerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, trace};

/// A unit of listener work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Delivers listener callbacks for a session.
pub trait Dispatcher: Send + Sync {
    /// Run `task` on behalf of `session`, now or later.
    fn dispatch(&self, session: &Session, task: Task);
}

/// Runs tasks on the calling thread.
///
/// Panics are caught and logged so a faulty listener cannot take down the
/// delivering thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleDispatcher;

impl Dispatcher for SimpleDispatcher {
    fn dispatch(&self, session: &Session, task: Task) {
        run_guarded(session.id(), task);
    }
}

fn run_guarded(session_id: u64, task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("Dispatched task for session {} panicked", session_id);
    }
}

/// Sessions pinned to workers by the ordered pooled dispatcher.
///
/// Entries hold weak session handles so the map never keeps a session
/// alive; dead entries are purged as the map grows.
///
/// While the pool shrinks, `retiring` lists the workers being removed.
/// Tasks for sessions pinned to them are parked until the tasks still
/// queued on those workers have been moved, so they cannot overtake them.
#[derive(Default)]
struct Pinning {
    workers: HashMap<u64, (WeakSession, WorkerId)>,
    purge_at: usize,
    retiring: Vec<WorkerId>,
    parked: Vec<(Session, Task)>,
}

impl Pinning {
    const MIN_PURGE: usize = 64;

    fn lookup(&self, session: &Session) -> Option<WorkerId> {
        self.workers.get(&session.id()).map(|(_, worker)| *worker)
    }

    fn pin(&mut self, session: &Session, worker: WorkerId) {
        if self.workers.len() >= self.purge_at {
            self.workers.retain(|_, (weak, _)| weak.is_alive());
            self.purge_at = (self.workers.len() * 2).max(Self::MIN_PURGE);
        }
        self.workers.insert(session.id(), (session.downgrade(), worker));
    }

    /// The session's worker, pinning it to the next one if needed.
    fn route<T: Send + 'static>(
        &mut self,
        pool: &QueueThreadPool<T>,
        session: &Session,
    ) -> Option<WorkerId> {
        if let Some(worker) = self.lookup(session) {
            return Some(worker);
        }
        let chosen = pool.choose();
        if let Some(worker) = chosen {
            self.pin(session, worker);
        }
        chosen
    }

    fn unpin(&mut self, session: &Session, worker: WorkerId) {
        if self.lookup(session) == Some(worker) {
            self.workers.remove(&session.id());
        }
    }
}

/// Dispatches tasks to a resizable pool of worker threads.
///
/// With a pool size of zero tasks run inline. Shrinking the pool never
/// loses a task: work queued on removed workers is re-dispatched, and in
/// ordered mode it stays ahead of anything dispatched for the same session
/// while the shrink is in progress.
pub struct PooledDispatcher {
    pool: QueueThreadPool<(Session, Task)>,
    pinning: Option<Mutex<Pinning>>,
    resizing: Mutex<()>,
}

impl PooledDispatcher {
    /// Round-robin dispatcher with `size` workers.
    pub fn new(size: usize) -> Self {
        Self::build(size, None)
    }

    /// Dispatcher that pins every session to one worker, preserving the
    /// order of each session's callbacks.
    pub fn ordered(size: usize) -> Self {
        Self::build(size, Some(Mutex::new(Pinning::default())))
    }

    fn build(size: usize, pinning: Option<Mutex<Pinning>>) -> Self {
        let pool = QueueThreadPool::new(
            || registry::global().thread_name("PooledDispatcher"),
            |(session, task): (Session, Task)| run_guarded(session.id(), task),
        );
        let dispatcher = Self {
            pool,
            pinning,
            resizing: Mutex::new(()),
        };
        dispatcher.set_thread_pool_size(size);
        dispatcher
    }

    /// Whether callbacks are pinned per session.
    pub fn is_ordered(&self) -> bool {
        self.pinning.is_some()
    }

    /// Number of worker threads.
    pub fn thread_pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Resize the pool, re-dispatching tasks queued on removed workers.
    pub fn set_thread_pool_size(&self, size: usize) {
        let _resizing = self.resizing.lock();
        let Some(pinning) = &self.pinning else {
            for item in self.pool.resize(size) {
                self.pool.add(item);
            }
            return;
        };

        pinning.lock().retiring = self.pool.worker_ids().into_iter().skip(size).collect();
        // Joining happens without the pinning lock; tasks finishing on the
        // removed workers may dispatch.
        let orphans = self.pool.resize(size);

        let inline = {
            let mut pinning = pinning.lock();
            let live = self.pool.worker_ids();
            pinning.retiring.clear();
            pinning.workers.retain(|_, (_, worker)| live.contains(worker));
            let parked = std::mem::take(&mut pinning.parked);

            let mut inline = Vec::new();
            for item in orphans.into_iter().chain(parked) {
                let placed = match pinning.route(&self.pool, &item.0) {
                    Some(worker) => self.pool.add_to(worker, item),
                    None => Err(item),
                };
                if let Err(item) = placed {
                    inline.push(item);
                }
            }
            inline
        };
        for item in inline {
            self.pool.run_inline(item);
        }
    }

    /// Tasks waiting in worker queues.
    pub fn pending(&self) -> usize {
        self.pool.pending()
    }

    /// Drop every queued task.
    pub fn clear(&self) {
        self.pool.clear();
    }

    fn dispatch_ordered(&self, pinning: &Mutex<Pinning>, session: &Session, task: Task) {
        let mut item = (session.clone(), task);
        loop {
            let worker = {
                let mut pinning = pinning.lock();
                let worker = pinning.route(&self.pool, session);
                if let Some(worker) = worker.filter(|w| pinning.retiring.contains(w)) {
                    trace!(
                        "Parking task for session {} while worker {} retires",
                        session.id(),
                        worker
                    );
                    pinning.parked.push(item);
                    return;
                }
                worker
            };
            let Some(worker) = worker else {
                self.pool.run_inline(item);
                return;
            };
            match self.pool.add_to(worker, item) {
                Ok(()) => return,
                Err(returned) => {
                    // Removed concurrently. A retiring worker parks the task
                    // on the next pass; otherwise choose again.
                    let mut pinning = pinning.lock();
                    if !pinning.retiring.contains(&worker) {
                        pinning.unpin(session, worker);
                    }
                    item = returned;
                }
            }
        }
    }
}

impl Dispatcher for PooledDispatcher {
    fn dispatch(&self, session: &Session, task: Task) {
        match &self.pinning {
            Some(pinning) => self.dispatch_ordered(pinning, session, task),
            None => self.pool.add((session.clone(), task)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_simple_dispatcher_runs_inline() {
        let session = Session::tcp();
        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();
        SimpleDispatcher.dispatch(
            &session,
            Box::new(move || {
                tx.send(thread::current().id()).unwrap();
            }),
        );
        assert_eq!(rx.try_recv().unwrap(), caller);
    }

    #[test]
    fn test_simple_dispatcher_survives_panic() {
        let session = Session::tcp();
        SimpleDispatcher.dispatch(&session, Box::new(|| panic!("listener bug")));
        let (tx, rx) = mpsc::channel();
        SimpleDispatcher.dispatch(&session, Box::new(move || tx.send(1).unwrap()));
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn test_ordered_dispatch_keeps_session_order() {
        let dispatcher = PooledDispatcher::ordered(4);
        let sessions: Vec<Session> = (0..3).map(|_| Session::tcp()).collect();
        let (tx, rx) = mpsc::channel();

        for i in 0..100u32 {
            for (n, session) in sessions.iter().enumerate() {
                let tx = tx.clone();
                dispatcher.dispatch(session, Box::new(move || tx.send((n, i)).unwrap()));
            }
        }

        let mut last = [None::<u32>; 3];
        for _ in 0..300 {
            let (n, i) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            if let Some(prev) = last[n] {
                assert!(i > prev, "session {} saw {} after {}", n, i, prev);
            }
            last[n] = Some(i);
        }
    }

    #[test]
    fn test_resize_to_zero_keeps_pending_tasks() {
        let dispatcher = PooledDispatcher::new(2);
        let session = Session::tcp();
        let gate = Arc::new(Mutex::new(()));
        let hold = gate.lock();
        let (tx, rx) = mpsc::channel();

        for i in 0..20u32 {
            let tx = tx.clone();
            let gate = Arc::clone(&gate);
            dispatcher.dispatch(
                &session,
                Box::new(move || {
                    drop(gate.lock());
                    tx.send(i).unwrap();
                }),
            );
        }

        drop(hold);
        dispatcher.set_thread_pool_size(0);
        assert_eq!(dispatcher.thread_pool_size(), 0);

        let mut seen: Vec<u32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_shrink_keeps_order_of_tasks_dispatched_meanwhile() {
        let dispatcher = Arc::new(PooledDispatcher::ordered(2));
        let first = Session::tcp();
        let session = Session::tcp();
        let gate = Arc::new(Mutex::new(()));
        let hold = gate.lock();
        let (tx, rx) = mpsc::channel();
        let (started_tx, started_rx) = mpsc::channel();

        dispatcher.dispatch(&first, Box::new(|| {}));
        let blocker_gate = Arc::clone(&gate);
        dispatcher.dispatch(
            &session,
            Box::new(move || {
                started_tx.send(()).unwrap();
                drop(blocker_gate.lock());
            }),
        );
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let pinned = dispatcher.pinning.as_ref().unwrap().lock().lookup(&session);
        assert_eq!(pinned, dispatcher.pool.worker_ids().get(1).copied());

        for i in 0..3u32 {
            let tx = tx.clone();
            dispatcher.dispatch(&session, Box::new(move || tx.send(i).unwrap()));
        }

        // The shrink blocks joining the busy worker.
        let shrinking = Arc::clone(&dispatcher);
        let shrink = thread::spawn(move || shrinking.set_thread_pool_size(1));
        while dispatcher.thread_pool_size() != 1 {
            thread::sleep(Duration::from_millis(1));
        }
        for i in 3..6u32 {
            let tx = tx.clone();
            dispatcher.dispatch(&session, Box::new(move || tx.send(i).unwrap()));
        }

        drop(hold);
        shrink.join().unwrap();
        let seen: Vec<u32> = (0..6)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..6).collect::<Vec<_>>());
    }
}
