//! Thread pool built from per-worker FIFO queues.
//!
//! Every worker owns a [`BlockingQueue`] and runs the pool action on each item
//! it pops, so items routed to the same worker are processed in order. Items
//! are routed round-robin unless the caller pins them to a worker id.
//!
//! With a size of zero the pool runs the action inline on the caller's
//! thread. Shrinking stops the removed workers and hands their unprocessed
//! items back to the caller so nothing is lost.

use crate::queue::BlockingQueue;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, warn};

type Action<T> = Arc<dyn Fn(T) + Send + Sync>;
type NameFn = Box<dyn Fn() -> String + Send + Sync>;

/// Identifier of a pool worker, stable for the worker's lifetime.
pub type WorkerId = u64;

/// Resizable pool of queue-draining worker threads.
pub struct QueueThreadPool<T: Send + 'static> {
    action: Action<T>,
    thread_name: NameFn,
    workers: Mutex<Vec<Worker<T>>>,
    cursor: AtomicUsize,
    next_worker_id: AtomicU64,
}

struct Worker<T> {
    id: WorkerId,
    queue: Arc<BlockingQueue<T>>,
    thread: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> QueueThreadPool<T> {
    /// Create an empty pool.
    ///
    /// `thread_name` is called once per spawned worker; `action` processes
    /// every item.
    pub fn new<N, A>(thread_name: N, action: A) -> Self
    where
        N: Fn() -> String + Send + Sync + 'static,
        A: Fn(T) + Send + Sync + 'static,
    {
        Self {
            action: Arc::new(action),
            thread_name: Box::new(thread_name),
            workers: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            next_worker_id: AtomicU64::new(0),
        }
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    /// Number of items waiting in worker queues.
    pub fn pending(&self) -> usize {
        self.workers.lock().iter().map(|w| w.queue.len()).sum()
    }

    /// Drop every queued item.
    pub fn clear(&self) {
        for worker in self.workers.lock().iter() {
            worker.queue.clear();
        }
    }

    /// Ids of the current workers.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.lock().iter().map(|w| w.id).collect()
    }

    /// Pick the next worker round-robin.
    pub fn choose(&self) -> Option<WorkerId> {
        let workers = self.workers.lock();
        if workers.is_empty() {
            return None;
        }
        let pos = self.cursor.fetch_add(1, Ordering::Relaxed) % workers.len();
        Some(workers[pos].id)
    }

    /// Queue an item on the next worker, or run it inline when the pool is
    /// empty.
    pub fn add(&self, item: T) {
        // Pushing under the workers lock keeps a concurrent shrink from
        // draining the queue before the item lands in it.
        {
            let workers = self.workers.lock();
            if !workers.is_empty() {
                let pos = self.cursor.fetch_add(1, Ordering::Relaxed) % workers.len();
                workers[pos].queue.push(item);
                return;
            }
        }
        run_action(&self.action, item);
    }

    /// Queue an item on a specific worker.
    ///
    /// The item is handed back when that worker no longer exists.
    pub fn add_to(&self, worker: WorkerId, item: T) -> Result<(), T> {
        let workers = self.workers.lock();
        match workers.iter().find(|w| w.id == worker) {
            Some(w) => {
                w.queue.push(item);
                Ok(())
            }
            None => Err(item),
        }
    }

    /// Run an item inline on the caller's thread.
    pub fn run_inline(&self, item: T) {
        run_action(&self.action, item);
    }

    /// Grow or shrink the pool.
    ///
    /// Returns the items that were still queued on removed workers, in
    /// per-worker FIFO order. The caller is expected to re-add them.
    pub fn resize(&self, size: usize) -> Vec<T> {
        let removed = {
            let mut workers = self.workers.lock();
            if size > workers.len() {
                while workers.len() < size {
                    match self.spawn_worker() {
                        Some(worker) => workers.push(worker),
                        None => break,
                    }
                }
                Vec::new()
            } else {
                workers.split_off(size)
            }
        };

        let mut orphans = Vec::new();
        for worker in removed.into_iter().rev() {
            orphans.extend(stop_worker(worker));
        }
        orphans
    }

    fn spawn_worker(&self) -> Option<Worker<T>> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(BlockingQueue::new());
        let name = (self.thread_name)();
        let action = Arc::clone(&self.action);
        let worker_queue = Arc::clone(&queue);

        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Some(item) = worker_queue.pop() {
                run_action(&action, item);
            }
        });

        match spawned {
            Ok(handle) => {
                debug!("Started pool worker {}", name);
                Some(Worker {
                    id,
                    queue,
                    thread: handle.thread().id(),
                    handle: Some(handle),
                })
            }
            Err(e) => {
                error!("Failed to spawn pool worker {}: {}", name, e);
                None
            }
        }
    }
}

impl<T: Send + 'static> Drop for QueueThreadPool<T> {
    fn drop(&mut self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        let mut discarded = 0;
        for worker in workers {
            discarded += stop_worker(worker).len();
        }
        if discarded > 0 {
            warn!("Pool dropped with {} queued items discarded", discarded);
        }
    }
}

fn stop_worker<T>(mut worker: Worker<T>) -> Vec<T> {
    worker.queue.interrupt();
    if let Some(handle) = worker.handle.take() {
        // A worker resizing its own pool cannot wait for itself.
        if thread::current().id() != worker.thread && handle.join().is_err() {
            error!("Pool worker {} terminated abnormally", worker.id);
        }
    }
    worker.queue.drain()
}

fn run_action<T>(action: &Action<T>, item: T) {
    if catch_unwind(AssertUnwindSafe(|| action(item))).is_err() {
        error!("Pool action panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn counting_pool() -> (QueueThreadPool<u32>, mpsc::Receiver<(u32, String)>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let counter = AtomicUsize::new(0);
        let pool = QueueThreadPool::new(
            move || format!("test-pool-{}", counter.fetch_add(1, Ordering::Relaxed)),
            move |item: u32| {
                let name = thread::current().name().unwrap_or("inline").to_string();
                let _ = tx.lock().send((item, name));
            },
        );
        (pool, rx)
    }

    #[test]
    fn test_empty_pool_runs_inline() {
        let (pool, rx) = counting_pool();
        pool.add(7);
        let (item, _) = rx.try_recv().unwrap();
        assert_eq!(item, 7);
        assert!(pool.choose().is_none());
    }

    #[test]
    fn test_workers_process_items() {
        let (pool, rx) = counting_pool();
        assert!(pool.resize(2).is_empty());
        assert_eq!(pool.size(), 2);

        for i in 0..10 {
            pool.add(i);
        }
        let mut seen: Vec<u32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap().0)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_pinned_worker_keeps_order() {
        let (pool, rx) = counting_pool();
        pool.resize(3);
        let worker = pool.choose().unwrap();
        for i in 0..50 {
            assert!(pool.add_to(worker, i).is_ok());
        }
        let seen: Vec<u32> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap().0)
            .collect();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_add_to_missing_worker_returns_item() {
        let (pool, _rx) = counting_pool();
        assert_eq!(pool.add_to(42, 5), Err(5));
    }

    #[test]
    fn test_shrink_returns_orphans() {
        let (tx, rx) = mpsc::channel::<()>();
        let gate = Arc::new(Mutex::new(()));
        let hold = gate.lock();
        let worker_gate = Arc::clone(&gate);
        let tx = Mutex::new(tx);
        let pool = QueueThreadPool::new(
            || "gated".to_string(),
            move |_: u32| {
                let _ = tx.lock().send(());
                drop(worker_gate.lock());
            },
        );
        pool.resize(1);
        pool.add(1);
        // First item is now blocked inside the action.
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        pool.add(2);
        pool.add(3);
        assert_eq!(pool.pending(), 2);

        drop(hold);
        let orphans = pool.resize(0);
        assert_eq!(pool.size(), 0);
        // Whatever the worker did not get to is handed back.
        let processed = rx.try_iter().count();
        assert_eq!(orphans.len() + processed, 2);
    }

    #[test]
    fn test_drop_discards_queued_items() {
        let (tx, rx) = mpsc::channel::<u32>();
        let gate = Arc::new(Mutex::new(()));
        let hold = gate.lock();
        let worker_gate = Arc::clone(&gate);
        let tx = Mutex::new(tx);
        let pool = QueueThreadPool::new(
            || "dropped".to_string(),
            move |item: u32| {
                let _ = tx.lock().send(item);
                drop(worker_gate.lock());
            },
        );
        pool.resize(1);
        pool.add(1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        pool.add(2);
        pool.add(3);

        let dropper = thread::spawn(move || drop(pool));
        // The worker sees the interrupt only after its current item.
        drop(hold);
        dropper.join().unwrap();
        assert!(rx.try_iter().all(|item| item == 1));
    }
}
