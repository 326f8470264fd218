//! Per-session write queue and write receipts.

use crate::message::MessageRef;
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// One queued write.
///
/// `message` is `None` for internal handshake flushes, which carry TLS
/// records but are never reported as sent. Segments are produced lazily when
/// the write reaches the head of the queue so records keep their order.
pub(crate) struct PendingWrite {
    pub(crate) message: Option<MessageRef>,
    pub(crate) segments: Option<VecDeque<Bytes>>,
    pub(crate) receipt: Option<oneshot::Sender<bool>>,
}

impl PendingWrite {
    pub(crate) fn message(message: MessageRef, receipt: Option<oneshot::Sender<bool>>) -> Self {
        Self {
            message: Some(message),
            segments: None,
            receipt,
        }
    }

    pub(crate) fn handshake_flush() -> Self {
        Self {
            message: None,
            segments: None,
            receipt: None,
        }
    }

    pub(crate) fn is_internal(&self) -> bool {
        self.message.is_none()
    }
}

#[derive(Default)]
pub(crate) struct QueueState {
    pub(crate) items: VecDeque<PendingWrite>,
    /// Application writes deferred until the first TLS handshake completes
    pub(crate) held: Option<VecDeque<PendingWrite>>,
}

impl QueueState {
    fn application_len(&self) -> usize {
        let queued = self.items.iter().filter(|w| !w.is_internal()).count();
        queued + self.held.as_ref().map_or(0, VecDeque::len)
    }
}

#[derive(Default)]
pub(crate) struct WriteQueue {
    state: Mutex<QueueState>,
}

impl WriteQueue {
    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
    }

    /// Queue an application write. Returns `true` when the queue was empty
    /// and the driver has to be told to start writing.
    pub(crate) fn push(&self, write: PendingWrite) -> bool {
        let mut state = self.state.lock();
        if let Some(held) = state.held.as_mut() {
            held.push_back(write);
            return false;
        }
        let was_empty = state.items.is_empty();
        state.items.push_back(write);
        was_empty
    }

    pub(crate) fn push_handshake_flush(&self) -> bool {
        let mut state = self.state.lock();
        let was_empty = state.items.is_empty();
        state.items.push_back(PendingWrite::handshake_flush());
        was_empty
    }

    /// Defer application writes until [`release_held`](Self::release_held).
    pub(crate) fn hold(&self) {
        let mut state = self.state.lock();
        if state.held.is_none() {
            state.held = Some(VecDeque::new());
        }
    }

    pub(crate) fn release_held(&self) {
        let mut state = self.state.lock();
        if let Some(held) = state.held.take() {
            state.items.extend(held);
        }
    }

    pub(crate) fn pop_front(&self) -> Option<PendingWrite> {
        self.state.lock().items.pop_front()
    }

    /// Application writes waiting, including held ones.
    pub(crate) fn len(&self) -> usize {
        self.state.lock().application_len()
    }

    /// Whether anything, internal flushes included, waits for the
    /// transport. Held writes do not count: they cannot be written yet.
    pub(crate) fn has_items(&self) -> bool {
        !self.state.lock().items.is_empty()
    }

    /// Nothing queued and nothing held back.
    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.items.is_empty() && state.held.as_ref().map_or(true, VecDeque::is_empty)
    }

    /// Drop everything, handing back the receipts to resolve.
    pub(crate) fn clear(&self) -> Vec<oneshot::Sender<bool>> {
        let mut state = self.state.lock();
        let held = state.held.take().unwrap_or_default();
        state
            .items
            .drain(..)
            .chain(held)
            .filter_map(|w| w.receipt)
            .collect()
    }
}

/// Completion of one write.
///
/// Resolves to `true` once the message has been fully written and `false`
/// if the session closed first. Await it from async code or call
/// [`wait`](Self::wait) from a plain thread.
#[derive(Debug)]
pub struct WriteReceipt {
    rx: oneshot::Receiver<bool>,
}

impl WriteReceipt {
    pub(crate) fn channel() -> (oneshot::Sender<bool>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Block the calling thread until the write resolves.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> bool {
        self.rx.blocking_recv().unwrap_or(false)
    }

    /// Non-blocking check: `Some(result)` once resolved.
    pub fn try_result(&mut self) -> Option<bool> {
        match self.rx.try_recv() {
            Ok(sent) => Some(sent),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(false),
        }
    }
}

impl Future for WriteReceipt {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or(false))
    }
}
