//! Helpers shared by the session integration tests.

#![allow(dead_code)]

use netio_session::{ByteArrayMessage, MessageRef, Session, SessionError, SessionListener};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Poll `condition` for up to five seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn bytes(content: &'static [u8]) -> MessageRef {
    Arc::new(ByteArrayMessage::new(content))
}

pub fn content(message: &MessageRef) -> Vec<u8> {
    message
        .downcast_ref::<ByteArrayMessage>()
        .map(|m| m.content().to_vec())
        .unwrap_or_default()
}

/// Records every callback in arrival order.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<&'static str>>,
    pub received: Mutex<Vec<u8>>,
    pub messages: Mutex<Vec<MessageRef>>,
    /// Payload of every `message_sent`, in callback order
    pub sent_payloads: Mutex<Vec<Vec<u8>>>,
    /// Whether the TLS handshake had completed at each `message_received`
    pub handshake_at_receive: Mutex<Vec<bool>>,
    pub exceptions: Mutex<Vec<String>>,
    pub established: AtomicUsize,
    pub closed: AtomicUsize,
    pub idle: AtomicUsize,
    pub timeouts: AtomicUsize,
    pub sent: AtomicUsize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn received_len(&self) -> usize {
        self.received.lock().len()
    }
}

impl SessionListener for Recorder {
    fn session_established(&self, _session: &Session) -> anyhow::Result<()> {
        self.events.lock().push("established");
        self.established.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn session_closed(&self, _session: &Session) -> anyhow::Result<()> {
        self.events.lock().push("closed");
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn session_idle(&self, _session: &Session) -> anyhow::Result<()> {
        self.idle.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn session_timeout(&self, _session: &Session) -> anyhow::Result<()> {
        self.events.lock().push("timeout");
        self.timeouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn message_received(&self, session: &Session, message: &MessageRef) -> anyhow::Result<()> {
        self.events.lock().push("received");
        self.handshake_at_receive.lock().push(session.is_handshake_completed());
        self.received.lock().extend(content(message));
        self.messages.lock().push(Arc::clone(message));
        Ok(())
    }

    fn message_sent(&self, _session: &Session, message: &MessageRef) -> anyhow::Result<()> {
        self.sent_payloads.lock().push(content(message));
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn exception_caught(&self, _session: &Session, cause: &SessionError) -> anyhow::Result<()> {
        self.events.lock().push("exception");
        self.exceptions.lock().push(cause.to_string());
        Ok(())
    }
}

/// Writes every received message back.
pub struct Echo;

impl SessionListener for Echo {
    fn message_received(&self, session: &Session, message: &MessageRef) -> anyhow::Result<()> {
        session.write(Arc::clone(message))?;
        Ok(())
    }
}
