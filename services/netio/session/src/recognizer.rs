//! Message recognition.
//!
//! A recognizer inspects the buffered bytes without consuming them and
//! returns an empty message of the right type, which then reads itself from
//! the buffer. Returning `Ok(None)` means "not enough data yet".

use crate::message::{ByteArrayMessage, Message};
use crate::session::Session;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Classifies buffered bytes into a message type.
///
/// Implementations run on the event generator thread while the session's
/// engine is busy reading; they must not call lifecycle operations such as
/// `close` or `block_write` on the session.
pub trait MessageRecognizer: Send + Sync {
    /// Return a message ready to read itself from `buf`, or `None` if more
    /// bytes are needed. Errors are reported to listeners and the session
    /// stays open.
    fn recognize(&self, session: &Session, buf: &[u8]) -> anyhow::Result<Option<Box<dyn Message>>>;
}

/// Recognizes any non-empty buffer as a [`ByteArrayMessage`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteArrayRecognizer;

impl MessageRecognizer for ByteArrayRecognizer {
    fn recognize(&self, _session: &Session, buf: &[u8]) -> anyhow::Result<Option<Box<dyn Message>>> {
        if buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(ByteArrayMessage::default())))
    }
}

/// Tries a list of recognizers in insertion order and returns the first
/// match.
///
/// The list is copy-on-write, so recognizers can be added or removed while
/// sessions are recognizing.
#[derive(Default)]
pub struct MessageRecognizerChain {
    recognizers: ArcSwap<Vec<Arc<dyn MessageRecognizer>>>,
}

impl MessageRecognizerChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a recognizer.
    pub fn add(&self, recognizer: Arc<dyn MessageRecognizer>) {
        self.recognizers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&recognizer));
            next
        });
    }

    /// Remove a recognizer previously added.
    pub fn remove(&self, recognizer: &Arc<dyn MessageRecognizer>) {
        self.recognizers.rcu(|current| {
            current
                .iter()
                .filter(|r| !same_recognizer(r, recognizer))
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    /// Number of recognizers in the chain.
    pub fn len(&self) -> usize {
        self.recognizers.load().len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.recognizers.load().is_empty()
    }
}

impl MessageRecognizer for MessageRecognizerChain {
    fn recognize(&self, session: &Session, buf: &[u8]) -> anyhow::Result<Option<Box<dyn Message>>> {
        for recognizer in self.recognizers.load().iter() {
            if let Some(message) = recognizer.recognize(session, buf)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

fn same_recognizer(a: &Arc<dyn MessageRecognizer>, b: &Arc<dyn MessageRecognizer>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use crate::message::Segments;

    #[derive(Debug, Default)]
    struct Marker(u8);

    impl Message for Marker {
        fn read_from(&mut self, buf: &mut BytesMut) -> bool {
            if buf.is_empty() {
                return false;
            }
            self.0 = buf.split_to(1)[0];
            true
        }

        fn to_segments(&self) -> Segments {
            Segments::from_iter([Bytes::copy_from_slice(&[self.0])])
        }
    }

    struct PrefixRecognizer(u8);

    impl MessageRecognizer for PrefixRecognizer {
        fn recognize(&self, _session: &Session, buf: &[u8]) -> anyhow::Result<Option<Box<dyn Message>>> {
            if buf.first() == Some(&self.0) {
                Ok(Some(Box::new(Marker::default())))
            } else {
                Ok(None)
            }
        }
    }

    #[test]
    fn test_byte_array_recognizer() {
        let session = Session::tcp();
        assert!(ByteArrayRecognizer.recognize(&session, b"").unwrap().is_none());
        let message = ByteArrayRecognizer.recognize(&session, b"abc").unwrap().unwrap();
        assert!(message.is::<ByteArrayMessage>());
    }

    #[test]
    fn test_chain_tries_in_order() {
        let session = Session::tcp();
        let chain = MessageRecognizerChain::new();
        let a: Arc<dyn MessageRecognizer> = Arc::new(PrefixRecognizer(b'a'));
        chain.add(Arc::clone(&a));
        chain.add(Arc::new(ByteArrayRecognizer));
        assert_eq!(chain.len(), 2);

        let first = chain.recognize(&session, b"abc").unwrap().unwrap();
        assert!(first.is::<Marker>());
        let second = chain.recognize(&session, b"xyz").unwrap().unwrap();
        assert!(second.is::<ByteArrayMessage>());

        chain.remove(&a);
        assert_eq!(chain.len(), 1);
        let after = chain.recognize(&session, b"abc").unwrap().unwrap();
        assert!(after.is::<ByteArrayMessage>());
    }

    #[test]
    fn test_empty_chain_recognizes_nothing() {
        let session = Session::tcp();
        let chain = MessageRecognizerChain::new();
        assert!(chain.is_empty());
        assert!(chain.recognize(&session, b"abc").unwrap().is_none());
    }
}
