//! Message contract and the byte-array message.
//!
//! A [`Message`] deserializes itself from the session's read buffer and
//! serializes into a list of byte segments for writing. The framework never
//! interprets payloads; concrete protocols supply their own message types and
//! a [`MessageRecognizer`](crate::recognizer::MessageRecognizer) that picks
//! the right one for the buffered bytes.

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Serialized form of a message.
pub type Segments = SmallVec<[Bytes; 2]>;

/// Shared, immutable handle to a recognized or written message.
pub type MessageRef = Arc<dyn Message>;

/// Upcast helper so `dyn Message` can be downcast to its concrete type.
pub trait AsAny: Any {
    /// View as `Any`.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An application-level unit of data.
pub trait Message: AsAny + Send + Sync + fmt::Debug {
    /// Consume one complete message from the front of `buf`.
    ///
    /// Returns `false`, leaving `buf` untouched, if the buffer does not yet
    /// hold a complete message.
    fn read_from(&mut self, buf: &mut BytesMut) -> bool;

    /// Serialize into zero or more segments.
    fn to_segments(&self) -> Segments;

    /// Source or destination address for packet transports.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Stamp the source address of a received datagram.
    fn set_peer_addr(&mut self, _addr: SocketAddr) {}
}

impl dyn Message {
    /// Downcast to a concrete message type.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }

    /// Whether the message is of type `T`.
    pub fn is<T: Message>(&self) -> bool {
        AsAny::as_any(self).is::<T>()
    }
}

/// A message carrying raw bytes.
///
/// Reading consumes everything buffered, so each read cycle yields one
/// message with all bytes received so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteArrayMessage {
    content: Bytes,
    peer: Option<SocketAddr>,
}

impl ByteArrayMessage {
    /// Create a message with the given content.
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            peer: None,
        }
    }

    /// Set the destination address for unconnected packet sessions.
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer = Some(addr);
        self
    }

    /// Message content.
    pub fn content(&self) -> &Bytes {
        &self.content
    }
}

impl Message for ByteArrayMessage {
    fn read_from(&mut self, buf: &mut BytesMut) -> bool {
        self.content = buf.split().freeze();
        true
    }

    fn to_segments(&self) -> Segments {
        let mut segments = Segments::new();
        if !self.content.is_empty() {
            segments.push(self.content.clone());
        }
        segments
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn set_peer_addr(&mut self, addr: SocketAddr) {
        self.peer = Some(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_array_reads_everything() {
        let mut buf = BytesMut::from(&b"hello world"[..]);
        let mut message = ByteArrayMessage::default();
        assert!(message.read_from(&mut buf));
        assert!(buf.is_empty());
        assert_eq!(&message.content()[..], b"hello world");
    }

    #[test]
    fn test_empty_message_has_no_segments() {
        assert!(ByteArrayMessage::new(Bytes::new()).to_segments().is_empty());
    }

    #[test]
    fn test_downcast_through_dyn() {
        let message: MessageRef = Arc::new(ByteArrayMessage::new(&b"x"[..]));
        assert!(message.is::<ByteArrayMessage>());
        let concrete = message.downcast_ref::<ByteArrayMessage>().unwrap();
        assert_eq!(&concrete.content()[..], b"x");
    }

    #[test]
    fn test_peer_addr_roundtrip() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mut message = ByteArrayMessage::new(&b"p"[..]);
        assert_eq!(message.peer_addr(), None);
        message.set_peer_addr(addr);
        assert_eq!(message.peer_addr(), Some(addr));
    }
}
