//! Delimiter-terminated messages, such as text lines.

use crate::error::WireError;
use bytes::{Buf, Bytes, BytesMut};
use netio_session::{Message, MessageRecognizer, Segments, Session};
use netio_util::buffer;
use smallvec::smallvec;
use std::borrow::Cow;
use std::net::SocketAddr;
use tracing::debug;

/// Default maximum content length before the delimiter (64 KiB)
pub const DEFAULT_MAX_LENGTH: usize = 64 * 1024;

/// Content followed by a delimiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimitedMessage {
    content: Bytes,
    delimiter: Bytes,
    peer: Option<SocketAddr>,
}

impl DelimitedMessage {
    /// Message with `content` terminated by `delimiter` when written.
    pub fn new(content: impl Into<Bytes>, delimiter: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            delimiter: delimiter.into(),
            peer: None,
        }
    }

    /// Newline-terminated text.
    pub fn line(text: impl Into<String>) -> Self {
        Self::new(text.into(), Bytes::from_static(b"\n"))
    }

    /// Set the destination for unconnected datagram sessions.
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer = Some(addr);
        self
    }

    /// Content without the delimiter.
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Content as text, replacing invalid UTF-8.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

impl Message for DelimitedMessage {
    fn read_from(&mut self, buf: &mut BytesMut) -> bool {
        let Some(pos) = buffer::index_of(buf, &self.delimiter) else {
            return false;
        };
        self.content = buf.split_to(pos).freeze();
        buf.advance(self.delimiter.len());
        true
    }

    fn to_segments(&self) -> Segments {
        smallvec![self.content.clone(), self.delimiter.clone()]
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn set_peer_addr(&mut self, addr: SocketAddr) {
        self.peer = Some(addr);
    }
}

/// Recognizes [`DelimitedMessage`]s ending in a fixed delimiter.
#[derive(Debug, Clone)]
pub struct DelimiterRecognizer {
    delimiter: Bytes,
    max_length: usize,
}

impl DelimiterRecognizer {
    /// Recognizer splitting on `delimiter`, which must not be empty.
    pub fn new(delimiter: impl Into<Bytes>) -> Result<Self, WireError> {
        let delimiter = delimiter.into();
        if delimiter.is_empty() {
            return Err(WireError::Malformed("empty delimiter"));
        }
        Ok(Self {
            delimiter,
            max_length: DEFAULT_MAX_LENGTH,
        })
    }

    /// Newline-separated lines.
    pub fn lines() -> Self {
        Self {
            delimiter: Bytes::from_static(b"\n"),
            max_length: DEFAULT_MAX_LENGTH,
        }
    }

    /// Reject content longer than `max_length` bytes.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// The delimiter.
    pub fn delimiter(&self) -> &Bytes {
        &self.delimiter
    }
}

impl MessageRecognizer for DelimiterRecognizer {
    fn recognize(&self, session: &Session, buf: &[u8]) -> anyhow::Result<Option<Box<dyn Message>>> {
        let found = buffer::index_of(buf, &self.delimiter);
        let size = match found {
            Some(pos) => pos,
            None => buf.len().saturating_sub(self.delimiter.len()),
        };
        if size > self.max_length {
            debug!("Session {} exceeded the {} byte message limit", session.id(), self.max_length);
            return Err(WireError::Size {
                size,
                limit: self.max_length,
            }
            .into());
        }
        Ok(found.map(|_| {
            Box::new(DelimitedMessage::new(Bytes::new(), self.delimiter.clone())) as Box<dyn Message>
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(recognizer: &DelimiterRecognizer, buf: &mut BytesMut) -> Vec<String> {
        let session = Session::tcp();
        let mut lines = Vec::new();
        while let Some(mut message) = recognizer.recognize(&session, buf).unwrap() {
            assert!(message.read_from(buf));
            let line = message.downcast_ref::<DelimitedMessage>().unwrap();
            lines.push(line.text().into_owned());
        }
        lines
    }

    #[test]
    fn test_lines_across_chunks() {
        let recognizer = DelimiterRecognizer::lines();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"hel");
        assert!(drain(&recognizer, &mut buf).is_empty());
        buf.extend_from_slice(b"lo\nwor");
        assert_eq!(drain(&recognizer, &mut buf), vec!["hello"]);
        buf.extend_from_slice(b"ld\n\nlast");
        assert_eq!(drain(&recognizer, &mut buf), vec!["world", ""]);
        assert_eq!(&buf[..], b"last");
    }

    #[test]
    fn test_multi_byte_delimiter_split_between_reads() {
        let recognizer = DelimiterRecognizer::new(&b"\r\n"[..]).unwrap();
        let mut buf = BytesMut::from(&b"GET /\r"[..]);
        assert!(drain(&recognizer, &mut buf).is_empty());
        buf.extend_from_slice(b"\nHost: x\r\n");
        assert_eq!(drain(&recognizer, &mut buf), vec!["GET /", "Host: x"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_overlong_content_rejected() {
        let session = Session::tcp();
        let recognizer = DelimiterRecognizer::lines().with_max_length(4);
        assert!(recognizer.recognize(&session, b"abcdefgh").is_err());
        assert!(recognizer.recognize(&session, b"abcdefgh\n").is_err());
        assert!(recognizer.recognize(&session, b"abcd\n").unwrap().is_some());
    }

    #[test]
    fn test_empty_delimiter_rejected() {
        assert!(DelimiterRecognizer::new(Bytes::new()).is_err());
    }

    #[test]
    fn test_line_segments() {
        let message = DelimitedMessage::line("ping");
        let segments = message.to_segments();
        assert_eq!(buffer::gather(&segments), Bytes::from_static(b"ping\n"));
    }
}
