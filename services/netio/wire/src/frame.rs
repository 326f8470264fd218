//! Length-prefixed framing.
//!
//! ```text
//! +----------------------+----------------------------------+
//! | u32 frame_len (BE)   | length of the bytes that follow  |
//! +----------------------+----------------------------------+
//! | payload              | frame_len (- 4 with checksum)    |
//! +----------------------+----------------------------------+
//! | u32 crc32 (opt)      | CRC32 of the payload             |
//! +----------------------+----------------------------------+
//! ```

use crate::error::WireError;
use bytes::{Buf, Bytes, BytesMut};
use netio_session::{Message, MessageRecognizer, Segments, Session};
use smallvec::smallvec;
use std::net::SocketAddr;
use tracing::{debug, trace};

/// Default maximum frame size (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Hard maximum frame size limit (64 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const LEN_SIZE: usize = 4;
const CRC_SIZE: usize = 4;

/// Frame layout shared by both ends of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_size: usize,
    checksum: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with the default size limit and no checksum.
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            checksum: false,
        }
    }

    /// Limit the bytes following the length prefix; capped at
    /// [`HARD_MAX_FRAME_SIZE`].
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size.min(HARD_MAX_FRAME_SIZE);
        self
    }

    /// Append a CRC32 trailer to every frame.
    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    /// Maximum frame size.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Whether frames carry a CRC32 trailer.
    pub fn has_checksum(&self) -> bool {
        self.checksum
    }

    fn body_len(&self, payload_len: usize) -> usize {
        payload_len + if self.checksum { CRC_SIZE } else { 0 }
    }

    /// Frame `payload` for writing.
    pub fn frame(&self, payload: impl Into<Bytes>) -> Result<FrameMessage, WireError> {
        let payload = payload.into();
        let size = self.body_len(payload.len());
        if size > self.max_frame_size {
            return Err(WireError::Size {
                size,
                limit: self.max_frame_size,
            });
        }
        Ok(FrameMessage {
            codec: *self,
            payload,
            peer: None,
        })
    }

    /// Size of the complete, valid frame at the front of `buf`, or `None`
    /// if more bytes are needed.
    pub fn peek(&self, buf: &[u8]) -> Result<Option<usize>, WireError> {
        if buf.len() < LEN_SIZE {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if frame_len > self.max_frame_size {
            return Err(WireError::Size {
                size: frame_len,
                limit: self.max_frame_size,
            });
        }
        if self.checksum && frame_len < CRC_SIZE {
            return Err(WireError::Malformed("frame shorter than its checksum"));
        }
        let total = LEN_SIZE + frame_len;
        if buf.len() < total {
            return Ok(None);
        }
        if self.checksum {
            let payload = &buf[LEN_SIZE..total - CRC_SIZE];
            let trailer = &buf[total - CRC_SIZE..total];
            let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
            let actual = crc32fast::hash(payload);
            if expected != actual {
                return Err(WireError::Checksum { expected, actual });
            }
        }
        Ok(Some(total))
    }

    /// Take one frame's payload off the front of `buf`.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        let Some(total) = self.peek(buf)? else {
            return Ok(None);
        };
        let mut frame = buf.split_to(total);
        frame.advance(LEN_SIZE);
        if self.checksum {
            frame.truncate(frame.len() - CRC_SIZE);
        }
        Ok(Some(frame.freeze()))
    }
}

/// One length-prefixed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMessage {
    codec: FrameCodec,
    payload: Bytes,
    peer: Option<SocketAddr>,
}

impl FrameMessage {
    /// Empty message to be filled by [`Message::read_from`].
    pub fn empty(codec: FrameCodec) -> Self {
        Self {
            codec,
            payload: Bytes::new(),
            peer: None,
        }
    }

    /// Set the destination for unconnected datagram sessions.
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer = Some(addr);
        self
    }

    /// Frame payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Bytes on the wire, prefix and trailer included.
    pub fn encoded_size(&self) -> usize {
        LEN_SIZE + self.codec.body_len(self.payload.len())
    }
}

impl Message for FrameMessage {
    fn read_from(&mut self, buf: &mut BytesMut) -> bool {
        match self.codec.decode(buf) {
            Ok(Some(payload)) => {
                self.payload = payload;
                true
            }
            _ => false,
        }
    }

    fn to_segments(&self) -> Segments {
        let len = self.codec.body_len(self.payload.len()) as u32;
        let prefix = Bytes::copy_from_slice(&len.to_be_bytes());
        if self.codec.checksum {
            let trailer = Bytes::copy_from_slice(&crc32fast::hash(&self.payload).to_be_bytes());
            smallvec![prefix, self.payload.clone(), trailer]
        } else {
            smallvec![prefix, self.payload.clone()]
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn set_peer_addr(&mut self, addr: SocketAddr) {
        self.peer = Some(addr);
    }
}

/// Recognizes [`FrameMessage`]s.
///
/// An oversized or corrupt frame is reported as a recognizer error. The
/// stream cannot resynchronise after that, so listeners usually close the
/// session when they see it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthPrefixedRecognizer {
    codec: FrameCodec,
}

impl LengthPrefixedRecognizer {
    /// Recognizer for frames laid out by `codec`.
    pub fn new(codec: FrameCodec) -> Self {
        Self { codec }
    }

    /// The codec in use.
    pub fn codec(&self) -> FrameCodec {
        self.codec
    }
}

impl MessageRecognizer for LengthPrefixedRecognizer {
    fn recognize(&self, session: &Session, buf: &[u8]) -> anyhow::Result<Option<Box<dyn Message>>> {
        match self.codec.peek(buf) {
            Ok(Some(total)) => {
                trace!("Session {} has a {} byte frame", session.id(), total);
                Ok(Some(Box::new(FrameMessage::empty(self.codec))))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                debug!("Session {} sent an invalid frame: {}", session.id(), e);
                Err(e.into())
            }
        }
    }
}
