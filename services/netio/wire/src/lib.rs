//! Reusable message codecs for netio sessions.
//!
//! Both codecs plug into a session through its
//! [`MessageRecognizer`](netio_session::MessageRecognizer) and write through
//! the [`Message`](netio_session::Message) contract:
//!
//! - **Length-prefixed frames**: `u32` big-endian length, payload, optional
//!   CRC32 trailer, bounded by a maximum frame size
//! - **Delimited messages**: content terminated by a fixed byte pattern,
//!   such as `\n` for text lines
//!
//! ## Example
//!
//! ```rust,no_run
//! use netio_session::Session;
//! use netio_wire::{FrameCodec, LengthPrefixedRecognizer};
//! use std::sync::Arc;
//!
//! # fn example() -> anyhow::Result<()> {
//! let codec = FrameCodec::new().with_checksum(true);
//! let session = Session::tcp();
//! session.set_message_recognizer(Arc::new(LengthPrefixedRecognizer::new(codec)))?;
//! session.set_remote_addr("127.0.0.1:9000".parse()?)?;
//! session.start(true)?;
//! session.write(Arc::new(codec.frame(&b"hello"[..])?))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod delimited;
pub mod error;
pub mod frame;

pub use delimited::{DelimitedMessage, DelimiterRecognizer, DEFAULT_MAX_LENGTH};
pub use error::WireError;
pub use frame::{
    FrameCodec, FrameMessage, LengthPrefixedRecognizer, DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE,
};
