//! Event-driven sessions over TCP, UDP, TLS, multicast and in-process pipes.
//!
//! This crate provides the session layer of netio: a uniform lifecycle and
//! listener model on top of non-blocking transports multiplexed by event
//! generator threads.
//!
//! ## Features
//!
//! - **Sessions**: TCP, UDP, pipe, listener, TLS and multicast kinds sharing
//!   one API for start, close, write and configuration
//! - **Event Generators**: `mio` readiness loops on dedicated threads with
//!   periodic idle and timeout sweeps
//! - **Dispatchers**: inline or pooled delivery of listener callbacks, with
//!   optional per-session ordering
//! - **Recognizers**: pluggable framing from read buffers to messages
//! - **Statistics**: byte counters and throughput per session
//! - **TLS**: `rustls` engine with writes held until the handshake completes
//!   (feature `tls`)
//!
//! ## Example
//!
//! ```rust,no_run
//! use netio_session::{ByteArrayMessage, MessageRef, Session, SessionListener};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl SessionListener for Echo {
//!     fn message_received(&self, session: &Session, message: &MessageRef) -> anyhow::Result<()> {
//!         session.write(Arc::clone(message))?;
//!         Ok(())
//!     }
//! }
//!
//! # fn example() -> anyhow::Result<()> {
//! let session = Session::tcp();
//! session.set_remote_addr("127.0.0.1:9000".parse()?)?;
//! session.add_session_listener(Arc::new(Echo));
//! session.start(true)?;
//! session.write(Arc::new(ByteArrayMessage::new(&b"hello"[..])))?;
//! session.close(true);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acceptor;
pub mod config;
pub mod dispatcher;
mod engine;
pub mod error;
pub mod event;
pub mod generator;
pub mod listener;
pub mod message;
pub mod recognizer;
pub mod registry;
pub mod session;
mod simulated;
pub mod snapshot;
pub mod statistic;
#[cfg(feature = "tls")]
pub mod tls;
mod transport;
pub mod write_queue;

pub use acceptor::{SessionFactory, SimpleSessionFactory};
pub use config::Defaults;
pub use dispatcher::{Dispatcher, PooledDispatcher, SimpleDispatcher, Task};
pub use error::{Result, SessionError};
pub use generator::{EventGenerator, GeneratorSnapshot};
pub use listener::{SessionListener, StatisticListener};
pub use message::{ByteArrayMessage, Message, MessageRef, Segments};
pub use recognizer::{ByteArrayRecognizer, MessageRecognizer, MessageRecognizerChain};
pub use session::{Attachment, Session, SessionKind, WeakSession};
pub use snapshot::SessionSnapshot;
pub use statistic::{SessionStatistic, StatisticSnapshot};
pub use write_queue::WriteReceipt;

#[cfg(feature = "tls")]
pub use rustls;
#[cfg(feature = "tls")]
pub use tls::TlsRole;
