//! Readiness-driven network sessions with pluggable message codecs.
//!
//! This crate bundles the workspace members under one name:
//!
//! - [`util`]: blocking queue, worker pool, buffers and timing helpers
//! - [`session`]: sessions, event generators, dispatchers and statistics
//! - [`wire`]: framed and delimited message codecs
//!
//! The `netio` command line tool lives in the `netio-bin` crate.

pub use netio_session as session;
pub use netio_util as util;
pub use netio_wire as wire;
