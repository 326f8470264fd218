//! Foundational helpers shared by the netio crates.
//!
//! This crate has no knowledge of sessions. It provides the building blocks
//! the session layer is assembled from:
//!
//! - **Buffers**: growable read buffers and gather/scatter helpers over
//!   `Bytes` segments
//! - **Queues**: a blocking FIFO queue that can be interrupted
//! - **Thread pool**: a pool of worker threads, each draining its own FIFO
//!   queue, that can be resized at runtime without losing queued items
//! - **Timing**: elapsed-time and throughput (speed) tracking

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod elapsed;
pub mod pool;
pub mod queue;

pub use elapsed::{ElapsedTime, Speed};
pub use pool::QueueThreadPool;
pub use queue::BlockingQueue;
