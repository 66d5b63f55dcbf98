//! Concurrent byte-stream sink primitives.
//!
//! # Overview
//!
//! This crate provides four independent components for scenarios where many
//! producers push bytes into a sink and a naive mutex-guarded buffered
//! writer becomes the bottleneck:
//!
//! - [`blocking_queue`] — a blocking `put`/`take` adapter over a bounded
//!   lock-free MPMC ring.
//! - [`async_writer`] — a single-background-thread hand-off writer: `write`
//!   enqueues a copy of the bytes and returns, a worker thread drains the
//!   queue onto the sink.
//! - [`striped_writer`] — a striped, compare-and-swap buffered writer: N
//!   stripes each own a byte buffer and a claim/publish counter pair, letting
//!   many producers fill a buffer in parallel without mutual exclusion.
//! - [`gzip_writer`] — a parallel gzip writer: a pool of compressor threads
//!   deflates chunks concurrently while a single writer thread drains the
//!   results in submission order, producing one valid gzip stream.
//!
//! None of the four share data structures; they share only idioms —
//! immutable chunk hand-off, sleep-spin polling, and tagged sentinel
//! messages multiplexed onto data queues.
//!
//! Every component writes against the [`ByteSink`] trait, and every fallible
//! operation returns [`SinkError`].
//!
//! # Example
//!
//! ```rust
//! use std::io::Write;
//! use multiwriter::{async_writer::AsyncWriter, sink::test_support::VecSink};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sink = VecSink::new();
//! let mut writer = AsyncWriter::new(sink.clone());
//! writer.write_all(b"hello, world")?;
//! writer.close()?;
//! assert_eq!(sink.bytes(), b"hello, world");
//! # Ok(())
//! # }
//! ```
#![deny(unsafe_code)]
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc, clippy::must_use_candidate)]

// The striped writer needs raw pointer access into a shared buffer whose
// disjointness is guaranteed by the claim/publish protocol rather than by
// the type system, so it alone is exempted from the crate-wide ban.
#[allow(unsafe_code)]
pub mod striped_writer;

pub mod async_writer;
pub mod blocking_queue;
pub mod error;
pub mod gzip_writer;
pub mod sink;

pub use async_writer::AsyncWriter;
pub use blocking_queue::{BlockingQueue, CancelToken};
pub use error::{SinkError, SinkResult};
pub use gzip_writer::{GzipWriter, GzipWriterBuilder};
pub use sink::ByteSink;
pub use striped_writer::StripedWriter;
