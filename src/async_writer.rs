//! A single-background-thread, hand-off byte-stream writer.
//!
//! Producers enqueue immutable byte chunks onto a bounded FIFO; a single
//! worker thread drains the queue and writes each chunk to the sink in
//! enqueue order. `close` and `flush` are themselves multiplexed onto the
//! same queue as tagged sentinels rather than encoded as zero-length or
//! negative-offset data chunks, so the termination signal can never be
//! confused with an actual write.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::{SinkError, SinkResult};
use crate::sink::ByteSink;

/// Queue capacity for the async hand-off writer.
const QUEUE_CAPACITY: usize = 64;
/// Upper bound on how many ready chunks the worker drains in one batch.
const DRAIN_BATCH_CAP: usize = 128;

enum Chunk {
    Data(Bytes),
    Flush(oneshot::Sender<()>),
    Close,
}

/// An asynchronous hand-off writer: `write` enqueues a copy of the given
/// bytes and returns immediately (blocking only if the internal queue is
/// full); a background thread drains the queue onto the sink in order.
pub struct AsyncWriter {
    tx: Sender<Chunk>,
    worker: Option<JoinHandle<()>>,
    closed: bool,
    error: std::sync::Arc<Mutex<Option<SinkError>>>,
}

impl AsyncWriter {
    /// Spawn the worker thread and construct a writer in front of `sink`.
    pub fn new<S: ByteSink + 'static>(sink: S) -> Self {
        let (tx, rx) = flume::bounded(QUEUE_CAPACITY);
        let error = std::sync::Arc::new(Mutex::new(None));
        let worker_error = std::sync::Arc::clone(&error);
        let worker = thread::spawn(move || Self::run(rx, sink, worker_error));
        Self { tx, worker: Some(worker), closed: false, error }
    }

    fn latched_error(&self) -> Option<SinkError> {
        self.error.lock().clone()
    }

    fn check_open(&self) -> SinkResult<()> {
        if self.closed {
            return Err(SinkError::AlreadyClosed);
        }
        if let Some(e) = self.latched_error() {
            return Err(e);
        }
        Ok(())
    }

    /// Write `buf`. A zero-length buffer is silently dropped without being
    /// enqueued, so it is never mistaken for the close sentinel.
    pub fn write(&mut self, buf: &[u8]) -> SinkResult<()> {
        self.check_open()?;
        if buf.is_empty() {
            return Ok(());
        }
        self.tx.send(Chunk::Data(Bytes::copy_from_slice(buf))).map_err(|_| SinkError::ChannelSend)
    }

    /// Write `&buf[off..off + len]`, with the same zero-length short-circuit
    /// as [`AsyncWriter::write`].
    pub fn write_range(&mut self, buf: &[u8], off: usize, len: usize) -> SinkResult<()> {
        self.write(&buf[off..off + len])
    }

    /// Write a single byte.
    pub fn write_byte(&mut self, b: u8) -> SinkResult<()> {
        self.write(&[b])
    }

    /// Best-effort documented improvement over a no-op: enqueues a flush
    /// sentinel and blocks until the worker has passed it, so the sink has
    /// actually been flushed by the time this returns.
    pub fn flush(&mut self) -> SinkResult<()> {
        self.check_open()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx.send(Chunk::Flush(ack_tx)).map_err(|_| SinkError::ChannelSend)?;
        ack_rx.recv().map_err(|_| SinkError::ChannelReceive)
    }

    /// Enqueue the close sentinel and join the worker thread, so `close`
    /// only returns once the sink has been flushed and closed.
    pub fn close(mut self) -> SinkResult<()> {
        self.close_mut()
    }

    fn close_mut(&mut self) -> SinkResult<()> {
        if self.closed {
            return Err(SinkError::AlreadyClosed);
        }
        self.closed = true;
        self.tx.send(Chunk::Close).map_err(|_| SinkError::ChannelSend)?;
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("async writer worker thread panicked");
            }
        }
        if let Some(e) = self.latched_error() {
            return Err(e);
        }
        Ok(())
    }

    fn run<S: ByteSink>(rx: Receiver<Chunk>, mut sink: S, error: std::sync::Arc<Mutex<Option<SinkError>>>) {
        debug!("async writer worker started");
        'outer: while let Ok(first) = rx.recv() {
            let mut batch = vec![first];
            while batch.len() < DRAIN_BATCH_CAP {
                match rx.try_recv() {
                    Ok(chunk) => batch.push(chunk),
                    Err(_) => break,
                }
            }

            for chunk in batch {
                match chunk {
                    Chunk::Data(bytes) => {
                        if let Err(e) = sink.write_all(&bytes) {
                            warn!(error = %e, "async writer sink write failed");
                            *error.lock() = Some(SinkError::from(e));
                            let _ = sink.close();
                            break 'outer;
                        }
                    }
                    Chunk::Flush(ack) => {
                        let _ = ack.send(());
                    }
                    Chunk::Close => {
                        if let Err(e) = sink.flush() {
                            warn!(error = %e, "async writer final flush failed");
                            *error.lock() = Some(SinkError::from(e));
                        }
                        if let Err(e) = sink.close() {
                            warn!(error = %e, "async writer sink close failed");
                            *error.lock() = Some(SinkError::from(e));
                        }
                        break 'outer;
                    }
                }
            }

            if let Err(e) = sink.flush() {
                warn!(error = %e, "async writer batch flush failed");
                *error.lock() = Some(SinkError::from(e));
                let _ = sink.close();
                break;
            }
        }
        debug!("async writer worker stopped");
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::test_support::VecSink;
    use std::thread::sleep;

    #[test]
    fn writes_in_order_then_flush_and_close() {
        let sink = VecSink::new();
        let mut writer = AsyncWriter::new(sink.clone());
        for b in b"abcdefg" {
            writer.write_byte(*b).unwrap();
        }
        writer.close().unwrap();

        assert_eq!(sink.bytes(), b"abcdefg");
        assert!(sink.is_closed());
        assert!(sink.flush_count() >= 1);
    }

    #[test]
    fn zero_length_write_does_not_close_the_sink() {
        let sink = VecSink::new();
        let mut writer = AsyncWriter::new(sink.clone());
        writer.write(&[]).unwrap();
        writer.write(&[]).unwrap();
        sleep(Duration::from_millis(50));

        assert!(sink.bytes().is_empty());
        assert!(!sink.is_closed());

        writer.close().unwrap();
        assert!(sink.is_closed());
    }

    #[test]
    fn double_close_fails() {
        let sink = VecSink::new();
        let mut writer = AsyncWriter::new(sink);
        writer.close_mut().unwrap();
        assert!(matches!(writer.close_mut(), Err(SinkError::AlreadyClosed)));
    }

    #[test]
    fn flush_waits_for_worker_to_catch_up() {
        let sink = VecSink::new();
        let mut writer = AsyncWriter::new(sink.clone());
        writer.write(b"hello").unwrap();
        writer.flush().unwrap();
        assert_eq!(sink.bytes(), b"hello");
        writer.close().unwrap();
    }
}
