//! The abstract downstream byte-sink collaborator.

use std::io::{self, Write};

/// A write-only byte sink with the conventional contract: no short writes,
/// errors propagate, and the sink can be explicitly closed.
///
/// This is the concrete shape every component in this crate writes against.
/// It is deliberately a supertrait of [`Write`] rather than a blanket impl
/// over every [`Write`], because several of this crate's testable
/// properties need to observe that `close` was called distinctly from
/// `flush`.
pub trait ByteSink: Write + Send {
    /// Close the sink. Implementations should flush any internal buffering
    /// of their own before returning.
    fn close(&mut self) -> io::Result<()>;
}

impl ByteSink for std::fs::File {
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl<W: ByteSink + ?Sized> ByteSink for Box<W> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    //! An in-memory [`ByteSink`] recorder used across this crate's tests.

    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    use super::ByteSink;

    /// A `Vec<u8>`-backed sink that records flush/close counts so tests can
    /// assert on flush/close ordering.
    #[derive(Debug, Clone, Default)]
    pub struct VecSink {
        inner: Arc<Mutex<VecSinkState>>,
    }

    #[derive(Debug, Default)]
    struct VecSinkState {
        bytes: Vec<u8>,
        flushes: usize,
        closed: bool,
    }

    impl VecSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn bytes(&self) -> Vec<u8> {
            self.inner.lock().unwrap().bytes.clone()
        }

        pub fn flush_count(&self) -> usize {
            self.inner.lock().unwrap().flushes
        }

        pub fn is_closed(&self) -> bool {
            self.inner.lock().unwrap().closed
        }
    }

    impl Write for VecSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut state = self.inner.lock().unwrap();
            state.bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.lock().unwrap().flushes += 1;
            Ok(())
        }
    }

    impl ByteSink for VecSink {
        fn close(&mut self) -> io::Result<()> {
            self.inner.lock().unwrap().closed = true;
            Ok(())
        }
    }
}
