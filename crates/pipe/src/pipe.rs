//! # Pipe Ends
//!
//! `PipeWriter` and `PipeReader` share one `Shared` block. Neither end keeps
//! the other alive; instead each end records its own state (open, closed,
//! abandoned) in the shared block, and the other end checks it on every
//! access.

use std::io;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use crate::copy::Close;
use crate::error::ClosedBy;
use crate::error::PipeError;
use crate::ring::Ring;

/// Buffer size used by [`pipe`].
pub const DEFAULT_CAPACITY: usize = 0x10000;

/// Upper bound on how long a blocked end sleeps before re-checking its peer.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
enum End {
    Open,
    Closed(ClosedBy),
    Abandoned,
}

struct State {
    ring: Ring,
    writer: End,
    reader: End,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    poll: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        match self.cond.wait_timeout(guard, self.poll) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}

/// Creates a connected pipe with the default capacity and poll interval.
pub fn pipe() -> (PipeWriter, PipeReader) {
    pipe_with(DEFAULT_CAPACITY, DEFAULT_POLL_INTERVAL)
}

/// Creates a connected pipe with an explicit capacity and poll interval.
///
/// # Panics
/// Panics if `capacity` is zero.
pub fn pipe_with(capacity: usize, poll: Duration) -> (PipeWriter, PipeReader) {
    assert!(capacity > 0, "pipe capacity must be non-zero");

    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            ring: Ring::new(capacity),
            writer: End::Open,
            reader: End::Open,
        }),
        cond: Condvar::new(),
        poll,
    });

    let writer = PipeWriter { shared: Arc::clone(&shared) };
    let reader = PipeReader { shared };
    (writer, reader)
}

/// The writing end of a pipe.
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Bytes currently buffered and not yet read.
    pub fn available(&self) -> usize {
        self.shared.lock().ring.available()
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().ring.capacity()
    }

    /// Signals end-of-stream to the reader. Buffered data stays readable.
    #[track_caller]
    pub fn close(&mut self) -> io::Result<()> {
        let by = ClosedBy::here();
        let mut state = self.shared.lock();
        if let End::Open = state.writer {
            state.writer = End::Closed(by);
            self.shared.cond.notify_all();
        }
        Ok(())
    }
}

impl Write for PipeWriter {
    /// Blocks while the buffer is full, then accepts as many bytes as fit
    /// contiguously. May write fewer bytes than requested.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.shared.lock();
        loop {
            if let End::Closed(by) = &state.writer {
                return Err(PipeError::WriterClosed(by.clone()).into());
            }
            match &state.reader {
                End::Open => {}
                End::Closed(by) => return Err(PipeError::ReaderClosed(by.clone()).into()),
                End::Abandoned => {
                    tracing::debug!("pipe write failed: reader abandoned");
                    return Err(PipeError::SinkAbandoned.into());
                }
            }

            let n = state.ring.write_from(buf);
            if n > 0 {
                self.shared.cond.notify_all();
                return Ok(n);
            }

            state = self.shared.wait(state);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for PipeWriter {
    #[track_caller]
    fn close(&mut self) -> io::Result<()> {
        PipeWriter::close(self)
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let End::Open = state.writer {
            state.writer = End::Abandoned;
            self.shared.cond.notify_all();
        }
    }
}

/// The reading end of a pipe.
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Bytes that can be read without blocking.
    pub fn available(&self) -> usize {
        self.shared.lock().ring.available()
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().ring.capacity()
    }

    /// Closes the reader. Blocked and future writes fail instead of hanging.
    #[track_caller]
    pub fn close(&mut self) -> io::Result<()> {
        let by = ClosedBy::here();
        let mut state = self.shared.lock();
        if let End::Open = state.reader {
            state.reader = End::Closed(by);
            self.shared.cond.notify_all();
        }
        Ok(())
    }
}

impl Read for PipeReader {
    /// Blocks while the buffer is empty. Returns `Ok(0)` once the writer has
    /// closed and every buffered byte has been consumed.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.shared.lock();
        loop {
            if let End::Closed(by) = &state.reader {
                return Err(PipeError::ReaderClosed(by.clone()).into());
            }

            let n = state.ring.read_into(buf);
            if n > 0 {
                self.shared.cond.notify_all();
                return Ok(n);
            }

            match &state.writer {
                End::Open => {}
                End::Closed(_) => return Ok(0),
                End::Abandoned => {
                    tracing::debug!("pipe read failed: writer abandoned");
                    return Err(PipeError::SourceAbandoned.into());
                }
            }

            state = self.shared.wait(state);
        }
    }
}

impl Close for PipeReader {
    #[track_caller]
    fn close(&mut self) -> io::Result<()> {
        PipeReader::close(self)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let End::Open = state.reader {
            state.reader = End::Abandoned;
            self.shared.cond.notify_all();
        }
    }
}
