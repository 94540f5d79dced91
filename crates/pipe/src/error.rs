//! # Pipe Errors

use std::fmt;
use std::io;
use std::panic::Location;

/// Records who closed one end of a pipe, for diagnostics.
#[derive(Debug, Clone)]
pub struct ClosedBy {
    location: &'static Location<'static>,
    thread: Option<String>,
}

impl ClosedBy {
    #[track_caller]
    pub(crate) fn here() -> Self {
        Self {
            location: Location::caller(),
            thread: std::thread::current().name().map(str::to_owned),
        }
    }

    /// Source location of the `close` call.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Name of the thread that closed the end, if it had one.
    pub fn thread(&self) -> Option<&str> {
        self.thread.as_deref()
    }
}

impl fmt::Display for ClosedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location)?;
        if let Some(name) = &self.thread {
            write!(f, " on thread '{}'", name)?;
        }
        Ok(())
    }
}

/// Failures surfaced by either end of a pipe.
#[derive(Debug, Clone)]
pub enum PipeError {
    /// The reader end was dropped without being closed.
    SinkAbandoned,
    /// The writer end was dropped without being closed and no data remains.
    SourceAbandoned,
    /// The reader end was closed explicitly.
    ReaderClosed(ClosedBy),
    /// The writer end was already closed when a write was attempted.
    WriterClosed(ClosedBy),
}

impl PipeError {
    /// Extracts the pipe error carried by an `io::Error`, if any.
    pub fn from_io(err: &io::Error) -> Option<&PipeError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<PipeError>())
    }

    fn kind(&self) -> io::ErrorKind {
        match self {
            Self::SinkAbandoned => io::ErrorKind::BrokenPipe,
            Self::SourceAbandoned => io::ErrorKind::UnexpectedEof,
            Self::ReaderClosed(_) => io::ErrorKind::BrokenPipe,
            Self::WriterClosed(_) => io::ErrorKind::BrokenPipe,
        }
    }
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SinkAbandoned => write!(f, "Reader side has already been abandoned"),
            Self::SourceAbandoned => write!(f, "Writer side has already been abandoned"),
            Self::ReaderClosed(by) => write!(f, "Pipe is already closed (closed at {})", by),
            Self::WriterClosed(by) => write!(f, "Pipe writer is already closed (closed at {})", by),
        }
    }
}

impl std::error::Error for PipeError {}

impl From<PipeError> for io::Error {
    fn from(e: PipeError) -> Self {
        io::Error::new(e.kind(), e)
    }
}
