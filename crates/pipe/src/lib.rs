//! # Fast Duplex Pipe
//!
//! A fixed-size circular byte buffer shared by exactly one writer end and
//! one reader end. It bridges blocking stream I/O into the command protocol
//! without polling: each end sleeps on a condition variable shared with its
//! counterpart and is woken as soon as the other end makes progress.
//!
//! ## Philosophy
//!
//! - **Explicit Liveness**: Each end carries a liveness flag in the shared
//!   state. Dropping an end without closing it marks it *abandoned*, and the
//!   surviving end fails on its next blocking access instead of hanging.
//! - **Bounded Waits**: Waiters wake up at least once per poll interval, so
//!   abandonment is noticed even if a wakeup is lost.
//! - **One Lock**: A single mutex guards the four ring counters and both end
//!   states together.

mod copy;
mod error;
mod pipe;
mod ring;

pub use copy::copy_thread;
pub use copy::Close;
pub use error::ClosedBy;
pub use error::PipeError;
pub use pipe::pipe;
pub use pipe::pipe_with;
pub use pipe::PipeReader;
pub use pipe::PipeWriter;
pub use pipe::DEFAULT_CAPACITY;
pub use pipe::DEFAULT_POLL_INTERVAL;
