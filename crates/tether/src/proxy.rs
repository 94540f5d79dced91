//! # Proxy Streams
//!
//! Lets one side write into a sink that lives on the other side.
//!
//! The owner of the sink exports it and sends the resulting `RemoteWriter`
//! (a serializable handle) to the peer. The peer connects it to get a
//! `ProxyWriter`, an `io::Write` whose bytes travel as `Chunk` commands and
//! whose close travels as `Eof`.
//!
//! ## Invariants
//! - The dispatch thread never touches a sink. It queues each chunk on the
//!   sink, and a blocking worker drains that queue. A full pipe stalls only
//!   its own stream.
//! - At most one worker drains a given sink, so bytes arrive in the order
//!   they were written, followed by the close.

use std::collections::VecDeque;
use std::io;
use std::io::Write;
use std::mem;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;

use tether_pipe::Close;

use crate::channel::Channel;
use crate::command::Command;
use crate::error::Error;
use crate::error::Result;
use crate::export;
use crate::export::Handle;

/// A local byte sink that can sit behind a proxy stream.
pub trait Sink: Write + Close + Send + 'static {}

impl<T: Write + Close + Send + 'static> Sink for T {}

enum SinkOp {
    Write(Vec<u8>),
    Close,
}

#[derive(Default)]
struct SinkQueue {
    ops: VecDeque<SinkOp>,
    draining: bool,
}

/// Export-table entry for a proxied sink. Closed sinks are dropped.
pub struct StreamSink {
    inner: Mutex<Option<Box<dyn Sink>>>,
    queue: Mutex<SinkQueue>,
}

impl StreamSink {
    pub fn new(sink: impl Sink) -> Self {
        Self {
            inner: Mutex::new(Some(Box::new(sink))),
            queue: Mutex::new(SinkQueue::default()),
        }
    }

    /// Queues `op` behind everything queued before it. Returns `true` when
    /// no worker is draining and the caller has to start one.
    fn push(&self, op: SinkOp) -> bool {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.ops.push_back(op);
        !mem::replace(&mut queue.draining, true)
    }

    /// Applies queued operations until the queue is empty.
    fn drain(&self, channel: &str, handle: Handle) {
        loop {
            let op = {
                let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
                match queue.ops.pop_front() {
                    Some(op) => op,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            match op {
                SinkOp::Write(data) => {
                    if let Err(e) = self.write(&data) {
                        tracing::warn!(channel, %handle, error = %e, "stream write failed");
                    }
                }
                SinkOp::Close => {
                    if let Err(e) = self.close() {
                        tracing::warn!(channel, %handle, error = %e, "stream close failed");
                    }
                }
            }
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.as_mut() {
            Some(sink) => sink.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream is already closed")),
        }
    }

    fn close(&self) -> io::Result<()> {
        let sink = self.inner.lock().unwrap_or_else(PoisonError::into_inner).take();
        match sink {
            Some(mut sink) => {
                sink.flush()?;
                sink.close()
            }
            None => Ok(()),
        }
    }
}

/// Serializable reference to a sink exported by the sending side.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteWriter {
    handle: Handle,
}

impl RemoteWriter {
    /// Exports `sink` on `channel` so the peer can write into it.
    pub fn export(channel: &Channel, sink: impl Sink) -> Result<Self> {
        let handle = channel.exports().export_stream(Arc::new(StreamSink::new(sink)))?;
        tracing::debug!(channel = %channel.name(), %handle, "exported stream");
        Ok(Self { handle })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Turns a writer received from the peer into a connected local stand-in.
    pub fn connect(self, channel: &Channel) -> Result<ProxyWriter> {
        let mut writer = ProxyWriter::new();
        writer.connect(channel, self.handle)?;
        Ok(writer)
    }
}

/// Local stand-in for a remote sink.
///
/// Writes made before `connect` are buffered and flushed as one chunk on
/// connect.
#[derive(Default)]
pub struct ProxyWriter {
    target: Option<(Channel, Handle)>,
    buffer: Vec<u8>,
    closed: bool,
}

impl ProxyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.target.is_some()
    }

    pub fn connect(&mut self, channel: &Channel, handle: Handle) -> Result<()> {
        if self.target.is_some() {
            return Err(Error::ProtocolViolation("Cannot connect twice".into()));
        }
        self.target = Some((channel.clone(), handle));

        if !self.buffer.is_empty() {
            let data = mem::take(&mut self.buffer);
            channel.submit(Command::Chunk { handle, data })?;
        }
        if self.closed {
            channel.submit(Command::Eof { handle })?;
        }
        Ok(())
    }
}

impl Write for ProxyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream is already closed"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        match &self.target {
            Some((channel, handle)) => {
                channel.submit(Command::Chunk { handle: *handle, data: buf.to_vec() })?;
            }
            None => self.buffer.extend_from_slice(buf),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for ProxyWriter {
    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some((channel, handle)) = &self.target {
            channel.submit(Command::Eof { handle: *handle })?;
        }
        Ok(())
    }
}

impl Drop for ProxyWriter {
    fn drop(&mut self) {
        if self.target.is_some() {
            if let Err(e) = Close::close(self) {
                tracing::debug!(error = %e, "proxy writer not closed cleanly");
            }
        }
    }
}

pub(crate) fn deliver_chunk(channel: &Channel, handle: Handle, data: Vec<u8>) {
    let sink = match channel.exports().lookup_stream(handle) {
        Ok(sink) => sink,
        Err(export::Error::NotFound(_)) => {
            tracing::trace!(channel = %channel.name(), %handle, "chunk for unknown stream dropped");
            return;
        }
        Err(e) => {
            tracing::warn!(channel = %channel.name(), %handle, error = %e, "chunk for non-stream dropped");
            return;
        }
    };
    enqueue(channel, handle, sink, SinkOp::Write(data));
}

pub(crate) fn deliver_eof(channel: &Channel, handle: Handle) {
    let Ok(sink) = channel.exports().lookup_stream(handle) else {
        tracing::trace!(channel = %channel.name(), %handle, "eof for unknown stream dropped");
        return;
    };
    channel.exports().unexport(handle);
    enqueue(channel, handle, sink, SinkOp::Close);
}

fn enqueue(channel: &Channel, handle: Handle, sink: Arc<StreamSink>, op: SinkOp) {
    if !sink.push(op) {
        return;
    }
    let name = channel.name().to_string();
    channel.runtime().spawn_blocking(move || sink.drain(&name, handle));
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;

    #[test]
    fn test_write_after_close_fails_locally() {
        let mut writer = ProxyWriter::new();
        writer.write_all(b"early").unwrap();
        writer.close().unwrap();

        let err = writer.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(err.to_string(), "stream is already closed");
    }

    #[test]
    fn test_unconnected_writer_buffers() {
        let mut writer = ProxyWriter::new();
        writer.write_all(b"abc").unwrap();
        writer.write_all(b"def").unwrap();
        assert!(!writer.is_connected());
        assert_eq!(writer.buffer, b"abcdef");
    }

    #[test]
    fn test_stream_sink_closes_once() {
        let sink = Arc::new(StreamSink::new(Vec::new()));
        sink.write(b"data").unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
        assert!(sink.write(b"more").is_err());
    }

    #[test]
    fn test_queued_ops_apply_in_order() {
        let (writer, mut reader) = tether_pipe::pipe_with(64, std::time::Duration::from_millis(10));
        let sink = StreamSink::new(writer);

        assert!(sink.push(SinkOp::Write(b"first ".to_vec())));
        assert!(!sink.push(SinkOp::Write(b"second".to_vec())));
        assert!(!sink.push(SinkOp::Close));
        sink.drain("unit", Handle(1));

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "first second");

        // The next push finds nobody draining.
        assert!(sink.push(SinkOp::Write(b"late".to_vec())));
    }
}
