//! # Export Scopes
//!
//! Objects often need to be exported only for the duration of one call: a
//! reference passed as an argument, or a writer the peer streams into while
//! it works. An `ExportScope` records the handles it exports and releases
//! each of them once, when the call it is attached to finishes, is
//! cancelled, or is dropped.
//!
//! ## Invariants
//! - A scope releases exactly one reference per export it made. Objects that
//!   were also exported outside the scope stay exported.
//! - Releasing is idempotent; handles already gone are skipped.

use std::mem;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use tether_pipe::PipeReader;

use crate::channel::Channel;
use crate::error::Result;
use crate::export::Handle;
use crate::export::RemoteRef;
use crate::invoke::Invocable;
use crate::proxy::RemoteWriter;

/// Handles exported on behalf of a single call.
pub struct ExportScope {
    channel: Channel,
    handles: Mutex<Vec<Handle>>,
}

impl ExportScope {
    pub(crate) fn new(channel: Channel) -> Self {
        Self { channel, handles: Mutex::new(Vec::new()) }
    }

    fn record(&self, handle: Handle) -> Handle {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
        handle
    }

    pub fn export_object<T: Send + Sync + 'static>(&self, object: Arc<T>) -> Result<RemoteRef<T>> {
        let reference = self.channel.export_object(object)?;
        self.record(reference.handle());
        Ok(reference)
    }

    pub fn export_invocable(&self, object: Arc<dyn Invocable>) -> Result<Handle> {
        let handle = self.channel.export_invocable(object)?;
        Ok(self.record(handle))
    }

    /// Like `Channel::open_pipe`. A writer the peer never closes is released
    /// with the scope, which abandons the reader.
    pub fn open_pipe(&self, capacity: usize) -> Result<(RemoteWriter, PipeReader)> {
        let (writer, reader) = self.channel.open_pipe(capacity)?;
        self.record(writer.handle());
        Ok((writer, reader))
    }

    /// Handles exported through this scope and not yet released.
    pub fn handles(&self) -> Vec<Handle> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Releases every recorded export now.
    pub fn release(&self) {
        let handles = mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        if handles.is_empty() {
            return;
        }
        tracing::trace!(channel = %self.channel.name(), count = handles.len(), "releasing scoped exports");
        for handle in handles {
            self.channel.unexport(handle);
        }
    }
}

impl Drop for ExportScope {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ExportScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportScope")
            .field("channel", &self.channel.name())
            .field("handles", &self.handles())
            .finish()
    }
}
