//! # Commands
//!
//! Everything that crosses a channel is a `Command`. The receiving side
//! decodes each one and executes it exactly once on its dispatch thread, in
//! the order the peer submitted them.
//!
//! Execution never blocks the dispatch thread on user code: requests are
//! handed to the worker pool, everything else is a table update or a write
//! into a local sink.

use serde::Deserialize;
use serde::Serialize;

use crate::channel::Channel;
use crate::error::Result;
use crate::export::Handle;
use crate::proxy;
use crate::request::Request;
use crate::request::RequestBody;
use crate::request::RequestId;
use crate::request::Response;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Run something and answer with a `Response` under the same id.
    Request(Request),
    Response(Response),
    /// Bytes for the stream exported under `handle`.
    Chunk { handle: Handle, data: Vec<u8> },
    /// The stream exported under `handle` is finished.
    Eof { handle: Handle },
    /// The requester no longer wants the outcome of `id`.
    Cancel { id: RequestId },
    /// Ask the receiver to reclaim unused resources.
    Collect,
    /// The sender is shutting the channel down.
    Close,
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(tether_wire::to_bytes(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(tether_wire::from_bytes(bytes)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(r) => match r.body {
                RequestBody::User(_) => "request",
                RequestBody::Ping => "ping",
            },
            Self::Response(_) => "response",
            Self::Chunk { .. } => "chunk",
            Self::Eof { .. } => "eof",
            Self::Cancel { .. } => "cancel",
            Self::Collect => "collect",
            Self::Close => "close",
        }
    }

    /// Runs the command against the channel it arrived on.
    pub(crate) fn execute(self, channel: &Channel) {
        tracing::trace!(channel = %channel.name(), command = self.kind(), "executing");
        match self {
            Self::Request(request) => channel.spawn_request(request),
            Self::Response(response) => {
                channel.pending().complete(response.id, response.outcome);
            }
            Self::Chunk { handle, data } => proxy::deliver_chunk(channel, handle, data),
            Self::Eof { handle } => proxy::deliver_eof(channel, handle),
            Self::Cancel { id } => channel.cancel_inbound(id),
            Self::Collect => channel.run_collect_hook(),
            Self::Close => channel.terminate(None),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request(r) => write!(f, "{}#{}", self.kind(), r.id),
            Self::Response(r) => write!(f, "response#{}", r.id),
            Self::Chunk { handle, data } => write!(f, "chunk({}, {} bytes)", handle, data.len()),
            Self::Eof { handle } => write!(f, "eof({})", handle),
            Self::Cancel { id } => write!(f, "cancel#{}", id),
            Self::Collect => write!(f, "collect"),
            Self::Close => write!(f, "close"),
        }
    }
}
