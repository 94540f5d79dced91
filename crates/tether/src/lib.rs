//! # Tether
//!
//! A bidirectional remote-execution channel. Two endpoints exchange
//! serialized commands that execute on the receiving side: calls and their
//! responses, stream chunks, and object lifecycle events.
//!
//! ## Architecture
//!
//! - **Command**: the unit of traffic, executed once by the receiver's
//!   dispatch thread in arrival order.
//! - **Request / Response**: call-and-wait correlation keyed by a
//!   per-channel monotonic id.
//! - **User Call Envelope**: carries an arbitrary `Callable` plus the module
//!   context needed to decode it, and carries back a value or a failure.
//! - **Export Table**: integer handles for local objects the peer may refer to.
//! - **Proxy Stream**: a remote stand-in for a local writer, built from
//!   commands and the export table.
//! - **Export Scope**: exports tied to one call and released with it.
//! - **Channel**: owns all of the above for one pair of endpoints.

pub mod call;
pub mod callable;
pub mod channel;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod export;
pub mod invoke;
pub mod module;
pub mod proxy;
pub mod request;
pub mod scope;
pub mod transport;

pub use call::CallError;
pub use call::FailureKind;
pub use call::RemoteFailure;
pub use callable::CallContext;
pub use callable::Callable;
pub use channel::Channel;
pub use command::Command;
pub use config::ChannelBuilder;
pub use config::ChannelConfig;
pub use error::Error;
pub use error::Result;
pub use export::ExportTable;
pub use export::Handle;
pub use export::RemoteRef;
pub use invoke::Invocable;
pub use invoke::InvocationError;
pub use module::Module;
pub use module::ModuleSet;
pub use proxy::ProxyWriter;
pub use proxy::Sink;
pub use proxy::RemoteWriter;
pub use request::CallAbort;
pub use request::CallFuture;
pub use request::RequestId;
pub use request::RequestState;
pub use scope::ExportScope;
pub use transport::DuplexChannelTransport;
pub use transport::StreamTransport;
pub use transport::Transport;

pub use tether_pipe::Close;
pub use tether_pipe::PipeReader;
pub use tether_pipe::PipeWriter;
pub use tether_wire::Capability;
