//! # Remote Invocation
//!
//! Exported objects implementing `Invocable` can have methods called on them
//! by the peer through the built-in `Invoke` callable. Arguments and results
//! travel as encoded bytes; the helpers below do the encoding on each side.

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::callable::CallContext;
use crate::callable::Callable;
use crate::export;
use crate::export::Handle;

/// An object whose methods the peer may call by name.
pub trait Invocable: Send + Sync + 'static {
    /// Interface name checked against the allow-list of restricted channels.
    fn interface(&self) -> &str;

    fn invoke(&self, method: &str, args: &[u8], ctx: &CallContext) -> Result<Vec<u8>, InvocationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationError {
    NoSuchMethod { interface: String, method: String },
    BadArguments(String),
    /// The handle does not resolve to a usable invocable.
    Unavailable(String),
    Rejected(String),
    /// The method ran and reported an error.
    Failed(String),
}

impl std::fmt::Display for InvocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchMethod { interface, method } => {
                write!(f, "No method {} on interface {}", method, interface)
            }
            Self::BadArguments(msg) => write!(f, "Bad arguments: {}", msg),
            Self::Unavailable(msg) => write!(f, "Target unavailable: {}", msg),
            Self::Rejected(msg) => write!(f, "{}", msg),
            Self::Failed(msg) => write!(f, "Invocation failed: {}", msg),
        }
    }
}

impl std::error::Error for InvocationError {}

impl InvocationError {
    pub fn no_such_method(interface: &str, method: &str) -> Self {
        Self::NoSuchMethod { interface: interface.to_string(), method: method.to_string() }
    }
}

/// Decodes the arguments an `Invocable` received.
pub fn decode_args<A: DeserializeOwned>(args: &[u8]) -> Result<A, InvocationError> {
    tether_wire::from_bytes(args).map_err(|e| InvocationError::BadArguments(e.to_string()))
}

/// Encodes the value an `Invocable` returns.
pub fn encode_result<R: Serialize>(value: &R) -> Result<Vec<u8>, InvocationError> {
    tether_wire::to_bytes(value).map_err(|e| InvocationError::Failed(e.to_string()))
}

/// Calls `method` on the object exported under `handle` by the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoke {
    pub handle: Handle,
    pub method: String,
    pub args: Vec<u8>,
}

impl Callable for Invoke {
    type Output = Vec<u8>;
    type Error = InvocationError;
    const NAME: &'static str = "tether.invoke";

    fn call(self, ctx: &CallContext) -> Result<Vec<u8>, InvocationError> {
        let target = ctx.channel().exports().lookup_invocable(self.handle).map_err(|e| match e {
            export::Error::Rejected { .. } => InvocationError::Rejected(e.to_string()),
            other => InvocationError::Unavailable(other.to_string()),
        })?;
        target.invoke(&self.method, &self.args, ctx)
    }

    fn describe(&self) -> String {
        format!("{}({}.{})", Self::NAME, self.handle, self.method)
    }
}
