//! # User Call Envelope
//!
//! Wraps a `Callable` for transport and carries its outcome back.
//!
//! ## Invariants
//! - `UserRequest::perform` never fails. Every problem on the receiving side
//!   (unknown type, undecodable payload, rejection, panic, unserializable
//!   result) is packaged as a failure inside the `UserResponse`.
//! - The callable runs exactly once, with its module installed as the
//!   ambient module for the duration of the call.

use std::any::Any;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use tether_wire::Encoding;

use crate::callable::CallContext;
use crate::callable::Callable;
use crate::channel::Channel;
use crate::context;
use crate::context::AmbientGuard;
use crate::error::Error;
use crate::request::RequestId;

/// Why a call failed on the remote side without producing the callable's
/// own error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The callable's error could not be transmitted; this is a stand-in
    /// carrying its message and source chain.
    Proxy,
    Panicked,
    /// Refused because the channel is restricted.
    Rejected,
    /// No callable with the requested tag in the resolved module.
    Unresolvable,
    /// The callable or its result could not be (de)serialized.
    Unserializable,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Proxy => "proxied error",
            Self::Panicked => "panic",
            Self::Rejected => "rejected",
            Self::Unresolvable => "unresolvable",
            Self::Unserializable => "unserializable",
        };
        f.write_str(s)
    }
}

/// A failure reconstructed from the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub type_name: String,
    pub message: String,
    /// Messages of the original error's `source()` chain, outermost first.
    pub trace: Vec<String>,
}

impl RemoteFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, type_name: String::new(), message: message.into(), trace: Vec::new() }
    }

    /// Captures an error that cannot cross the wire as itself.
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        let mut trace = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }
        Self {
            kind: FailureKind::Proxy,
            type_name: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
            trace,
        }
    }

    fn from_panic(payload: Box<dyn Any + Send>, description: &str) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(FailureKind::Panicked, format!("{} panicked: {}", description, detail))
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.type_name.is_empty() {
            write!(f, "Remote {}: {}", self.kind, self.message)?;
        } else {
            write!(f, "Remote {} ({}): {}", self.kind, self.type_name, self.message)?;
        }
        for cause in &self.trace {
            write!(f, "\n  caused by: {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteFailure {}

/// Outcome of a remote call as seen by the caller.
#[derive(Debug)]
pub enum CallError<E> {
    /// The callable returned its own error.
    Remote(E),
    /// The remote side failed the call without a typed error.
    Failure(RemoteFailure),
    /// The call never completed on this channel.
    Channel(Error),
}

impl<E> CallError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Channel(Error::Cancelled))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Failure(f) if f.kind == FailureKind::Rejected)
    }

    pub fn remote(self) -> Option<E> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(e) => write!(f, "{}", e),
            Self::Failure(failure) => write!(f, "{}", failure),
            Self::Channel(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CallError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Remote(e) => Some(e),
            Self::Failure(failure) => Some(failure),
            Self::Channel(e) => Some(e),
        }
    }
}

impl<E> From<Error> for CallError<E> {
    fn from(e: Error) -> Self {
        Self::Channel(e)
    }
}

/// The exceptional half of a `UserResponse`.
#[derive(Debug, Serialize, Deserialize)]
enum Failure {
    /// Serialized `Callable::Error`.
    User(Vec<u8>),
    Remote(RemoteFailure),
}

/// A callable in transit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRequest {
    payload: Vec<u8>,
    context: Option<String>,
    description: String,
}

impl UserRequest {
    /// Serializes `callable` with the channel's negotiated encoding.
    pub fn new<C: Callable>(channel: &Channel, callable: &C) -> Result<Self, Error> {
        let context = callable
            .context()
            .or_else(|| context::current_module().map(|m| m.name().to_string()));

        let body = tether_wire::to_bytes(callable)?;
        let payload = tether_wire::encode_payload(channel.encoding(), context.as_deref(), C::NAME, body)?;

        Ok(Self { payload, context, description: callable.describe() })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Runs the callable on the receiving side.
    pub(crate) fn perform(
        &self,
        channel: &Channel,
        id: RequestId,
        cancelled: Arc<AtomicBool>,
    ) -> UserResponse {
        let modules = channel.modules();
        let encoding = channel.encoding();

        let payload = match tether_wire::decode_payload(encoding, &self.payload) {
            Ok(payload) => payload,
            Err(e) => {
                return UserResponse::failure(RemoteFailure::new(
                    FailureKind::Unserializable,
                    format!("Failed to decode {}: {}", self.description, e),
                ));
            }
        };

        let context = match encoding {
            Encoding::MultiContext => payload.module.as_deref().or(self.context.as_deref()),
            Encoding::Simple => self.context.as_deref(),
        };

        let Some(module) = modules.resolve(context) else {
            return UserResponse::failure(RemoteFailure::new(
                FailureKind::Unresolvable,
                format!("No module named {:?} for {}", context.unwrap_or_default(), self.description),
            ));
        };

        let Some(registration) = module.lookup(&payload.tag) else {
            return UserResponse::failure(RemoteFailure::new(
                FailureKind::Unresolvable,
                format!("No callable {:?} in module {:?}", payload.tag, module.name()),
            ));
        };

        if channel.is_restricted() && !registration.is_proxy_invocation() {
            tracing::warn!(channel = %channel.name(), %id, call = %self.description, "rejected call on restricted channel");
            return UserResponse::failure(RemoteFailure::new(
                FailureKind::Rejected,
                format!(
                    "Execution of {} is prohibited because the channel is restricted",
                    self.description
                ),
            ));
        }

        let ctx = CallContext::new(channel.clone(), module.clone(), id, cancelled);
        let _guard = AmbientGuard::enter(module);
        (registration.invoke)(&payload.body, &ctx)
    }
}

/// Result or failure of a callable, in transit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    payload: Vec<u8>,
    is_exception: bool,
}

impl UserResponse {
    fn value(payload: Vec<u8>) -> Self {
        Self { payload, is_exception: false }
    }

    fn exception(failure: &Failure) -> Self {
        match tether_wire::to_bytes(failure) {
            Ok(payload) => Self { payload, is_exception: true },
            // Only a RemoteFailure of plain strings reaches here, which always encodes.
            Err(e) => {
                tracing::error!(error = %e, "failed to encode call failure");
                Self { payload: Vec::new(), is_exception: true }
            }
        }
    }

    pub(crate) fn failure(failure: RemoteFailure) -> Self {
        Self::exception(&Failure::Remote(failure))
    }

    pub fn is_exception(&self) -> bool {
        self.is_exception
    }

    /// Decodes the outcome into the caller's types.
    pub fn retrieve<T, E>(&self) -> Result<T, CallError<E>>
    where
        T: DeserializeOwned,
        E: DeserializeOwned,
    {
        if !self.is_exception {
            return tether_wire::from_bytes(&self.payload).map_err(|e| CallError::Channel(e.into()));
        }

        let failure: Failure =
            tether_wire::from_bytes(&self.payload).map_err(|e| CallError::Channel(e.into()))?;
        match failure {
            Failure::User(bytes) => match tether_wire::from_bytes::<E>(&bytes) {
                Ok(e) => Err(CallError::Remote(e)),
                Err(e) => Err(CallError::Failure(RemoteFailure::new(
                    FailureKind::Unserializable,
                    format!("Failed to decode remote error: {}", e),
                ))),
            },
            Failure::Remote(failure) => Err(CallError::Failure(failure)),
        }
    }
}

/// Decodes and runs one callable type. Stored as a plain function pointer in
/// each module registration.
pub(crate) fn invoke_erased<C: Callable>(body: &[u8], ctx: &CallContext) -> UserResponse {
    let callable: C = match tether_wire::from_bytes(body) {
        Ok(c) => c,
        Err(e) => {
            return UserResponse::failure(RemoteFailure::new(
                FailureKind::Unserializable,
                format!("Failed to deserialize {}: {}", C::NAME, e),
            ));
        }
    };

    let description = callable.describe();
    tracing::trace!(id = %ctx.request_id(), call = %description, module = ctx.module_name(), "executing");

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| callable.call(ctx))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            tracing::warn!(id = %ctx.request_id(), call = %description, "callable panicked");
            return UserResponse::failure(RemoteFailure::from_panic(payload, &description));
        }
    };

    match outcome {
        Ok(value) => match tether_wire::to_bytes(&value) {
            Ok(bytes) => UserResponse::value(bytes),
            Err(e) => UserResponse::failure(RemoteFailure::new(
                FailureKind::Unserializable,
                format!("Failed to serialize the result of {}: {}", description, e),
            )),
        },
        Err(error) => match tether_wire::to_bytes(&error) {
            Ok(bytes) => UserResponse::exception(&Failure::User(bytes)),
            Err(_) => UserResponse::failure(RemoteFailure::from_error(&error)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Oops(String);

    impl std::fmt::Display for Oops {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "oops: {}", self.0)
        }
    }

    impl std::error::Error for Oops {}

    #[derive(Debug)]
    struct Outer(Oops);

    impl std::fmt::Display for Outer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "outer failed")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_value_response_retrieves() {
        let response = UserResponse::value(tether_wire::to_bytes(&42u32).unwrap());
        assert!(!response.is_exception());
        assert_eq!(response.retrieve::<u32, Oops>().unwrap(), 42);
    }

    #[test]
    fn test_user_error_keeps_its_type() {
        let bytes = tether_wire::to_bytes(&Oops("disk".into())).unwrap();
        let response = UserResponse::exception(&Failure::User(bytes));
        match response.retrieve::<u32, Oops>() {
            Err(CallError::Remote(e)) => assert_eq!(e, Oops("disk".into())),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_remote_failure_passes_through() {
        let response = UserResponse::failure(RemoteFailure::new(FailureKind::Rejected, "nope"));
        let err = response.retrieve::<u32, Oops>().unwrap_err();
        assert!(err.is_rejected());
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_from_error_captures_source_chain() {
        let failure = RemoteFailure::from_error(&Outer(Oops("root".into())));
        assert_eq!(failure.kind, FailureKind::Proxy);
        assert_eq!(failure.message, "outer failed");
        assert_eq!(failure.trace, vec!["oops: root".to_string()]);
        assert!(failure.type_name.ends_with("Outer"));
    }

    #[test]
    fn test_panic_payload_message() {
        let failure = RemoteFailure::from_panic(Box::new("boom"), "test.call");
        assert_eq!(failure.kind, FailureKind::Panicked);
        assert!(failure.message.contains("boom"));

        let failure = RemoteFailure::from_panic(Box::new(String::from("owned boom")), "test.call");
        assert!(failure.message.contains("owned boom"));
    }
}
