//! # Request / Response
//!
//! Call-and-wait correlation. The caller registers a pending entry under a
//! fresh id before the request is sent; the matching response removes the
//! entry and wakes the caller.
//!
//! ## Invariants
//! - Ids are per-channel and monotonic. Registering an id that is already in
//!   flight is a protocol violation.
//! - An entry is completed at most once. A response for an id that is no
//!   longer pending (cancelled, timed out, abandoned) is dropped.
//! - Every entry still pending when the channel terminates is released with
//!   `Error::Abandoned`.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::call::CallError;
use crate::call::RemoteFailure;
use crate::call::UserRequest;
use crate::call::UserResponse;
use crate::channel::Channel;
use crate::command::Command;
use crate::error::Error;
use crate::scope::ExportScope;

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestBody {
    User(UserRequest),
    /// Answered directly by the dispatch thread.
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub body: RequestBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseBody {
    User(UserResponse),
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Result<ResponseBody, RemoteFailure>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Sent,
    Completed,
    Cancelled,
}

/// What the pending table hands the waiting caller.
#[derive(Debug)]
pub(crate) enum Completion {
    Response(Result<ResponseBody, RemoteFailure>),
    Failed(Error),
}

/// State shared between a pending entry and its future.
#[derive(Debug)]
pub(crate) struct CallShared {
    state: Mutex<RequestState>,
}

impl CallShared {
    fn new() -> Self {
        Self { state: Mutex::new(RequestState::Created) }
    }

    pub(crate) fn state(&self) -> RequestState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves forward unless a terminal state was already reached.
    pub(crate) fn advance(&self, next: RequestState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            RequestState::Completed | RequestState::Cancelled => false,
            _ => {
                *state = next;
                true
            }
        }
    }
}

struct PendingCall {
    tx: oneshot::Sender<Completion>,
    shared: Arc<CallShared>,
}

/// Calls issued by this side that await a response.
pub(crate) struct PendingCalls {
    next: AtomicU64,
    calls: DashMap<RequestId, PendingCall>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self { next: AtomicU64::new(1), calls: DashMap::new() }
    }

    pub(crate) fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, id: RequestId) -> Result<(oneshot::Receiver<Completion>, Arc<CallShared>), Error> {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(CallShared::new());

        match self.calls.entry(id) {
            Entry::Occupied(_) => {
                Err(Error::ProtocolViolation(format!("Request {} is already in flight", id)))
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingCall { tx, shared: shared.clone() });
                Ok((rx, shared))
            }
        }
    }

    /// Delivers a response. Returns `false` if nobody was waiting for it.
    pub(crate) fn complete(&self, id: RequestId, outcome: Result<ResponseBody, RemoteFailure>) -> bool {
        let Some((_, call)) = self.calls.remove(&id) else {
            tracing::trace!(%id, "dropping response with no pending request");
            return false;
        };
        if !call.shared.advance(RequestState::Completed) {
            return false;
        }
        let _ = call.tx.send(Completion::Response(outcome));
        true
    }

    /// Withdraws a call, waking its caller with `Cancelled`.
    pub(crate) fn cancel(&self, id: RequestId) -> bool {
        let Some((_, call)) = self.calls.remove(&id) else {
            return false;
        };
        call.shared.advance(RequestState::Cancelled);
        let _ = call.tx.send(Completion::Failed(Error::Cancelled));
        true
    }

    /// Forgets a call without waking anyone.
    pub(crate) fn remove(&self, id: RequestId) {
        self.calls.remove(&id);
    }

    /// Releases every pending call with the given error.
    pub(crate) fn abandon_all(&self, error: Error) {
        let ids: Vec<RequestId> = self.calls.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                call.shared.advance(RequestState::Completed);
                let _ = call.tx.send(Completion::Failed(error.clone()));
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}

/// Cancels a call from anywhere, independently of its future.
#[derive(Clone)]
pub struct CallAbort {
    id: RequestId,
    shared: Arc<CallShared>,
    channel: Channel,
}

impl CallAbort {
    /// Withdraws the call and asks the peer to skip or abandon the work.
    /// Returns `false` if the call had already finished.
    pub fn cancel(&self) -> bool {
        if !self.channel.pending().cancel(self.id) {
            return false;
        }
        tracing::debug!(channel = %self.channel.name(), id = %self.id, "cancelling request");
        if let Err(e) = self.channel.submit(Command::Cancel { id: self.id }) {
            tracing::debug!(id = %self.id, error = %e, "cancel notice not sent");
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.state() == RequestState::Cancelled
    }
}

pub(crate) type Decode<T, E> = fn(ResponseBody) -> Result<T, CallError<E>>;

/// Handle to a call in flight.
///
/// An attached `ExportScope` is released when the future is consumed,
/// cancelled or dropped.
pub struct CallFuture<T, E> {
    id: RequestId,
    rx: oneshot::Receiver<Completion>,
    abort: CallAbort,
    decode: Decode<T, E>,
    exports: Option<ExportScope>,
}

impl<T, E> CallFuture<T, E> {
    pub(crate) fn new(
        id: RequestId,
        rx: oneshot::Receiver<Completion>,
        shared: Arc<CallShared>,
        channel: Channel,
        decode: Decode<T, E>,
    ) -> Self {
        Self {
            id,
            rx,
            abort: CallAbort { id, shared, channel },
            decode,
            exports: None,
        }
    }

    pub(crate) fn with_exports(mut self, exports: ExportScope) -> Self {
        self.exports = Some(exports);
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits for the outcome.
    pub async fn get(self) -> Result<T, CallError<E>> {
        let completion = self.rx.await.map_err(|_| {
            CallError::Channel(Error::Abandoned(format!("Request {} was dropped", self.id)))
        })?;
        match completion {
            Completion::Response(Ok(body)) => (self.decode)(body),
            Completion::Response(Err(failure)) => Err(CallError::Failure(failure)),
            Completion::Failed(e) => Err(CallError::Channel(e)),
        }
    }

    /// Waits at most `timeout`, cancelling the call if it runs out.
    pub async fn get_timeout(self, timeout: Duration) -> Result<T, CallError<E>> {
        let abort = self.abort.clone();
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                abort.cancel();
                Err(CallError::Channel(Error::Timeout))
            }
        }
    }

    pub fn cancel(&self) -> bool {
        let cancelled = self.abort.cancel();
        if let Some(exports) = &self.exports {
            exports.release();
        }
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state(), RequestState::Completed | RequestState::Cancelled)
    }

    pub fn state(&self) -> RequestState {
        self.abort.shared.state()
    }

    pub fn abort_handle(&self) -> CallAbort {
        self.abort.clone()
    }
}

pub(crate) fn decode_user<T, E>(body: ResponseBody) -> Result<T, CallError<E>>
where
    T: serde::de::DeserializeOwned,
    E: serde::de::DeserializeOwned,
{
    match body {
        ResponseBody::User(response) => response.retrieve(),
        ResponseBody::Pong => Err(CallError::Channel(Error::ProtocolViolation(
            "Pong received for a user request".into(),
        ))),
    }
}

pub(crate) fn decode_pong(body: ResponseBody) -> Result<(), CallError<std::convert::Infallible>> {
    match body {
        ResponseBody::Pong => Ok(()),
        ResponseBody::User(_) => Err(CallError::Channel(Error::ProtocolViolation(
            "User response received for a ping".into(),
        ))),
    }
}
