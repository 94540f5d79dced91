//! # Channel
//!
//! One end of a bidirectional remote-execution link.
//!
//! ## Architecture
//!
//! A started channel runs three pieces of machinery:
//!
//! - **Reader task**: receives messages from the transport, decodes them into
//!   commands and queues them for dispatch.
//! - **Dispatch thread**: a dedicated OS thread executing queued commands one
//!   at a time, in arrival order. Requests are handed from here to a bounded
//!   worker pool so user code never stalls the queue.
//! - **Writer task**: drains the outbound queue into the transport. Submitting
//!   a command only enqueues it, so it never blocks and never reorders.
//!
//! ## Lifecycle
//!
//! `close` enqueues a `Close` command behind everything already submitted.
//! The peer executes it, terminates, and shuts its side of the transport,
//! which in turn ends this side. Termination is itself routed through the
//! dispatch queue, so responses that arrived before the end are still
//! delivered. On termination every pending call is released with
//! `Error::Abandoned`, running inbound work sees its cancel flag set, and the
//! export table is emptied.
//!
//! Dropping every handle without `close` also ends the link. The writer sees
//! its queue close and shuts the transport, which the peer observes as a
//! lost connection.

use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle as RuntimeHandle;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tokio::sync::watch;

use tether_pipe::PipeReader;
use tether_wire::Capability;
use tether_wire::Encoding;
use tether_wire::Preamble;

use crate::call::CallError;
use crate::call::FailureKind;
use crate::call::RemoteFailure;
use crate::call::UserRequest;
use crate::callable::Callable;
use crate::command::Command;
use crate::config::ChannelConfig;
use crate::error::Error;
use crate::error::Result;
use crate::export::ExportPolicy;
use crate::export::ExportTable;
use crate::export::Handle;
use crate::export::RemoteRef;
use crate::invoke::Invocable;
use crate::invoke::InvocationError;
use crate::invoke::Invoke;
use crate::module::ModuleSet;
use crate::proxy::RemoteWriter;
use crate::request::CallFuture;
use crate::request::Decode;
use crate::request::PendingCalls;
use crate::request::Request;
use crate::request::RequestBody;
use crate::request::RequestId;
use crate::request::RequestState;
use crate::request::Response;
use crate::request::ResponseBody;
use crate::request::decode_pong;
use crate::request::decode_user;
use crate::scope::ExportScope;
use crate::transport::Transport;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Open,
    /// `close` was called here; waiting for the peer to finish.
    Closing,
    Closed,
}

/// Work for the dispatch thread.
enum Dispatch {
    Run(Command),
    Terminate(Error),
}

struct Inner {
    config: ChannelConfig,
    capabilities: Capability,
    encoding: Encoding,
    exports: ExportTable,
    pending: PendingCalls,
    /// Cancel flags of requests from the peer that have not finished here.
    inbound: DashMap<RequestId, Arc<AtomicBool>>,
    outbound: mpsc::UnboundedSender<Command>,
    state: watch::Sender<State>,
    terminated: AtomicBool,
    termination: Mutex<Option<Error>>,
    workers: Arc<Semaphore>,
    runtime: RuntimeHandle,
}

/// Handle to a running channel. Cheap to clone; all clones share one link.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    /// Exchanges preambles with the peer and starts the reader, writer and
    /// dispatch machinery. Prefer `ChannelBuilder::start`.
    pub async fn start(config: ChannelConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let capabilities = handshake(transport.as_ref(), &config).await?;
        let encoding = capabilities.encoding();
        let name = config.name.clone();

        tracing::debug!(channel = %name, ?capabilities, ?encoding, "handshake complete");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(State::Open);

        let policy = ExportPolicy {
            restricted: config.restricted,
            allowed_interfaces: config.allowed_interfaces.clone(),
        };

        let channel = Self {
            inner: Arc::new(Inner {
                capabilities,
                encoding,
                exports: ExportTable::new(policy),
                pending: PendingCalls::new(),
                inbound: DashMap::new(),
                outbound,
                terminated: AtomicBool::new(false),
                termination: Mutex::new(None),
                workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
                runtime: RuntimeHandle::current(),
                state,
                config,
            }),
        };

        let dispatcher = Arc::downgrade(&channel.inner);
        let thread_name = name.clone();
        std::thread::Builder::new()
            .name(format!("tether-dispatch-{}", name))
            .spawn(move || dispatch_loop(thread_name, dispatcher, dispatch_rx))
            .map_err(|e| Error::Abandoned(format!("Failed to spawn dispatch thread: {}", e)))?;

        tokio::spawn(write_loop(
            name.clone(),
            transport.clone(),
            outbound_rx,
            channel.inner.state.subscribe(),
            dispatch_tx.clone(),
        ));
        tokio::spawn(read_loop(name, transport, dispatch_tx, channel.inner.state.subscribe()));

        Ok(channel)
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Capabilities both sides agreed on.
    pub fn capabilities(&self) -> Capability {
        self.inner.capabilities
    }

    pub fn encoding(&self) -> Encoding {
        self.inner.encoding
    }

    pub fn is_restricted(&self) -> bool {
        self.inner.config.restricted
    }

    /// True once `close` was called or the channel terminated.
    pub fn is_closed(&self) -> bool {
        *self.inner.state.borrow() != State::Open
    }

    pub fn exports(&self) -> &ExportTable {
        &self.inner.exports
    }

    pub fn modules(&self) -> &ModuleSet {
        &self.inner.config.modules
    }

    pub(crate) fn runtime(&self) -> &RuntimeHandle {
        &self.inner.runtime
    }

    pub(crate) fn pending(&self) -> &PendingCalls {
        &self.inner.pending
    }

    /// Number of calls from this side still awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Requests from the peer that are queued or running here.
    pub(crate) fn inbound_len(&self) -> usize {
        self.inner.inbound.len()
    }

    /// Why the channel ended, if it ended abnormally.
    pub fn termination_reason(&self) -> Option<Error> {
        self.inner.termination.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Queues a command for the peer.
    pub fn submit(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        self.inner.outbound.send(command).map_err(|_| Error::ChannelClosed)
    }

    /// Exports a local object so the peer can hold a reference to it.
    pub fn export_object<T: Send + Sync + 'static>(&self, object: Arc<T>) -> Result<RemoteRef<T>> {
        let handle = self.inner.exports.export_object(object)?;
        Ok(RemoteRef::new(handle))
    }

    /// Exports an object whose methods the peer may call via `invoke`.
    pub fn export_invocable(&self, object: Arc<dyn Invocable>) -> Result<Handle> {
        Ok(self.inner.exports.export_invocable(object)?)
    }

    /// Releases one reference to an exported object.
    pub fn unexport(&self, handle: Handle) -> bool {
        self.inner.exports.unexport(handle)
    }

    /// Turns a reference that came back from the peer into the local object.
    pub fn resolve<T: Send + Sync + 'static>(&self, reference: RemoteRef<T>) -> Result<Arc<T>> {
        Ok(self.inner.exports.lookup_object(reference.handle())?)
    }

    /// Creates a pipe whose write end is exported. Send the `RemoteWriter` to
    /// the peer; what it writes comes out of the returned reader.
    pub fn open_pipe(&self, capacity: usize) -> Result<(RemoteWriter, PipeReader)> {
        let (writer, reader) = tether_pipe::pipe_with(capacity, tether_pipe::DEFAULT_POLL_INTERVAL);
        let remote = RemoteWriter::export(self, writer)?;
        Ok((remote, reader))
    }

    /// Runs `callable` on the peer and waits for its outcome, bounded by the
    /// configured call timeout.
    pub async fn call<C: Callable>(&self, callable: C) -> std::result::Result<C::Output, CallError<C::Error>> {
        let future = self.call_async(callable)?;
        self.wait(future).await
    }

    /// Starts a scope for objects exported only for the duration of one call.
    pub fn export_scope(&self) -> ExportScope {
        ExportScope::new(self.clone())
    }

    /// `call`, releasing the exports recorded in `exports` once the call is
    /// over, whatever its outcome.
    pub async fn call_scoped<C: Callable>(
        &self,
        callable: C,
        exports: ExportScope,
    ) -> std::result::Result<C::Output, CallError<C::Error>> {
        let future = self.call_async_scoped(callable, exports)?;
        self.wait(future).await
    }

    /// `call_async` with an export scope attached to the returned future.
    pub fn call_async_scoped<C: Callable>(
        &self,
        callable: C,
        exports: ExportScope,
    ) -> Result<CallFuture<C::Output, C::Error>> {
        Ok(self.call_async(callable)?.with_exports(exports))
    }

    /// Sends `callable` to the peer and returns a handle to the call.
    pub fn call_async<C: Callable>(&self, callable: C) -> Result<CallFuture<C::Output, C::Error>> {
        let request = UserRequest::new(self, &callable)?;
        tracing::trace!(channel = %self.name(), call = %request.description(), "calling");
        self.send_request(RequestBody::User(request), decode_user::<C::Output, C::Error>)
    }

    /// Synchronous `call` for code running outside async tasks, such as a
    /// callable calling back to its requester. Must not be used from within
    /// an async task.
    pub fn call_blocking<C: Callable>(&self, callable: C) -> std::result::Result<C::Output, CallError<C::Error>> {
        self.inner.runtime.block_on(self.call(callable))
    }

    /// Calls `method` on an invocable the peer exported under `target`.
    pub async fn invoke<A, R>(
        &self,
        target: Handle,
        method: &str,
        args: &A,
    ) -> std::result::Result<R, CallError<InvocationError>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = tether_wire::to_bytes(args).map_err(|e| CallError::Channel(e.into()))?;
        let invoke = Invoke { handle: target, method: method.to_string(), args };
        let bytes = self.call(invoke).await?;
        tether_wire::from_bytes(&bytes).map_err(|e| CallError::Channel(e.into()))
    }

    /// Round trip through the peer's dispatch thread.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let future = self.send_request(RequestBody::Ping, decode_pong)?;
        match self.wait(future).await {
            Ok(()) => Ok(started.elapsed()),
            Err(CallError::Channel(e)) => Err(e),
            Err(CallError::Failure(failure)) => Err(Error::ProtocolViolation(failure.to_string())),
            Err(CallError::Remote(never)) => match never {},
        }
    }

    /// Asks the peer to reclaim unused resources.
    pub fn request_collect(&self) -> Result<()> {
        self.submit(Command::Collect)
    }

    /// Starts an orderly shutdown. Commands submitted earlier are still sent.
    pub fn close(&self) -> Result<()> {
        let initiated = self.inner.state.send_if_modified(|state| match state {
            State::Open => {
                *state = State::Closing;
                true
            }
            _ => false,
        });
        if !initiated {
            return Ok(());
        }
        tracing::debug!(channel = %self.name(), "closing");
        self.inner.outbound.send(Command::Close).map_err(|_| Error::ChannelClosed)
    }

    /// Waits until the channel has terminated. Returns the reason if it
    /// ended abnormally.
    pub async fn join(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        until_closed(&mut state).await;
        match self.termination_reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Waits for `future`, bounded by the configured call timeout.
    async fn wait<T, E>(&self, future: CallFuture<T, E>) -> std::result::Result<T, CallError<E>> {
        match self.inner.config.call_timeout {
            Some(timeout) => future.get_timeout(timeout).await,
            None => future.get().await,
        }
    }

    fn send_request<T, E>(&self, body: RequestBody, decode: Decode<T, E>) -> Result<CallFuture<T, E>> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }

        let id = self.inner.pending.next_id();
        let (rx, shared) = self.inner.pending.register(id)?;

        // Termination may have swept the table between the check above and
        // the registration.
        if self.inner.terminated.load(Ordering::SeqCst) {
            self.inner.pending.remove(id);
            return Err(Error::ChannelClosed);
        }

        if let Err(e) = self.submit(Command::Request(Request { id, body })) {
            self.inner.pending.remove(id);
            return Err(e);
        }
        shared.advance(RequestState::Sent);

        Ok(CallFuture::new(id, rx, shared, self.clone(), decode))
    }

    /// Runs an incoming request on the worker pool.
    pub(crate) fn spawn_request(&self, request: Request) {
        let Request { id, body } = request;

        let user = match body {
            RequestBody::Ping => {
                self.respond(id, Ok(ResponseBody::Pong));
                return;
            }
            RequestBody::User(user) => user,
        };

        if self.inner.inbound.contains_key(&id) {
            tracing::warn!(channel = %self.name(), %id, "duplicate request id from peer dropped");
            return;
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        self.inner.inbound.insert(id, cancelled.clone());

        let channel = self.clone();
        let workers = self.inner.workers.clone();

        self.inner.runtime.spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };

            if cancelled.load(Ordering::Acquire) || channel.inner.terminated.load(Ordering::SeqCst) {
                tracing::debug!(channel = %channel.name(), %id, "skipping cancelled request");
                channel.inner.inbound.remove(&id);
                return;
            }

            let worker = channel.clone();
            let flag = cancelled.clone();
            let outcome = tokio::task::spawn_blocking(move || user.perform(&worker, id, flag)).await;
            channel.inner.inbound.remove(&id);

            if cancelled.load(Ordering::Acquire) {
                tracing::debug!(channel = %channel.name(), %id, "discarding result of cancelled request");
                return;
            }

            let outcome = match outcome {
                Ok(response) => Ok(ResponseBody::User(response)),
                Err(e) => Err(RemoteFailure::new(FailureKind::Panicked, format!("Worker failed: {}", e))),
            };
            channel.respond(id, outcome);
        });
    }

    fn respond(&self, id: RequestId, outcome: std::result::Result<ResponseBody, RemoteFailure>) {
        if let Err(e) = self.submit(Command::Response(Response { id, outcome })) {
            tracing::debug!(channel = %self.name(), %id, error = %e, "response dropped");
        }
    }

    pub(crate) fn cancel_inbound(&self, id: RequestId) {
        if let Some(flag) = self.inner.inbound.get(&id) {
            flag.store(true, Ordering::Release);
            tracing::debug!(channel = %self.name(), %id, "peer cancelled request");
        }
    }

    pub(crate) fn run_collect_hook(&self) {
        match &self.inner.config.collect_hook {
            Some(hook) => {
                if panic::catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                    tracing::warn!(channel = %self.name(), "collect hook panicked");
                }
            }
            None => tracing::debug!(channel = %self.name(), "peer requested collection"),
        }
    }

    /// Ends the channel. `None` means an orderly close by the peer. The first
    /// call wins; later calls do nothing.
    pub(crate) fn terminate(&self, reason: Option<Error>) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        // Once this side asked to close, the peer hanging up is the expected end.
        let initiated = *self.inner.state.borrow() == State::Closing;
        let reason = if initiated { None } else { reason };

        match &reason {
            Some(e) => tracing::warn!(channel = %self.name(), error = %e, "channel terminated"),
            None => tracing::debug!(channel = %self.name(), "channel closed"),
        }

        let message = match &reason {
            Some(e) => e.to_string(),
            None => "channel closed".to_string(),
        };
        *self.inner.termination.lock().unwrap_or_else(PoisonError::into_inner) = reason;

        self.inner.pending.abandon_all(Error::Abandoned(message));
        for flag in self.inner.inbound.iter() {
            flag.value().store(true, Ordering::Release);
        }
        self.inner.exports.clear();

        self.inner.state.send_replace(State::Closed);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name())
            .field("capabilities", &self.inner.capabilities)
            .field("state", &*self.inner.state.borrow())
            .field("pending", &self.inner.pending.len())
            .field("exports", &self.inner.exports.len())
            .finish()
    }
}

/// Executes queued commands in arrival order. Holds the channel weakly, so
/// dropping every `Channel` handle lets the machinery wind down.
fn dispatch_loop(name: String, weak: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    tracing::trace!(channel = %name, "dispatch thread started");

    while let Some(item) = rx.blocking_recv() {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let channel = Channel { inner };
        match item {
            Dispatch::Run(command) => {
                let kind = command.kind();
                if panic::catch_unwind(AssertUnwindSafe(|| command.execute(&channel))).is_err() {
                    tracing::error!(channel = %name, command = kind, "command panicked");
                }
            }
            Dispatch::Terminate(reason) => channel.terminate(Some(reason)),
        }
        if channel.inner.terminated.load(Ordering::SeqCst) {
            break;
        }
    }

    if let Some(inner) = weak.upgrade() {
        Channel { inner }.terminate(Some(Error::Abandoned("dispatch queue closed".into())));
    }
    tracing::trace!(channel = %name, "dispatch thread finished");
}

async fn handshake(transport: &dyn Transport, config: &ChannelConfig) -> Result<Capability> {
    let local = Preamble::new(config.capabilities);
    transport.send(&local.encode()?).await?;

    let reply = tokio::time::timeout(config.handshake_timeout, transport.recv())
        .await
        .map_err(|_| Error::Timeout)??;
    let Some(bytes) = reply else {
        return Err(Error::Abandoned("peer hung up during the handshake".into()));
    };

    let remote = Preamble::decode(&bytes)?;
    Ok(tether_wire::negotiate(config.capabilities, remote.capabilities))
}

/// Resolves once the channel state reaches `Closed` or the channel is gone.
async fn until_closed(state: &mut watch::Receiver<State>) {
    while *state.borrow_and_update() != State::Closed {
        if state.changed().await.is_err() {
            return;
        }
    }
}

async fn write_loop(
    name: String,
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<Command>,
    mut state: watch::Receiver<State>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
) {
    loop {
        let command = tokio::select! {
            biased;
            command = outbound.recv() => command,
            _ = until_closed(&mut state) => None,
        };
        let Some(command) = command else {
            break;
        };

        let closing = matches!(command, Command::Close);
        let bytes = match command.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(channel = %name, command = %command, error = %e, "failed to encode command");
                continue;
            }
        };

        if let Err(e) = transport.send(&bytes).await {
            tracing::debug!(channel = %name, error = %e, "send failed");
            let _ = dispatch.send(Dispatch::Terminate(Error::Abandoned(format!("send failed: {}", e))));
            break;
        }
        if closing {
            break;
        }
    }

    if let Err(e) = transport.close().await {
        tracing::debug!(channel = %name, error = %e, "transport close failed");
    }
}

async fn read_loop(
    name: String,
    transport: Arc<dyn Transport>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    mut state: watch::Receiver<State>,
) {
    let reason = loop {
        let message = tokio::select! {
            message = transport.recv() => message,
            _ = until_closed(&mut state) => return,
        };

        match message {
            Ok(Some(bytes)) => match Command::decode(&bytes) {
                Ok(command) => {
                    if dispatch.send(Dispatch::Run(command)).is_err() {
                        return;
                    }
                }
                Err(e) => break Error::ProtocolViolation(format!("malformed command: {}", e)),
            },
            Ok(None) => break Error::Abandoned("peer closed the connection".into()),
            Err(e) => break Error::Abandoned(format!("transport failed: {}", e)),
        }
    };

    tracing::debug!(channel = %name, reason = %reason, "reader stopped");
    let _ = dispatch.send(Dispatch::Terminate(reason));
}
