//! # Export Table
//!
//! Maps small integer handles to local objects the peer may refer to. The
//! peer only ever sees the handle; commands carrying a handle are resolved
//! back to the live object here.
//!
//! ## Invariants
//! - Handles are allocated monotonically and never reused for the lifetime
//!   of the table.
//! - Exporting an object that is already exported (same `Arc` allocation)
//!   returns its existing handle and takes another reference on it.
//! - `unexport` releases one reference; the entry disappears when the last
//!   reference goes. Releasing an unknown handle is a no-op.
//! - On a restricted table, invocation lookups only succeed for objects whose
//!   interface is on the allow-list.

use std::any::Any;
use std::collections::HashMap;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Instant;

use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;

use crate::invoke::Invocable;
use crate::proxy::StreamSink;

/// Integer reference to an object in an export table.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub u32);

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum Error {
    /// No object is exported under this handle.
    NotFound(Handle),
    /// The handle refers to an object of a different kind or type.
    TypeMismatch { handle: Handle, expected: &'static str, found: &'static str },
    /// The restricted table refuses remote access to this object.
    Rejected { handle: Handle, interface: String },
    /// Every handle value has been used.
    Exhausted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(h) => write!(f, "No object exported as {}", h),
            Self::TypeMismatch { handle, expected, found } => {
                write!(f, "Object {} is a {}, expected {}", handle, found, expected)
            }
            Self::Rejected { handle, interface } => write!(
                f,
                "Access to {} ({}) is prohibited because the channel is restricted",
                handle, interface
            ),
            Self::Exhausted => write!(f, "Export table has run out of handles"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A live local object published under a handle.
#[derive(Clone)]
pub enum Exported {
    /// An arbitrary value, resolvable locally through `RemoteRef`.
    Object(Arc<dyn Any + Send + Sync>),
    /// A target for remote method invocation.
    Invocable(Arc<dyn Invocable>),
    /// The receiving end of a proxy stream.
    Stream(Arc<StreamSink>),
}

impl Exported {
    fn kind(&self) -> &'static str {
        match self {
            Self::Object(_) => "object",
            Self::Invocable(_) => "invocable",
            Self::Stream(_) => "stream",
        }
    }

    /// Address of the shared allocation plus its kind, used to recognise
    /// re-exports.
    fn identity(&self) -> (usize, &'static str) {
        let addr = match self {
            Self::Object(a) => Arc::as_ptr(a) as *const () as usize,
            Self::Invocable(a) => Arc::as_ptr(a) as *const () as usize,
            Self::Stream(a) => Arc::as_ptr(a) as *const () as usize,
        };
        (addr, self.kind())
    }
}

struct Entry {
    exported: Exported,
    refs: u32,
    label: &'static str,
    exported_at: Instant,
}

/// Which objects a restricted table lets the peer reach.
#[derive(Clone, Debug, Default)]
pub struct ExportPolicy {
    pub restricted: bool,
    /// Interfaces that may be invoked remotely on a restricted table.
    /// `None` allows every exported invocable.
    pub allowed_interfaces: Option<HashSet<String>>,
}

impl ExportPolicy {
    fn permits(&self, interface: &str) -> bool {
        if !self.restricted {
            return true;
        }
        match &self.allowed_interfaces {
            Some(allowed) => allowed.contains(interface),
            None => true,
        }
    }
}

/// Concurrent handle-to-object registry.
///
/// Lock order is `identities` then `entries`; neither lock is held across
/// any call into exported objects.
pub struct ExportTable {
    entries: DashMap<Handle, Entry>,
    identities: Mutex<HashMap<(usize, &'static str), Handle>>,
    next: AtomicU32,
    policy: ExportPolicy,
}

impl ExportTable {
    pub fn new(policy: ExportPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            identities: Mutex::new(HashMap::new()),
            next: AtomicU32::new(1),
            policy,
        }
    }

    /// Publishes an object, returning its handle.
    pub fn export(&self, exported: Exported, label: &'static str) -> Result<Handle> {
        let identity = exported.identity();
        let mut identities = self.identities.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(&handle) = identities.get(&identity) {
            if let Some(mut entry) = self.entries.get_mut(&handle) {
                entry.refs += 1;
                tracing::trace!(%handle, refs = entry.refs, "re-exported");
                return Ok(handle);
            }
        }

        let raw = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1))
            .map_err(|_| Error::Exhausted)?;
        let handle = Handle(raw);

        self.entries.insert(handle, Entry {
            exported,
            refs: 1,
            label,
            exported_at: Instant::now(),
        });
        identities.insert(identity, handle);

        tracing::trace!(%handle, label, "exported");
        Ok(handle)
    }

    pub fn export_object<T: Any + Send + Sync>(&self, object: Arc<T>) -> Result<Handle> {
        self.export(Exported::Object(object), std::any::type_name::<T>())
    }

    pub fn export_invocable(&self, object: Arc<dyn Invocable>) -> Result<Handle> {
        self.export(Exported::Invocable(object), "invocable")
    }

    pub fn export_stream(&self, sink: Arc<StreamSink>) -> Result<Handle> {
        self.export(Exported::Stream(sink), "stream")
    }

    pub fn lookup(&self, handle: Handle) -> Result<Exported> {
        self.entries
            .get(&handle)
            .map(|entry| entry.exported.clone())
            .ok_or(Error::NotFound(handle))
    }

    /// Resolves a handle to a concrete object type.
    pub fn lookup_object<T: Any + Send + Sync>(&self, handle: Handle) -> Result<Arc<T>> {
        match self.lookup(handle)? {
            Exported::Object(object) => object.downcast::<T>().map_err(|_| Error::TypeMismatch {
                handle,
                expected: std::any::type_name::<T>(),
                found: "object of another type",
            }),
            other => Err(Error::TypeMismatch {
                handle,
                expected: std::any::type_name::<T>(),
                found: other.kind(),
            }),
        }
    }

    /// Resolves a handle for remote invocation, enforcing the table's policy.
    pub fn lookup_invocable(&self, handle: Handle) -> Result<Arc<dyn Invocable>> {
        match self.lookup(handle)? {
            Exported::Invocable(object) => {
                if !self.policy.permits(object.interface()) {
                    tracing::warn!(%handle, interface = object.interface(), "rejected invocation on restricted channel");
                    return Err(Error::Rejected {
                        handle,
                        interface: object.interface().to_string(),
                    });
                }
                Ok(object)
            }
            other => Err(Error::TypeMismatch { handle, expected: "invocable", found: other.kind() }),
        }
    }

    pub fn lookup_stream(&self, handle: Handle) -> Result<Arc<StreamSink>> {
        match self.lookup(handle)? {
            Exported::Stream(sink) => Ok(sink),
            other => Err(Error::TypeMismatch { handle, expected: "stream", found: other.kind() }),
        }
    }

    /// Releases one reference. Returns `true` if the entry was removed.
    pub fn unexport(&self, handle: Handle) -> bool {
        let mut identities = self.identities.lock().unwrap_or_else(PoisonError::into_inner);

        let removed = self
            .entries
            .remove_if_mut(&handle, |_, entry| {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            });

        match removed {
            Some((_, entry)) => {
                identities.remove(&entry.exported.identity());
                tracing::trace!(%handle, "unexported");
                true
            }
            None => false,
        }
    }

    /// Drops every entry. Used when the channel terminates.
    pub fn clear(&self) {
        let mut identities = self.identities.lock().unwrap_or_else(PoisonError::into_inner);
        identities.clear();
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reference count of a live entry.
    pub fn refs(&self, handle: Handle) -> Option<u32> {
        self.entries.get(&handle).map(|entry| entry.refs)
    }

    /// Human-readable summary of an entry for diagnostics.
    pub fn describe(&self, handle: Handle) -> Option<String> {
        self.entries.get(&handle).map(|entry| {
            format!(
                "{} {} ({}) exported {:?} ago, {} ref(s)",
                entry.exported.kind(),
                handle,
                entry.label,
                entry.exported_at.elapsed(),
                entry.refs
            )
        })
    }
}

/// A typed, serializable reference to an object exported by the sending side.
///
/// The handle is only meaningful to the channel that exported it; sending a
/// `RemoteRef` back to its origin and resolving it there yields the original
/// object.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct RemoteRef<T: ?Sized> {
    handle: Handle,
    #[serde(skip)]
    _marker: PhantomData<fn() -> T>,
}

impl<T: ?Sized> RemoteRef<T> {
    pub fn new(handle: Handle) -> Self {
        Self { handle, _marker: PhantomData }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }
}

impl<T: ?Sized> Clone for RemoteRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for RemoteRef<T> {}

impl<T: ?Sized> std::fmt::Debug for RemoteRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RemoteRef({})", self.handle)
    }
}

impl<T: ?Sized> PartialEq for RemoteRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}
