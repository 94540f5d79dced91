//! # Callables
//!
//! A `Callable` is a serializable unit of work shipped to the peer and run
//! there exactly once. Its type is identified on the wire by `NAME`, which
//! must be registered in the receiving side's module (see `module`).

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::channel::Channel;
use crate::module::Module;
use crate::request::RequestId;

/// Work that can be executed on the far side of a channel.
pub trait Callable: Serialize + DeserializeOwned + Send + 'static {
    type Output: Serialize + DeserializeOwned + Send + 'static;
    type Error: std::error::Error + Serialize + DeserializeOwned + Send + 'static;

    /// Wire tag of this type. Must be unique within a module.
    const NAME: &'static str;

    /// Runs on the receiving side.
    fn call(self, ctx: &CallContext) -> Result<Self::Output, Self::Error>;

    /// Names the module this callable must be resolved in. Queried once when
    /// the request is built; `None` falls back to the ambient module, then to
    /// the receiver's default.
    fn context(&self) -> Option<String> {
        None
    }

    /// Short label used in logs and in rejection messages.
    fn describe(&self) -> String {
        Self::NAME.to_string()
    }
}

/// What a callable can see of the channel it runs on.
pub struct CallContext {
    channel: Channel,
    module: Arc<Module>,
    request_id: RequestId,
    cancelled: Arc<AtomicBool>,
}

impl CallContext {
    pub(crate) fn new(
        channel: Channel,
        module: Arc<Module>,
        request_id: RequestId,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self { channel, module, request_id, cancelled }
    }

    /// The channel the request arrived on. Calls made through it go back to
    /// the requester.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    pub fn module_name(&self) -> &str {
        self.module.name()
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// True once the requester cancelled this call. Long-running work should
    /// poll this and bail out early; the result will be discarded anyway.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
