//! # Channel Configuration
//!
//! Provides a fluent API for describing a channel before it is started.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tether_wire::Capability;

use crate::callable::Callable;
use crate::channel::Channel;
use crate::error::Result;
use crate::module::Module;
use crate::module::ModuleSet;
use crate::transport::Transport;

pub const DEFAULT_MAX_WORKERS: usize = 16;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs when the peer sends `Collect`.
pub type CollectHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub struct ChannelConfig {
    /// Used in logs and thread names.
    pub name: String,
    /// Only proxy invocations on allowed interfaces may run.
    pub restricted: bool,
    /// Offered during the handshake; the peer's offer is intersected.
    pub capabilities: Capability,
    /// Upper bound on requests executing at once.
    pub max_workers: usize,
    /// Applied by `Channel::call`. `None` waits forever.
    pub call_timeout: Option<Duration>,
    pub handshake_timeout: Duration,
    /// Interfaces reachable through `Invoke` on a restricted channel.
    pub allowed_interfaces: Option<HashSet<String>>,
    pub modules: ModuleSet,
    pub collect_hook: Option<CollectHook>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "channel".to_string(),
            restricted: false,
            capabilities: Capability::ALL,
            max_workers: DEFAULT_MAX_WORKERS,
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            allowed_interfaces: None,
            modules: ModuleSet::default(),
            collect_hook: None,
        }
    }
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("name", &self.name)
            .field("restricted", &self.restricted)
            .field("capabilities", &self.capabilities)
            .field("max_workers", &self.max_workers)
            .field("call_timeout", &self.call_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("allowed_interfaces", &self.allowed_interfaces)
            .field("modules", &self.modules)
            .field("collect_hook", &self.collect_hook.is_some())
            .finish()
    }
}

/// Fluent builder for channels.
pub struct ChannelBuilder {
    config: ChannelConfig,
}

impl ChannelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: ChannelConfig { name: name.into(), ..ChannelConfig::default() },
        }
    }

    pub fn from_config(config: ChannelConfig) -> Self {
        Self { config }
    }

    pub fn restricted(mut self, restricted: bool) -> Self {
        self.config.restricted = restricted;
        self
    }

    pub fn capabilities(mut self, capabilities: Capability) -> Self {
        self.config.capabilities = capabilities;
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = max_workers.max(1);
        self
    }

    pub fn call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Allows remote invocation of `interface` on a restricted channel.
    /// Once any interface is allowed, all others are refused.
    pub fn allow_interface(mut self, interface: impl Into<String>) -> Self {
        self.config
            .allowed_interfaces
            .get_or_insert_with(HashSet::new)
            .insert(interface.into());
        self
    }

    /// Registers `C` in the default module.
    pub fn register<C: Callable>(mut self) -> Self {
        let default = self.config.modules.default_name().to_string();
        self.config.modules.update(&default, |m| m.register::<C>());
        self
    }

    pub fn module(mut self, module: Module) -> Self {
        self.config.modules.insert(module);
        self
    }

    pub fn default_module(mut self, name: impl Into<String>) -> Self {
        self.config.modules.set_default(name);
        self
    }

    pub fn on_collect(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.config.collect_hook = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Performs the handshake over `transport` and starts the channel.
    /// Must be called from within a tokio runtime.
    pub async fn start(self, transport: impl Transport) -> Result<Channel> {
        Channel::start(self.config, Arc::new(transport)).await
    }
}
