//! # Modules
//!
//! A module is a named registry of callable types. The receiving side can
//! only run callables whose wire tag is registered in the module a request
//! resolves to, so modules double as the unit of code visibility.
//!
//! Every module knows the built-in `Invoke` callable. It is the only one
//! flagged as a proxy invocation, which is what restricted channels accept.

use std::collections::HashMap;
use std::sync::Arc;

use crate::call::UserResponse;
use crate::call::invoke_erased;
use crate::callable::CallContext;
use crate::callable::Callable;
use crate::invoke::Invoke;

pub const DEFAULT_MODULE: &str = "default";

pub(crate) type InvokeFn = fn(&[u8], &CallContext) -> UserResponse;

/// How to run one registered callable type.
#[derive(Clone, Copy)]
pub struct Registration {
    pub(crate) invoke: InvokeFn,
    proxy_invocation: bool,
}

impl Registration {
    pub fn is_proxy_invocation(&self) -> bool {
        self.proxy_invocation
    }
}

pub struct Module {
    name: String,
    callables: HashMap<&'static str, Registration>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        let mut callables = HashMap::new();
        callables.insert(Invoke::NAME, Registration {
            invoke: invoke_erased::<Invoke>,
            proxy_invocation: true,
        });
        Self { name: name.into(), callables }
    }

    /// Makes `C` runnable in this module. Registering a tag again replaces
    /// the earlier type.
    pub fn register<C: Callable>(mut self) -> Self {
        let previous = self.callables.insert(C::NAME, Registration {
            invoke: invoke_erased::<C>,
            proxy_invocation: false,
        });
        if previous.is_some() {
            tracing::debug!(module = %self.name, tag = C::NAME, "callable registration replaced");
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.callables.contains_key(tag)
    }

    pub fn lookup(&self, tag: &str) -> Option<Registration> {
        self.callables.get(tag).copied()
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.callables.keys().collect();
        tags.sort();
        f.debug_struct("Module").field("name", &self.name).field("callables", &tags).finish()
    }
}

/// The modules a channel can resolve requests in, plus the one used when a
/// request names none.
#[derive(Clone, Debug)]
pub struct ModuleSet {
    modules: HashMap<String, Arc<Module>>,
    default: String,
}

impl Default for ModuleSet {
    fn default() -> Self {
        let mut modules = HashMap::new();
        modules.insert(DEFAULT_MODULE.to_string(), Arc::new(Module::new(DEFAULT_MODULE)));
        Self { modules, default: DEFAULT_MODULE.to_string() }
    }
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a module by name.
    pub fn insert(&mut self, module: Module) {
        self.modules.insert(module.name.clone(), Arc::new(module));
    }

    /// Applies `f` to the named module, creating it first if needed.
    pub(crate) fn update(&mut self, name: &str, f: impl FnOnce(Module) -> Module) {
        let existing = self
            .modules
            .remove(name)
            .map(|m| Arc::try_unwrap(m).unwrap_or_else(|shared| Module {
                name: shared.name.clone(),
                callables: shared.callables.clone(),
            }))
            .unwrap_or_else(|| Module::new(name));
        self.insert(f(existing));
    }

    /// Chooses the module used for requests without a context. Unknown
    /// names get an empty module.
    pub fn set_default(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.modules.contains_key(&name) {
            self.insert(Module::new(name.clone()));
        }
        self.default = name;
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn default_module(&self) -> Arc<Module> {
        match self.modules.get(&self.default) {
            Some(module) => module.clone(),
            None => Arc::new(Module::new(self.default.clone())),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.get(name).cloned()
    }

    /// The named module, or the default when no name is given.
    pub fn resolve(&self, name: Option<&str>) -> Option<Arc<Module>> {
        match name {
            Some(name) => self.get(name),
            None => Some(self.default_module()),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;
    use serde::Serialize;

    use crate::invoke::InvocationError;

    #[derive(Serialize, Deserialize)]
    struct Probe;

    impl Callable for Probe {
        type Output = ();
        type Error = InvocationError;
        const NAME: &'static str = "test.sample";

        fn call(self, _: &CallContext) -> Result<(), InvocationError> {
            Ok(())
        }
    }

    #[test]
    fn test_every_module_knows_invoke() {
        let module = Module::new("plain");
        let registration = module.lookup(Invoke::NAME).unwrap();
        assert!(registration.is_proxy_invocation());
    }

    #[test]
    fn test_registered_callables_are_not_proxy_invocations() {
        let module = Module::new("app").register::<Probe>();
        assert!(module.contains("test.sample"));
        assert!(!module.lookup("test.sample").unwrap().is_proxy_invocation());
        assert!(module.lookup("test.missing").is_none());
    }

    #[test]
    fn test_resolve_falls_back_to_default() {
        let mut set = ModuleSet::new();
        set.insert(Module::new("plugins"));

        assert_eq!(set.resolve(None).unwrap().name(), DEFAULT_MODULE);
        assert_eq!(set.resolve(Some("plugins")).unwrap().name(), "plugins");
        assert!(set.resolve(Some("absent")).is_none());

        set.set_default("plugins");
        assert_eq!(set.resolve(None).unwrap().name(), "plugins");
    }

    #[test]
    fn test_update_keeps_existing_registrations() {
        let mut set = ModuleSet::new();
        set.update(DEFAULT_MODULE, |m| m.register::<Probe>());
        set.update("fresh", |m| m);

        assert!(set.default_module().contains("test.sample"));
        assert!(set.get("fresh").unwrap().contains(Invoke::NAME));
    }
}
