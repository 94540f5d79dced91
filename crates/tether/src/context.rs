//! # Ambient Module Context
//!
//! While a callable runs, the module it was resolved in is installed as the
//! thread's ambient module. Code deep inside a callable that builds further
//! requests without a `CallContext` at hand picks it up from here.
//!
//! The previous value is restored when the guard drops, including during
//! unwinding, so a panicking callable never leaks its module into the next
//! piece of work scheduled on the same worker thread.

use std::cell::RefCell;
use std::sync::Arc;

use crate::module::Module;

thread_local! {
    static AMBIENT: RefCell<Option<Arc<Module>>> = const { RefCell::new(None) };
}

/// Installs a module as the ambient context until dropped.
#[must_use = "the ambient module is uninstalled when the guard drops"]
pub struct AmbientGuard {
    previous: Option<Arc<Module>>,
}

impl AmbientGuard {
    pub fn enter(module: Arc<Module>) -> Self {
        let previous = AMBIENT.with(|slot| slot.borrow_mut().replace(module));
        Self { previous }
    }
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        AMBIENT.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// The module of the callable currently running on this thread, if any.
pub fn current_module() -> Option<Arc<Module>> {
    AMBIENT.with(|slot| slot.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::panic;

    #[test]
    fn test_guard_nests_and_restores() {
        assert!(current_module().is_none());

        let outer = Arc::new(Module::new("outer"));
        let inner = Arc::new(Module::new("inner"));

        let g1 = AmbientGuard::enter(outer);
        assert_eq!(current_module().unwrap().name(), "outer");
        {
            let _g2 = AmbientGuard::enter(inner);
            assert_eq!(current_module().unwrap().name(), "inner");
        }
        assert_eq!(current_module().unwrap().name(), "outer");
        drop(g1);
        assert!(current_module().is_none());
    }

    #[test]
    fn test_guard_restores_after_panic() {
        let result = panic::catch_unwind(|| {
            let _guard = AmbientGuard::enter(Arc::new(Module::new("doomed")));
            panic!("callable blew up");
        });

        assert!(result.is_err());
        assert!(current_module().is_none());
    }
}
