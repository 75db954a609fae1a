//! Ordered registry of acceleration modules.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use offload_core::Opcode;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::AccelError;
use crate::module::{AccelModule, SOFTWARE_MODULE_NAME};

/// Snapshot of the registered modules, in registration order.
pub type ModuleList = Arc<Vec<Arc<dyn AccelModule>>>;

/// A module and the opcodes it claims, as reported by its capability predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub module: String,
    pub supported_opcodes: Vec<Opcode>,
}

/// Registry for acceleration modules.
///
/// Registration order is significant: the router assigns opcodes by scanning
/// modules front to back with later modules winning, and teardown finalizes
/// them in the same order. The software module is always kept at the front so
/// it only ever acts as the fallback.
///
/// Writers are serialized; readers load the current list without locking.
pub struct ModuleRegistry {
    modules: ArcSwap<Vec<Arc<dyn AccelModule>>>,
    /// Largest per-task context size advertised by any registered module.
    max_ctx_size: AtomicUsize,
    write_lock: Mutex<()>,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: ArcSwap::from_pointee(Vec::new()),
            max_ctx_size: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
        }
    }

    /// Registers a module.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::AlreadyExists`] if a module with the same name is
    /// already registered; the existing module stays authoritative.
    pub fn register(&self, module: Arc<dyn AccelModule>) -> Result<(), AccelError> {
        let _guard = self.write_lock.lock();
        let name = module.name().to_string();

        if self.find_by_name(&name).is_some() {
            warn!(module = %name, "accel module already registered");
            return Err(AccelError::AlreadyExists(format!("module {name}")));
        }

        let current = self.modules.load_full();
        let mut next = Vec::with_capacity(current.len() + 1);
        if name == SOFTWARE_MODULE_NAME {
            next.push(Arc::clone(&module));
            next.extend(current.iter().cloned());
        } else {
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&module));
        }
        self.modules.store(Arc::new(next));

        self.max_ctx_size
            .fetch_max(module.ctx_size(), Ordering::AcqRel);
        debug!(module = %name, ctx_size = module.ctx_size(), "accel module registered");
        Ok(())
    }

    /// Returns the first module whose name matches exactly.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<Arc<dyn AccelModule>> {
        self.modules
            .load()
            .iter()
            .find(|m| m.name() == name)
            .cloned()
    }

    /// Returns the current module list in registration order.
    #[must_use]
    pub fn modules(&self) -> ModuleList {
        self.modules.load_full()
    }

    /// Number of registered modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.load().len()
    }

    /// Returns `true` when no module has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest per-task context size advertised by any registered module.
    #[must_use]
    pub fn max_ctx_size(&self) -> usize {
        self.max_ctx_size.load(Ordering::Acquire)
    }

    /// Visits every module with the opcodes it claims to support.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&ModuleInfo),
    {
        for module in self.modules.load().iter() {
            visitor(&describe(module.as_ref()));
        }
    }

    /// Collects [`ModuleInfo`] for every module in registration order.
    #[must_use]
    pub fn module_info(&self) -> Vec<ModuleInfo> {
        let mut out = Vec::new();
        self.for_each(|info| out.push(info.clone()));
        out
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn describe(module: &dyn AccelModule) -> ModuleInfo {
    ModuleInfo {
        module: module.name().to_string(),
        supported_opcodes: Opcode::ALL
            .into_iter()
            .filter(|op| module.supports_opcode(*op))
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
