//! Opcode routing: binds every opcode to exactly one module.
//!
//! The table is built once by [`OpcodeRouter::start`] from the registry
//! contents plus any explicit overrides recorded beforehand, then published
//! read-only. Lookups after startup are lock-free.

use std::sync::Arc;

use arc_swap::ArcSwap;
use offload_core::{Opcode, OPCODE_COUNT};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::AccelError;
use crate::module::AccelModule;
use crate::registry::ModuleRegistry;

// ---------------------------------------------------------------------------
// RouterState
// ---------------------------------------------------------------------------

/// Lifecycle of the routing table.
///
/// State machine: Configuring -> Started | Failed, Started -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    /// Accepting module registrations and overrides.
    Configuring,
    /// Table is complete and frozen.
    Started,
    /// Startup validation failed; the table stays empty.
    Failed,
    /// Torn down by the finish sequence.
    Stopped,
}

// ---------------------------------------------------------------------------
// RoutingTable
// ---------------------------------------------------------------------------

/// One module slot per opcode.
pub struct RoutingTable {
    slots: [Option<Arc<dyn AccelModule>>; OPCODE_COUNT],
}

impl RoutingTable {
    fn empty() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Module responsible for `opcode`, if the slot is filled.
    #[must_use]
    pub fn module_for(&self, opcode: Opcode) -> Option<&Arc<dyn AccelModule>> {
        self.slots[opcode.index()].as_ref()
    }

    /// Whether every opcode has a module.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}

// ---------------------------------------------------------------------------
// OpcodeRouter
// ---------------------------------------------------------------------------

/// Maps each opcode to the module that executes it.
pub struct OpcodeRouter {
    table: ArcSwap<RoutingTable>,
    /// Module names requested per opcode before startup. Kept after startup
    /// for configuration dumps.
    overrides: Mutex<[Option<String>; OPCODE_COUNT]>,
    state: ArcSwap<RouterState>,
    /// Serializes state transitions (override assignment, start, stop).
    transition: Mutex<()>,
}

impl OpcodeRouter {
    /// Creates a router with an empty table in the `Configuring` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RoutingTable::empty()),
            overrides: Mutex::new(std::array::from_fn(|_| None)),
            state: ArcSwap::from_pointee(RouterState::Configuring),
            transition: Mutex::new(()),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RouterState {
        **self.state.load()
    }

    /// Records that `opcode` must be served by `module_name`. Validated at
    /// startup; a later call for the same opcode replaces the earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::InvalidState`] once startup has been attempted.
    pub fn assign_override(&self, opcode: Opcode, module_name: &str) -> Result<(), AccelError> {
        let _guard = self.transition.lock();
        if self.state() != RouterState::Configuring {
            return Err(AccelError::InvalidState(
                "opcode assignment is only allowed before startup".to_string(),
            ));
        }
        self.overrides.lock()[opcode.index()] = Some(module_name.to_string());
        debug!(opcode = %opcode, module = module_name, "opcode override recorded");
        Ok(())
    }

    /// Same as [`assign_override`](Self::assign_override) with the opcode
    /// given by name.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::InvalidArgument`] for an unknown opcode name, in
    /// addition to the errors of `assign_override`.
    pub fn assign_override_by_name(
        &self,
        opcode_name: &str,
        module_name: &str,
    ) -> Result<(), AccelError> {
        let opcode: Opcode = opcode_name.parse()?;
        self.assign_override(opcode, module_name)
    }

    /// Recorded overrides in opcode order.
    #[must_use]
    pub fn overrides(&self) -> Vec<(Opcode, String)> {
        let overrides = self.overrides.lock();
        Opcode::ALL
            .into_iter()
            .filter_map(|op| overrides[op.index()].clone().map(|name| (op, name)))
            .collect()
    }

    /// Initializes every module and builds the routing table.
    ///
    /// Modules are initialized in registration order; one whose `init` fails
    /// is excluded from routing. Opcodes are then assigned by scanning the
    /// remaining modules front to back, later modules superseding earlier
    /// ones, and finally overrides are validated and applied. On any failure
    /// the router moves to [`RouterState::Failed`] with an empty table.
    ///
    /// # Errors
    ///
    /// - [`AccelError::InvalidState`] if startup was already attempted.
    /// - [`AccelError::InvalidArgument`] if an override names an unknown or
    ///   uninitialized module, or one that does not support the opcode.
    /// - [`AccelError::NotSupported`] if some opcode has no module at all.
    pub fn start(&self, registry: &ModuleRegistry) -> Result<(), AccelError> {
        let _guard = self.transition.lock();
        if self.state() != RouterState::Configuring {
            return Err(AccelError::InvalidState(
                "framework already started".to_string(),
            ));
        }

        match self.build(registry) {
            Ok(table) => {
                self.table.store(Arc::new(table));
                self.state.store(Arc::new(RouterState::Started));
                info!(modules = registry.len(), "accel framework started");
                Ok(())
            }
            Err(e) => {
                self.state.store(Arc::new(RouterState::Failed));
                Err(e)
            }
        }
    }

    fn build(&self, registry: &ModuleRegistry) -> Result<RoutingTable, AccelError> {
        let modules = registry.modules();
        let mut usable: Vec<&Arc<dyn AccelModule>> = Vec::with_capacity(modules.len());
        for module in modules.iter() {
            match module.init() {
                Ok(()) => usable.push(module),
                Err(e) => warn!(
                    module = module.name(),
                    error = %e,
                    "accel module failed to initialize, excluded from routing"
                ),
            }
        }

        let mut table = RoutingTable::empty();
        for module in &usable {
            for op in Opcode::ALL {
                if module.supports_opcode(op) {
                    table.slots[op.index()] = Some(Arc::clone(module));
                    debug!(opcode = %op, module = module.name(), "opcode assigned");
                }
            }
        }

        for (op, name) in self.overrides() {
            let Some(module) = usable.iter().find(|m| m.name() == name) else {
                error!(opcode = %op, module = %name, "override names an unknown module");
                return Err(AccelError::InvalidArgument(format!(
                    "module {name} is not registered or failed to initialize"
                )));
            };
            if !module.supports_opcode(op) {
                error!(opcode = %op, module = %name, "override module does not support opcode");
                return Err(AccelError::InvalidArgument(format!(
                    "module {name} does not support opcode {op}"
                )));
            }
            table.slots[op.index()] = Some(Arc::clone(module));
            debug!(opcode = %op, module = %name, "opcode override applied");
        }

        if let Some(op) = Opcode::ALL
            .into_iter()
            .find(|op| table.module_for(*op).is_none())
        {
            error!(opcode = %op, "no module supports opcode");
            return Err(AccelError::NotSupported(format!(
                "no module supports opcode {op}"
            )));
        }

        Ok(table)
    }

    /// Clears the table and overrides and rejects further use.
    pub(crate) fn stop(&self) {
        let _guard = self.transition.lock();
        self.table.store(Arc::new(RoutingTable::empty()));
        *self.overrides.lock() = std::array::from_fn(|_| None);
        self.state.store(Arc::new(RouterState::Stopped));
    }

    /// Current routing table snapshot.
    #[must_use]
    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    /// Module currently bound to `opcode`.
    #[must_use]
    pub fn module_for(&self, opcode: Opcode) -> Option<Arc<dyn AccelModule>> {
        self.table.load().module_for(opcode).cloned()
    }

    /// Name of the module currently bound to `opcode`.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::NotFound`] when the slot is empty (before startup
    /// or after teardown).
    pub fn module_name_for(&self, opcode: Opcode) -> Result<String, AccelError> {
        self.module_for(opcode)
            .map(|m| m.name().to_string())
            .ok_or_else(|| AccelError::NotFound(format!("no module assigned to {opcode}")))
    }
}

impl Default for OpcodeRouter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
