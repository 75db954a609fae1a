//! The framework instance that ties modules, routing, keys and teardown
//! together.
//!
//! Follows a deferred startup pattern:
//! 1. `new()` -- allocates the registry, router, keyring and coordinator
//! 2. `register_module()` / `assign_opcode()` -- configure before startup
//! 3. `start()` -- initializes modules and freezes the routing table
//! 4. `io_channel()` -- per-thread submission from any worker thread
//! 5. `finish()` -- destroys keys, clears routing, finalizes modules
//!
//! `Accel` is a cheap clonable handle; clones share one instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use offload_core::Opcode;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::channel::{thread_channel, AccelChannel, ChannelParams};
use crate::config::AccelConfig;
use crate::error::AccelError;
use crate::keyring::{CryptoKey, CryptoKeyCreateParams, CryptoKeyInfo, Keyring};
use crate::lifecycle::{TeardownCoordinator, TeardownPhase};
use crate::module::AccelModule;
use crate::registry::{ModuleInfo, ModuleRegistry};
use crate::router::{OpcodeRouter, RouterState};
use crate::software::SoftwareModule;

static NEXT_FRAMEWORK_ID: AtomicU64 = AtomicU64::new(1);

struct Shared {
    id: u64,
    config: AccelConfig,
    registry: ModuleRegistry,
    router: OpcodeRouter,
    keyring: Keyring,
    teardown: Arc<TeardownCoordinator>,
}

/// Handle to one acceleration framework instance.
#[derive(Clone)]
pub struct Accel {
    shared: Arc<Shared>,
}

impl Accel {
    /// Creates an instance with no modules registered.
    #[must_use]
    pub fn new(config: AccelConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_FRAMEWORK_ID.fetch_add(1, Ordering::Relaxed),
                config,
                registry: ModuleRegistry::new(),
                router: OpcodeRouter::new(),
                keyring: Keyring::new(),
                teardown: Arc::new(TeardownCoordinator::new()),
            }),
        }
    }

    /// Creates an instance with the software fallback module registered.
    #[must_use]
    pub fn with_software_module(config: AccelConfig) -> Self {
        let accel = Self::new(config);
        if let Err(e) = accel.register_module(Arc::new(SoftwareModule::new())) {
            warn!(error = %e, "software module registration failed");
        }
        accel
    }

    #[must_use]
    pub fn config(&self) -> &AccelConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn registry(&self) -> &ModuleRegistry {
        &self.shared.registry
    }

    #[must_use]
    pub fn keyring(&self) -> &Keyring {
        &self.shared.keyring
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Adds a module.
    ///
    /// # Errors
    ///
    /// - [`AccelError::InvalidState`] once startup has been attempted.
    /// - [`AccelError::AlreadyExists`] for a duplicate module name.
    pub fn register_module(&self, module: Arc<dyn AccelModule>) -> Result<(), AccelError> {
        if self.shared.router.state() != RouterState::Configuring {
            return Err(AccelError::InvalidState(
                "modules can only be registered before startup".to_string(),
            ));
        }
        self.shared.registry.register(module)
    }

    /// Pins `opcode` to the named module. Validated by [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::InvalidState`] once startup has been attempted.
    pub fn assign_opcode(&self, opcode: Opcode, module_name: &str) -> Result<(), AccelError> {
        self.shared.router.assign_override(opcode, module_name)
    }

    /// [`assign_opcode`](Self::assign_opcode) with the opcode given by name.
    ///
    /// # Errors
    ///
    /// Also returns [`AccelError::InvalidArgument`] for an unknown opcode.
    pub fn assign_opcode_by_name(
        &self,
        opcode_name: &str,
        module_name: &str,
    ) -> Result<(), AccelError> {
        self.shared
            .router
            .assign_override_by_name(opcode_name, module_name)
    }

    /// Initializes modules and freezes routing.
    ///
    /// # Errors
    ///
    /// See [`OpcodeRouter::start`].
    pub fn start(&self) -> Result<(), AccelError> {
        self.shared.router.start(&self.shared.registry)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn router_state(&self) -> RouterState {
        self.shared.router.state()
    }

    #[must_use]
    pub fn teardown_phase(&self) -> TeardownPhase {
        self.shared.teardown.phase()
    }

    /// Name of the module serving `opcode`.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::NotFound`] before startup or after teardown.
    pub fn get_opc_module_name(&self, opcode: Opcode) -> Result<String, AccelError> {
        self.shared.router.module_name_for(opcode)
    }

    /// Current `(opcode, module)` bindings, in opcode order.
    #[must_use]
    pub fn opcode_assignments(&self) -> Vec<(Opcode, String)> {
        let table = self.shared.router.table();
        Opcode::ALL
            .into_iter()
            .filter_map(|op| table.module_for(op).map(|m| (op, m.name().to_string())))
            .collect()
    }

    #[must_use]
    pub fn module_info(&self) -> Vec<ModuleInfo> {
        self.shared.registry.module_info()
    }

    pub fn for_each_module<F>(&self, visitor: F)
    where
        F: FnMut(&ModuleInfo),
    {
        self.shared.registry.for_each(visitor);
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    /// Returns the calling thread's channel, creating it on first use.
    ///
    /// # Errors
    ///
    /// - [`AccelError::InvalidState`] unless the framework is started.
    /// - [`AccelError::NoMemory`] if the task pool or a module sub-channel
    ///   cannot be allocated; nothing is left allocated in that case.
    pub fn io_channel(&self) -> Result<AccelChannel, AccelError> {
        let shared = &self.shared;
        if shared.router.state() != RouterState::Started {
            return Err(AccelError::InvalidState(
                "channels are only available while the framework is started".to_string(),
            ));
        }
        let params = ChannelParams {
            framework_id: shared.id,
            pool_capacity: shared.config.task_pool_capacity,
            ctx_size: shared.registry.max_ctx_size(),
            dualcast_alignment: shared.config.dualcast_alignment,
        };
        thread_channel(params, &shared.router.table())
    }

    // -----------------------------------------------------------------------
    // Crypto keys
    // -----------------------------------------------------------------------

    /// Creates and registers a key.
    ///
    /// With `module_name` unset the key is bound to the module serving
    /// [`Opcode::Encrypt`]. If decrypt is served by a different module a
    /// warning is logged, or the call fails when
    /// [`AccelConfig::strict_crypto_routing`] is set.
    ///
    /// # Errors
    ///
    /// - [`AccelError::InvalidArgument`] for missing fields, bad hex, a
    ///   module rejecting the key, or a split crypto routing in strict mode.
    /// - [`AccelError::AlreadyExists`] if the name is taken.
    /// - [`AccelError::NotFound`] if no module can be resolved.
    /// - [`AccelError::NotSupported`] if the module has no key hooks.
    /// - [`AccelError::InvalidState`] once teardown has started, including a
    ///   teardown that begins while the module is initializing the key.
    pub fn crypto_key_create(
        &self,
        module_name: Option<&str>,
        params: &CryptoKeyCreateParams,
    ) -> Result<Arc<CryptoKey>, AccelError> {
        let shared = &self.shared;
        shared
            .keyring
            .create(params, shared.config.max_key_hex_len, || {
                self.resolve_key_module(module_name)
            })
    }

    fn resolve_key_module(&self, module_name: Option<&str>) -> Result<Arc<dyn AccelModule>, AccelError> {
        let shared = &self.shared;
        if let Some(name) = module_name {
            return shared
                .registry
                .find_by_name(name)
                .ok_or_else(|| AccelError::NotFound(format!("module {name}")));
        }

        let encrypt = shared.router.module_for(Opcode::Encrypt).ok_or_else(|| {
            AccelError::NotFound("no module assigned to encrypt".to_string())
        })?;
        let split = Opcode::ALL
            .into_iter()
            .filter(|op| op.is_crypto())
            .filter_map(|op| shared.router.module_for(op).map(|m| (op, m)))
            .find(|(_, m)| m.name() != encrypt.name());
        if let Some((op, other)) = split {
            if shared.config.strict_crypto_routing {
                return Err(AccelError::InvalidArgument(format!(
                    "encrypt is served by {} but {op} by {}",
                    encrypt.name(),
                    other.name()
                )));
            }
            warn!(
                encrypt = encrypt.name(),
                opcode = op.name(),
                module = other.name(),
                "crypto opcodes are served by different modules, key bound to the encrypt module"
            );
        }
        Ok(encrypt)
    }

    /// Unregisters and destroys a key.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::NotFound`] if the key is not registered.
    pub fn crypto_key_destroy(&self, key: &Arc<CryptoKey>) -> Result<(), AccelError> {
        self.shared.keyring.destroy(key)
    }

    #[must_use]
    pub fn crypto_key_get(&self, name: &str) -> Option<Arc<CryptoKey>> {
        self.shared.keyring.get(name)
    }

    /// Descriptions of one key (by name) or of all keys.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::NotFound`] for an unknown name.
    pub fn crypto_keys_info(&self, name: Option<&str>) -> Result<Vec<CryptoKeyInfo>, AccelError> {
        let redact = self.shared.config.redact_key_material;
        match name {
            Some(name) => self
                .crypto_key_get(name)
                .map(|k| vec![k.info(redact)])
                .ok_or_else(|| AccelError::NotFound(format!("crypto key {name}"))),
            None => Ok(self
                .shared
                .keyring
                .snapshot()
                .iter()
                .map(|k| k.info(redact))
                .collect()),
        }
    }

    // -----------------------------------------------------------------------
    // Configuration dump
    // -----------------------------------------------------------------------

    /// Serializes the configuration as replayable administrative calls:
    /// module entries, then opcode overrides, then crypto keys.
    #[must_use]
    pub fn write_config(&self) -> Vec<Value> {
        let shared = &self.shared;
        let mut out = Vec::new();
        for module in shared.registry.modules().iter() {
            module.write_config(&mut out);
        }
        for (op, module) in shared.router.overrides() {
            out.push(json!({
                "method": "accel_assign_opc",
                "params": { "opname": op.name(), "module": module },
            }));
        }
        for key in shared.keyring.snapshot() {
            out.push(json!({
                "method": "accel_crypto_key_create",
                "params": key.info(shared.config.redact_key_material),
            }));
        }
        out
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Tears the framework down: destroys every key, clears the routing
    /// table, then finalizes modules in registration order on the current
    /// tokio runtime. `on_done` runs after the last module has finished.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::InvalidState`] outside a tokio runtime or while
    /// a previous teardown is still running. Nothing is changed in either
    /// case.
    pub fn finish<F>(&self, on_done: F) -> Result<(), AccelError>
    where
        F: FnOnce() + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| {
            AccelError::InvalidState("finish must be called within a tokio runtime".to_string())
        })?;
        let shared = &self.shared;
        let reservation = shared.teardown.reserve(
            shared.registry.modules(),
            runtime,
            Box::new(on_done),
        )?;

        let keys = shared.keyring.destroy_all();
        shared.router.stop();
        info!(framework = shared.id, keys_destroyed = keys, "accel finish requested");
        reservation.run();
        Ok(())
    }

    /// [`finish`](Self::finish) as a future resolving after the last module
    /// has been finalized.
    ///
    /// # Errors
    ///
    /// As [`finish`](Self::finish).
    pub async fn finish_async(&self) -> Result<(), AccelError> {
        let (tx, rx) = oneshot::channel();
        self.finish(move || {
            let _ = tx.send(());
        })?;
        rx.await
            .map_err(|_| AccelError::InvalidState("teardown sequence abandoned".to_string()))
    }
}

impl std::fmt::Debug for Accel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accel")
            .field("id", &self.shared.id)
            .field("modules", &self.shared.registry.len())
            .field("router", &self.router_state())
            .field("teardown", &self.teardown_phase())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
