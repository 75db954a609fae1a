//! Backend module contract.
//!
//! A module is a pluggable engine (the built-in software fallback or a
//! hardware offload) that claims a set of opcodes. The framework routes each
//! opcode to exactly one module and obtains one [`ModuleChannel`] per opcode
//! on every worker thread that submits work.

use std::rc::Rc;

use offload_core::Opcode;

use crate::error::AccelError;
use crate::keyring::CryptoKey;
use crate::lifecycle::FiniCompletion;
use crate::task::Task;

/// Name reserved for the software fallback module. A module registered under
/// this name is always placed first so every opcode defaults to it.
pub const SOFTWARE_MODULE_NAME: &str = "software";

/// A pluggable acceleration backend.
///
/// Modules are registered with a framework instance before startup and are
/// shared by every worker thread afterwards, so all hooks take `&self`.
/// Per-thread state belongs in the [`ModuleChannel`] returned by
/// [`io_channel`](AccelModule::io_channel).
pub trait AccelModule: Send + Sync + 'static {
    /// Unique, process-wide module name.
    fn name(&self) -> &str;

    /// Called once during framework startup, in registration order.
    ///
    /// A module whose `init` fails is excluded from opcode routing.
    fn init(&self) -> Result<(), AccelError>;

    /// Whether this module can execute `opcode`.
    fn supports_opcode(&self, opcode: Opcode) -> bool;

    /// Bytes of private scratch space this module needs in every task.
    fn ctx_size(&self) -> usize {
        0
    }

    /// Creates a sub-channel for the calling worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error (typically [`AccelError::NoMemory`]) when the backend
    /// has run out of per-thread resources.
    fn io_channel(&self) -> Result<Rc<dyn ModuleChannel>, AccelError>;

    /// Crypto key hooks, present only for modules that handle encryption.
    fn crypto_key_ops(&self) -> Option<&dyn CryptoKeyOps> {
        None
    }

    /// Finalize hook, present only for modules with teardown work.
    fn finalizer(&self) -> Option<&dyn ModuleFini> {
        None
    }

    /// Appends this module's configuration entries to a configuration dump.
    fn write_config(&self, _out: &mut Vec<serde_json::Value>) {}
}

/// A module's per-thread submission endpoint.
///
/// Never shared across threads. Implementations complete each accepted task
/// exactly once via [`Task::complete`], either inside `submit` or later from
/// [`poll`](ModuleChannel::poll).
pub trait ModuleChannel {
    /// Accepts a task for execution.
    ///
    /// # Errors
    ///
    /// Returning an error drops the task without invoking its callback; the
    /// caller sees only the synchronous failure.
    fn submit(&self, task: Task) -> Result<(), AccelError>;

    /// Delivers pending completions. Returns how many tasks were completed.
    fn poll(&self) -> usize {
        0
    }
}

/// Crypto key lifecycle hooks.
pub trait CryptoKeyOps: Send + Sync {
    /// Prepares backend state for a new key. May attach a private handle via
    /// [`CryptoKey::set_module_private`].
    ///
    /// # Errors
    ///
    /// Any error aborts key creation; the key is scrubbed and never
    /// registered.
    fn key_init(&self, key: &mut CryptoKey) -> Result<(), AccelError>;

    /// Releases backend state for a key being destroyed. Key material is still
    /// readable during this call and scrubbed right after it returns.
    fn key_deinit(&self, key: &CryptoKey);
}

/// Module finalize hook.
pub trait ModuleFini: Send + Sync {
    /// Starts module teardown. The teardown sequence resumes with the next
    /// module once `done` is completed or dropped, which may happen inside
    /// this call or at any later point from any thread.
    fn fini(&self, done: FiniCompletion);
}
