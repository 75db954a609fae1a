//! Offload acceleration framework: routes typed bulk-data operations to
//! pluggable software or hardware modules through per-thread task pools.

pub mod channel;
pub mod config;
pub mod error;
pub mod framework;
pub mod keyring;
pub mod lifecycle;
pub mod logging;
pub mod module;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod software;
pub mod task;

#[cfg(test)]
mod testing;

pub use channel::AccelChannel;
pub use config::{AccelConfig, LogConfig};
pub use error::AccelError;
pub use framework::Accel;
pub use keyring::{CryptoKey, CryptoKeyCreateParams, CryptoKeyInfo, Keyring};
pub use lifecycle::{FiniCompletion, TeardownPhase};
pub use logging::init_tracing;
pub use module::{AccelModule, CryptoKeyOps, ModuleChannel, ModuleFini, SOFTWARE_MODULE_NAME};
pub use offload_core::{Opcode, OPCODE_COUNT};
pub use registry::{ModuleInfo, ModuleRegistry};
pub use router::{OpcodeRouter, RouterState};
pub use software::SoftwareModule;
pub use task::{Completion, CryptoPayload, Payload, Task};
