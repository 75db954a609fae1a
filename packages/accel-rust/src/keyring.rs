//! Named crypto keys and the keyring that owns them.
//!
//! Keys are created from hex-encoded material, bound to the module that will
//! execute encrypt/decrypt with them, and handed out as `Arc<CryptoKey>`.
//! Destroying a key takes the material out of the key and scrubs it right
//! away, so a stale `Arc` held elsewhere observes an empty key rather than
//! live secrets.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use offload_core::unhexlify;
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::AccelError;
use crate::module::AccelModule;

/// Opaque per-key state attached by a module's `key_init` hook.
pub type ModulePrivate = Box<dyn Any + Send + Sync>;

/// Placeholder emitted instead of key material when redaction is enabled.
pub const REDACTED: &str = "<redacted>";

// ---------------------------------------------------------------------------
// KeyMaterial
// ---------------------------------------------------------------------------

/// Decoded key bytes plus the hex text they came from. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct KeyMaterial {
    key1: Vec<u8>,
    key2: Option<Vec<u8>>,
    key1_hex: String,
    key2_hex: Option<String>,
}

impl KeyMaterial {
    /// Decodes one or two hex secrets. If the second fails to decode the
    /// first is wiped as the partial material drops.
    pub(crate) fn decode(
        key_hex: &str,
        key2_hex: Option<&str>,
        max_hex_len: usize,
    ) -> Result<Self, AccelError> {
        let mut material = Self {
            key1: unhexlify(key_hex, max_hex_len)?,
            key2: None,
            key1_hex: key_hex.to_string(),
            key2_hex: None,
        };
        if let Some(hex2) = key2_hex {
            material.key2 = Some(unhexlify(hex2, max_hex_len)?);
            material.key2_hex = Some(hex2.to_string());
        }
        Ok(material)
    }
}

// ---------------------------------------------------------------------------
// CryptoKey
// ---------------------------------------------------------------------------

/// A named encryption key bound to one module.
pub struct CryptoKey {
    name: String,
    cipher: String,
    driver: Option<String>,
    module: Arc<dyn AccelModule>,
    /// `None` once the key has been destroyed.
    material: RwLock<Option<KeyMaterial>>,
    module_private: Mutex<Option<ModulePrivate>>,
}

impl CryptoKey {
    pub(crate) fn new(
        name: String,
        cipher: String,
        driver: Option<String>,
        module: Arc<dyn AccelModule>,
        material: KeyMaterial,
    ) -> Self {
        Self {
            name,
            cipher,
            driver,
            module,
            material: RwLock::new(Some(material)),
            module_private: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn cipher(&self) -> &str {
        &self.cipher
    }

    /// Backend driver requested at creation, if any.
    #[must_use]
    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    /// Module that initialized this key and executes operations with it.
    #[must_use]
    pub fn module(&self) -> &Arc<dyn AccelModule> {
        &self.module
    }

    /// Primary secret, or `None` after the key was destroyed.
    #[must_use]
    pub fn key1(&self) -> Option<MappedRwLockReadGuard<'_, [u8]>> {
        RwLockReadGuard::try_map(self.material.read(), |m| {
            m.as_ref().map(|m| m.key1.as_slice())
        })
        .ok()
    }

    /// Secondary secret (e.g. the XTS tweak key), if one was supplied and the
    /// key is still live.
    #[must_use]
    pub fn key2(&self) -> Option<MappedRwLockReadGuard<'_, [u8]>> {
        RwLockReadGuard::try_map(self.material.read(), |m| {
            m.as_ref().and_then(|m| m.key2.as_deref())
        })
        .ok()
    }

    /// Whether the key still holds material.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.material.read().is_some()
    }

    /// Attaches module-private state, replacing any previous value.
    pub fn set_module_private(&self, private: ModulePrivate) {
        *self.module_private.lock() = Some(private);
    }

    /// Detaches and returns the module-private state.
    pub fn take_module_private(&self) -> Option<ModulePrivate> {
        self.module_private.lock().take()
    }

    /// Runs `f` with a reference to the module-private state.
    pub fn with_module_private<R>(&self, f: impl FnOnce(Option<&(dyn Any + Send + Sync)>) -> R) -> R {
        let guard = self.module_private.lock();
        f(guard.as_deref())
    }

    /// Takes the material out and wipes it.
    fn scrub(&self) {
        let material = self.material.write().take();
        drop(material);
    }

    /// Serializable description, with material replaced by [`REDACTED`] when
    /// `redact` is set.
    #[must_use]
    pub fn info(&self, redact: bool) -> CryptoKeyInfo {
        let material = self.material.read();
        let (key, key2) = match material.as_ref() {
            Some(m) if redact => (
                REDACTED.to_string(),
                m.key2_hex.as_ref().map(|_| REDACTED.to_string()),
            ),
            Some(m) => (m.key1_hex.clone(), m.key2_hex.clone()),
            None => (String::new(), None),
        };
        CryptoKeyInfo {
            name: self.name.clone(),
            module: self.module.name().to_string(),
            cipher: self.cipher.clone(),
            key,
            key2,
            driver: self.driver.clone(),
        }
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoKey")
            .field("name", &self.name)
            .field("cipher", &self.cipher)
            .field("module", &self.module.name())
            .field("driver", &self.driver)
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

/// Key description as emitted by configuration dumps and key queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CryptoKeyInfo {
    pub name: String,
    pub module: String,
    pub cipher: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}

// ---------------------------------------------------------------------------
// CryptoKeyCreateParams
// ---------------------------------------------------------------------------

/// Parameters for creating a key. `cipher`, `key` and `name` are required.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct CryptoKeyCreateParams {
    pub cipher: Option<String>,
    /// Hex-encoded primary secret.
    pub key: Option<String>,
    /// Hex-encoded secondary secret.
    pub key2: Option<String>,
    pub name: Option<String>,
    pub driver: Option<String>,
}

impl CryptoKeyCreateParams {
    #[must_use]
    pub fn new(name: &str, cipher: &str, key_hex: &str) -> Self {
        Self {
            cipher: Some(cipher.to_string()),
            key: Some(key_hex.to_string()),
            key2: None,
            name: Some(name.to_string()),
            driver: None,
        }
    }

    #[must_use]
    pub fn with_key2(mut self, key2_hex: &str) -> Self {
        self.key2 = Some(key2_hex.to_string());
        self
    }

    #[must_use]
    pub fn with_driver(mut self, driver: &str) -> Self {
        self.driver = Some(driver.to_string());
        self
    }
}

impl fmt::Debug for CryptoKeyCreateParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoKeyCreateParams")
            .field("name", &self.name)
            .field("cipher", &self.cipher)
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

fn required<'a>(field: &str, value: Option<&'a String>) -> Result<&'a str, AccelError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.as_str()),
        _ => Err(AccelError::InvalidArgument(format!("missing {field}"))),
    }
}

// ---------------------------------------------------------------------------
// Keyring
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Ring {
    keys: Vec<Arc<CryptoKey>>,
    /// Set by teardown; no key is registered afterwards.
    closed: bool,
}

/// Registry of live keys, unique by name.
#[derive(Default)]
pub struct Keyring {
    ring: Mutex<Ring>,
}

fn closed_error() -> AccelError {
    AccelError::InvalidState("keyring closed by teardown".to_string())
}

impl Keyring {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates, initializes and registers a key.
    ///
    /// `resolve_module` is called only after the parameters are validated and
    /// the name is known to be free. Nothing is registered unless every step
    /// succeeds; partially decoded material is wiped on the way out. A key
    /// whose `key_init` finished after teardown closed the ring is
    /// deinitialized and scrubbed instead of registered.
    ///
    /// # Errors
    ///
    /// - [`AccelError::InvalidState`] once teardown has closed the ring.
    /// - [`AccelError::InvalidArgument`] for missing fields, bad hex, or a
    ///   `key_init` rejection.
    /// - [`AccelError::AlreadyExists`] if the name is taken.
    /// - Whatever `resolve_module` returns.
    /// - [`AccelError::NotSupported`] if the module has no key hooks.
    pub(crate) fn create<F>(
        &self,
        params: &CryptoKeyCreateParams,
        max_hex_len: usize,
        resolve_module: F,
    ) -> Result<Arc<CryptoKey>, AccelError>
    where
        F: FnOnce() -> Result<Arc<dyn AccelModule>, AccelError>,
    {
        let cipher = required("cipher", params.cipher.as_ref())?;
        let key_hex = required("key", params.key.as_ref())?;
        let name = required("name", params.name.as_ref())?;

        {
            let ring = self.ring.lock();
            if ring.closed {
                return Err(closed_error());
            }
            if ring.keys.iter().any(|k| k.name == name) {
                return Err(AccelError::AlreadyExists(format!("crypto key {name}")));
            }
        }

        let module = resolve_module()?;
        let Some(ops) = module.crypto_key_ops() else {
            return Err(AccelError::NotSupported(format!(
                "module {} has no crypto key support",
                module.name()
            )));
        };

        let material = KeyMaterial::decode(key_hex, params.key2.as_deref(), max_hex_len)?;
        let mut key = CryptoKey::new(
            name.to_string(),
            cipher.to_string(),
            params.driver.clone(),
            Arc::clone(&module),
            material,
        );
        ops.key_init(&mut key).map_err(|e| {
            warn!(key = name, module = module.name(), error = %e, "crypto key init failed");
            AccelError::InvalidArgument(format!(
                "module {} rejected crypto key {name}: {e}",
                module.name()
            ))
        })?;

        let key = Arc::new(key);
        let rejection = {
            let mut ring = self.ring.lock();
            if ring.closed {
                closed_error()
            } else if ring.keys.iter().any(|k| k.name == key.name) {
                // Lost a race with a concurrent create of the same name.
                AccelError::AlreadyExists(format!("crypto key {name}"))
            } else {
                ring.keys.push(Arc::clone(&key));
                info!(key = name, module = module.name(), cipher, "crypto key created");
                return Ok(key);
            }
        };

        ops.key_deinit(&key);
        key.scrub();
        Err(rejection)
    }

    /// Unregisters `key`, runs its module's deinit hook and wipes its
    /// material.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::NotFound`] if this exact key is not registered.
    pub fn destroy(&self, key: &Arc<CryptoKey>) -> Result<(), AccelError> {
        {
            let mut ring = self.ring.lock();
            let Some(pos) = ring.keys.iter().position(|k| Arc::ptr_eq(k, key)) else {
                return Err(AccelError::NotFound(format!("crypto key {}", key.name)));
            };
            ring.keys.remove(pos);
        }
        retire(key);
        info!(key = %key.name, "crypto key destroyed");
        Ok(())
    }

    /// Closes the ring to new keys, then unregisters and destroys every key.
    /// Returns how many were destroyed.
    pub(crate) fn destroy_all(&self) -> usize {
        let drained = {
            let mut ring = self.ring.lock();
            ring.closed = true;
            std::mem::take(&mut ring.keys)
        };
        for key in &drained {
            retire(key);
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "crypto keys destroyed");
        }
        drained.len()
    }

    /// Looks up a live key by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CryptoKey>> {
        self.ring.lock().keys.iter().find(|k| k.name == name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.ring.lock().keys.iter().any(|k| k.name == name)
    }

    /// Registered keys in creation order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<CryptoKey>> {
        self.ring.lock().keys.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.lock().keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Module deinit followed by scrub. Runs outside the keyring lock.
fn retire(key: &CryptoKey) {
    if let Some(ops) = key.module.crypto_key_ops() {
        ops.key_deinit(key);
    }
    key.scrub();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
