//! Test doubles shared by the unit tests of this crate.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use bytes::BytesMut;
use offload_core::{Opcode, MAX_KEY_HEX_LEN};
use parking_lot::Mutex;

use crate::error::AccelError;
use crate::keyring::{CryptoKey, KeyMaterial};
use crate::lifecycle::FiniCompletion;
use crate::module::{AccelModule, CryptoKeyOps, ModuleChannel, ModuleFini};
use crate::task::{Payload, Task};

/// Ordered record of hook invocations, shareable across modules.
#[derive(Clone, Default)]
pub(crate) struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub(crate) fn push(&self, entry: String) {
        self.0.lock().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// Slot where a deferred finalize hook parks its completion token.
#[derive(Clone, Default)]
pub(crate) struct DeferredFini(Arc<Mutex<Option<FiniCompletion>>>);

/// Yields until the deferred hook has run, then returns its token.
pub(crate) async fn wait_for_deferred(slot: &DeferredFini) -> FiniCompletion {
    loop {
        if let Some(token) = slot.0.lock().take() {
            return token;
        }
        tokio::task::yield_now().await;
    }
}

/// Module side of a gate that parks `key_init` until the test releases it.
pub(crate) struct KeyInitGate {
    entered: mpsc::Sender<()>,
    release: Mutex<mpsc::Receiver<()>>,
}

/// Test side of a [`KeyInitGate`].
pub(crate) struct KeyInitGateHandle {
    pub(crate) entered: mpsc::Receiver<()>,
    pub(crate) release: mpsc::Sender<()>,
}

pub(crate) fn key_init_gate() -> (KeyInitGate, KeyInitGateHandle) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    (
        KeyInitGate {
            entered: entered_tx,
            release: Mutex::new(release_rx),
        },
        KeyInitGateHandle {
            entered: entered_rx,
            release: release_tx,
        },
    )
}

enum FiniBehavior {
    Absent,
    Immediate,
    Deferred(DeferredFini),
}

/// Configurable module. Claims the given opcodes and completes every task
/// successfully on `poll`, stamping CRC outputs with the length of its name so
/// tests can tell which module served a request.
pub(crate) struct MockModule {
    name: String,
    opcodes: Vec<Opcode>,
    ctx_size: usize,
    fail_init: bool,
    fail_channel: bool,
    reject_submit: bool,
    crypto: bool,
    fail_key_init: bool,
    key_init_gate: Option<KeyInitGate>,
    fini: FiniBehavior,
    log: EventLog,
    channels_opened: Option<Arc<AtomicUsize>>,
    live_channels: Option<Arc<AtomicUsize>>,
    config: Vec<serde_json::Value>,
}

impl MockModule {
    pub(crate) fn new(name: &str, opcodes: &[Opcode]) -> Self {
        Self {
            name: name.to_string(),
            opcodes: opcodes.to_vec(),
            ctx_size: 0,
            fail_init: false,
            fail_channel: false,
            reject_submit: false,
            crypto: false,
            fail_key_init: false,
            key_init_gate: None,
            fini: FiniBehavior::Absent,
            log: EventLog::default(),
            channels_opened: None,
            live_channels: None,
            config: Vec::new(),
        }
    }

    pub(crate) fn with_ctx_size(mut self, size: usize) -> Self {
        self.ctx_size = size;
        self
    }

    pub(crate) fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub(crate) fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub(crate) fn failing_channel(mut self) -> Self {
        self.fail_channel = true;
        self
    }

    pub(crate) fn rejecting_submit(mut self) -> Self {
        self.reject_submit = true;
        self
    }

    pub(crate) fn with_crypto_keys(mut self) -> Self {
        self.crypto = true;
        self
    }

    pub(crate) fn failing_key_init(mut self) -> Self {
        self.fail_key_init = true;
        self
    }

    pub(crate) fn with_key_init_gate(mut self, gate: KeyInitGate) -> Self {
        self.key_init_gate = Some(gate);
        self
    }

    pub(crate) fn with_immediate_fini(mut self) -> Self {
        self.fini = FiniBehavior::Immediate;
        self
    }

    pub(crate) fn with_deferred_fini(mut self, slot: &DeferredFini) -> Self {
        self.fini = FiniBehavior::Deferred(slot.clone());
        self
    }

    pub(crate) fn with_channel_counter(mut self, opened: &Arc<AtomicUsize>) -> Self {
        self.channels_opened = Some(Arc::clone(opened));
        self
    }

    pub(crate) fn with_live_channels(mut self, live: &Arc<AtomicUsize>) -> Self {
        self.live_channels = Some(Arc::clone(live));
        self
    }

    pub(crate) fn with_config_entry(mut self, entry: serde_json::Value) -> Self {
        self.config.push(entry);
        self
    }

    pub(crate) fn into_arc(self) -> Arc<dyn AccelModule> {
        Arc::new(self)
    }
}

impl AccelModule for MockModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self) -> Result<(), AccelError> {
        self.log.push(format!("init:{}", self.name));
        if self.fail_init {
            return Err(AccelError::Backend {
                module: self.name.clone(),
                code: -19,
            });
        }
        Ok(())
    }

    fn supports_opcode(&self, opcode: Opcode) -> bool {
        self.opcodes.contains(&opcode)
    }

    fn ctx_size(&self) -> usize {
        self.ctx_size
    }

    fn io_channel(&self) -> Result<Rc<dyn ModuleChannel>, AccelError> {
        if self.fail_channel {
            return Err(AccelError::NoMemory(format!("{} channel", self.name)));
        }
        if let Some(opened) = &self.channels_opened {
            opened.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(live) = &self.live_channels {
            live.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Rc::new(MockChannel {
            module: self.name.clone(),
            reject: self.reject_submit,
            queue: RefCell::new(VecDeque::new()),
            live: self.live_channels.clone(),
        }))
    }

    fn crypto_key_ops(&self) -> Option<&dyn CryptoKeyOps> {
        if self.crypto {
            Some(self)
        } else {
            None
        }
    }

    fn finalizer(&self) -> Option<&dyn ModuleFini> {
        match self.fini {
            FiniBehavior::Absent => None,
            FiniBehavior::Immediate | FiniBehavior::Deferred(_) => Some(self),
        }
    }

    fn write_config(&self, out: &mut Vec<serde_json::Value>) {
        out.extend(self.config.iter().cloned());
    }
}

impl CryptoKeyOps for MockModule {
    fn key_init(&self, key: &mut CryptoKey) -> Result<(), AccelError> {
        self.log.push(format!("key_init:{}", key.name()));
        if let Some(gate) = &self.key_init_gate {
            let _ = gate.entered.send(());
            let _ = gate.release.lock().recv();
        }
        if self.fail_key_init {
            return Err(AccelError::Backend {
                module: self.name.clone(),
                code: -5,
            });
        }
        key.set_module_private(Box::new(key.name().to_string()));
        Ok(())
    }

    fn key_deinit(&self, key: &CryptoKey) {
        let state = if key.is_live() { "live" } else { "dead" };
        self.log.push(format!("key_deinit:{}:{state}", key.name()));
        drop(key.take_module_private());
    }
}

impl ModuleFini for MockModule {
    fn fini(&self, done: FiniCompletion) {
        self.log.push(format!("fini:{}", self.name));
        match &self.fini {
            FiniBehavior::Deferred(slot) => *slot.0.lock() = Some(done),
            FiniBehavior::Immediate | FiniBehavior::Absent => done.complete(),
        }
    }
}

struct MockChannel {
    module: String,
    reject: bool,
    queue: RefCell<VecDeque<Task>>,
    live: Option<Arc<AtomicUsize>>,
}

impl ModuleChannel for MockChannel {
    fn submit(&self, task: Task) -> Result<(), AccelError> {
        if self.reject {
            return Err(AccelError::Backend {
                module: self.module.clone(),
                code: -5,
            });
        }
        self.queue.borrow_mut().push_back(task);
        Ok(())
    }

    fn poll(&self) -> usize {
        let ready = std::mem::take(&mut *self.queue.borrow_mut());
        let count = ready.len();
        for mut task in ready {
            let stamp = u32::try_from(self.module.len()).unwrap_or(u32::MAX);
            if let Payload::Crc32c { crc, .. } | Payload::CopyCrc32c { crc, .. } = task.payload_mut() {
                *crc = stamp;
            }
            task.complete(Ok(()));
        }
        count
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A live key bound to a crypto-capable mock module, outside any keyring.
pub(crate) fn test_key() -> Arc<CryptoKey> {
    let module = MockModule::new("crypto", &[Opcode::Encrypt, Opcode::Decrypt])
        .with_crypto_keys()
        .into_arc();
    let material = KeyMaterial::decode("00112233", None, MAX_KEY_HEX_LEN).unwrap();
    Arc::new(CryptoKey::new(
        "test".to_string(),
        "AES_CBC".to_string(),
        None,
        module,
        material,
    ))
}

/// A zeroed buffer of `len` bytes whose start is aligned to `align`.
pub(crate) fn aligned_buf(align: usize, len: usize) -> BytesMut {
    let mut buf = BytesMut::zeroed(len + align);
    let offset = (align - (buf.as_ptr() as usize % align)) % align;
    let mut aligned = buf.split_off(offset);
    aligned.truncate(len);
    aligned
}
