//! Recycled task objects and the per-channel pool they come from.
//!
//! A [`Task`] owns one slot of its channel's [`TaskPool`] for as long as it is
//! in flight. Completing a task returns the slot to the pool *before* the
//! caller's callback runs, so a callback that immediately submits new work
//! can always reuse the slot it just released. Dropping a task without
//! completing it (for example when a module rejects a submission) returns the
//! slot silently.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use offload_core::Opcode;

use crate::error::AccelError;
use crate::keyring::CryptoKey;

/// Caller continuation, invoked exactly once per accepted task.
pub type CompletionFn = Box<dyn FnOnce(Completion)>;

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Opcode-tagged operation parameters.
///
/// Source buffers are shared, destination buffers are owned by the task while
/// it is in flight and handed back through [`Completion::payload`]. Output
/// values written by the module (`crc`, `output_size`) are read from the same
/// place.
#[derive(Debug)]
pub enum Payload {
    Copy {
        dst: BytesMut,
        src: Bytes,
    },
    Fill {
        dst: BytesMut,
        /// The fill byte replicated into all eight bytes.
        pattern: u64,
    },
    Dualcast {
        dst: BytesMut,
        dst2: BytesMut,
        src: Bytes,
    },
    Compare {
        src: Bytes,
        src2: Bytes,
    },
    Crc32c {
        src: Vec<Bytes>,
        seed: u32,
        crc: u32,
    },
    CopyCrc32c {
        dst: BytesMut,
        src: Vec<Bytes>,
        seed: u32,
        crc: u32,
    },
    Compress {
        dst: BytesMut,
        src: Vec<Bytes>,
        output_size: u32,
    },
    Decompress {
        dst: Vec<BytesMut>,
        src: Vec<Bytes>,
    },
    Encrypt(CryptoPayload),
    Decrypt(CryptoPayload),
}

/// Parameters shared by encrypt and decrypt.
#[derive(Debug)]
pub struct CryptoPayload {
    pub key: Arc<CryptoKey>,
    pub dst: Vec<BytesMut>,
    pub src: Vec<Bytes>,
    /// Initialization vector (tweak) of the first block.
    pub iv: u64,
    pub block_size: u32,
}

impl Payload {
    /// Opcode this payload belongs to.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Payload::Copy { .. } => Opcode::Copy,
            Payload::Fill { .. } => Opcode::Fill,
            Payload::Dualcast { .. } => Opcode::Dualcast,
            Payload::Compare { .. } => Opcode::Compare,
            Payload::Crc32c { .. } => Opcode::Crc32c,
            Payload::CopyCrc32c { .. } => Opcode::CopyCrc32c,
            Payload::Compress { .. } => Opcode::Compress,
            Payload::Decompress { .. } => Opcode::Decompress,
            Payload::Encrypt(_) => Opcode::Encrypt,
            Payload::Decrypt(_) => Opcode::Decrypt,
        }
    }

    /// Number of source bytes the operation processes.
    #[must_use]
    pub fn nbytes(&self) -> u64 {
        match self {
            Payload::Copy { src, .. }
            | Payload::Dualcast { src, .. }
            | Payload::Compare { src, .. } => src.len() as u64,
            Payload::Fill { dst, .. } => dst.len() as u64,
            Payload::Crc32c { src, .. }
            | Payload::CopyCrc32c { src, .. }
            | Payload::Compress { src, .. }
            | Payload::Decompress { src, .. } => total_len(src),
            Payload::Encrypt(p) | Payload::Decrypt(p) => total_len(&p.src),
        }
    }
}

pub(crate) fn total_len<B: AsRef<[u8]>>(bufs: &[B]) -> u64 {
    bufs.iter().map(|b| b.as_ref().len() as u64).sum()
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Outcome of a task, delivered to the caller's callback.
#[derive(Debug)]
pub struct Completion {
    /// `Ok` on success, otherwise the module-reported failure.
    pub status: Result<(), AccelError>,
    /// The task's payload, carrying destination buffers and outputs.
    pub payload: Payload,
}

// ---------------------------------------------------------------------------
// TaskPool
// ---------------------------------------------------------------------------

/// Fixed-capacity pool of task slots for one channel.
///
/// Slots are indices into one contiguous scratch block of
/// `capacity * ctx_size` bytes; the free list is a LIFO stack so the most
/// recently released (cache-hot) slot is reused first.
pub(crate) struct TaskPool {
    block: RefCell<Vec<u8>>,
    free: RefCell<Vec<usize>>,
    capacity: usize,
    ctx_size: usize,
}

impl TaskPool {
    /// Allocates the scratch block and threads every slot onto the free list.
    ///
    /// # Errors
    ///
    /// Returns [`AccelError::NoMemory`] if the block cannot be allocated.
    pub(crate) fn new(capacity: usize, ctx_size: usize) -> Result<Rc<Self>, AccelError> {
        let block_len = capacity
            .checked_mul(ctx_size)
            .ok_or_else(|| AccelError::NoMemory("task pool size overflows".to_string()))?;

        let mut block = Vec::new();
        block
            .try_reserve_exact(block_len)
            .map_err(|e| AccelError::NoMemory(format!("task pool block: {e}")))?;
        block.resize(block_len, 0);

        let mut free = Vec::new();
        free.try_reserve_exact(capacity)
            .map_err(|e| AccelError::NoMemory(format!("task pool free list: {e}")))?;
        // Reversed so slot 0 is handed out first.
        free.extend((0..capacity).rev());

        Ok(Rc::new(Self {
            block: RefCell::new(block),
            free: RefCell::new(free),
            capacity,
            ctx_size,
        }))
    }

    fn pop(self: &Rc<Self>) -> Option<PoolSlot> {
        let index = self.free.borrow_mut().pop()?;
        Some(PoolSlot {
            index,
            pool: Rc::clone(self),
        })
    }

    fn push(&self, index: usize) {
        let mut free = self.free.borrow_mut();
        debug_assert!(free.len() < self.capacity, "task slot released twice");
        free.push(index);
    }

    /// Takes a slot and binds it to a new task, or `None` if the pool is
    /// exhausted.
    pub(crate) fn acquire(
        self: &Rc<Self>,
        payload: Payload,
        flags: u32,
        callback: CompletionFn,
    ) -> Option<Task> {
        let slot = self.pop()?;
        Some(Task {
            payload,
            flags,
            callback,
            slot,
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn available(&self) -> usize {
        self.free.borrow().len()
    }

    pub(crate) fn ctx_size(&self) -> usize {
        self.ctx_size
    }
}

/// RAII ownership of one pool slot. Dropping it returns the slot.
struct PoolSlot {
    index: usize,
    pool: Rc<TaskPool>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.push(self.index);
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// An in-flight operation, handed to a module's channel for execution.
pub struct Task {
    payload: Payload,
    flags: u32,
    callback: CompletionFn,
    slot: PoolSlot,
}

impl Task {
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        self.payload.opcode()
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    /// Caller-supplied flags, passed through to the module uninterpreted.
    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Index of the pool slot this task occupies.
    #[must_use]
    pub fn slot_index(&self) -> usize {
        self.slot.index
    }

    /// Runs `f` over this task's module scratch space.
    ///
    /// Every slot is sized to the largest context advertised by any
    /// registered module. `f` must not complete or submit tasks.
    pub fn with_ctx<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let pool = &self.slot.pool;
        let size = pool.ctx_size;
        let start = self.slot.index * size;
        let mut block = pool.block.borrow_mut();
        f(&mut block[start..start + size])
    }

    /// Finishes the task: the slot goes back to the pool, then the caller's
    /// callback runs with `status` and the payload.
    pub fn complete(self, status: Result<(), AccelError>) {
        let Task {
            payload,
            callback,
            slot,
            ..
        } = self;
        drop(slot);
        callback(Completion { status, payload });
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("opcode", &self.opcode())
            .field("slot", &self.slot.index)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
