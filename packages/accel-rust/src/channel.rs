//! Per-thread submission channel.
//!
//! A worker thread obtains its [`AccelChannel`] from the framework on first
//! use. The channel owns a fixed-size [`TaskPool`] and one module sub-channel
//! per opcode, resolved through the routing table frozen at startup. Clones
//! share the same underlying channel; it is released when the last clone on
//! the thread drops. Channels are `!Send` and never migrate between threads.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use offload_core::{Opcode, OPCODE_COUNT};
use tracing::{debug, warn};

use crate::error::AccelError;
use crate::keyring::CryptoKey;
use crate::module::{AccelModule, ModuleChannel};
use crate::router::RoutingTable;
use crate::task::{total_len, Completion, CompletionFn, CryptoPayload, Payload, Task, TaskPool};

thread_local! {
    /// Live channels of the current thread, keyed by framework instance id.
    static CHANNELS: RefCell<HashMap<u64, Weak<ChannelInner>>> = RefCell::new(HashMap::new());
}

/// Sizing and validation parameters captured when a channel is created.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelParams {
    pub framework_id: u64,
    pub pool_capacity: usize,
    pub ctx_size: usize,
    pub dualcast_alignment: usize,
}

/// Returns the calling thread's channel for a framework instance, creating
/// it if none is alive.
pub(crate) fn thread_channel(
    params: ChannelParams,
    routes: &Arc<RoutingTable>,
) -> Result<AccelChannel, AccelError> {
    let cached = CHANNELS.with(|map| {
        map.borrow()
            .get(&params.framework_id)
            .and_then(Weak::upgrade)
    });
    if let Some(inner) = cached {
        return Ok(AccelChannel { inner });
    }

    let inner = Rc::new(ChannelInner::create(params, routes)?);
    CHANNELS.with(|map| {
        map.borrow_mut()
            .insert(params.framework_id, Rc::downgrade(&inner));
    });
    metrics::counter!("accel_channels_created_total").increment(1);
    debug!(
        framework = params.framework_id,
        pool_capacity = params.pool_capacity,
        ctx_size = params.ctx_size,
        "accel channel created"
    );
    Ok(AccelChannel { inner })
}

// ---------------------------------------------------------------------------
// ChannelInner
// ---------------------------------------------------------------------------

struct ChannelInner {
    framework_id: u64,
    /// Sub-channel serving each opcode, indexed by `Opcode::index`.
    by_opcode: Vec<Rc<dyn ModuleChannel>>,
    /// One entry per distinct module, used for polling.
    distinct: Vec<Rc<dyn ModuleChannel>>,
    pool: Rc<TaskPool>,
    dualcast_alignment: usize,
}

impl ChannelInner {
    fn create(params: ChannelParams, routes: &RoutingTable) -> Result<Self, AccelError> {
        let pool = TaskPool::new(params.pool_capacity, params.ctx_size)?;

        let mut owners: Vec<(Arc<dyn AccelModule>, Rc<dyn ModuleChannel>)> = Vec::new();
        let mut by_opcode = Vec::with_capacity(OPCODE_COUNT);
        for op in Opcode::ALL {
            let module = routes.module_for(op).ok_or_else(|| {
                AccelError::InvalidState(format!("no module assigned to {op}"))
            })?;

            if let Some((_, ch)) = owners.iter().find(|(m, _)| Arc::ptr_eq(m, module)) {
                by_opcode.push(Rc::clone(ch));
                continue;
            }

            // On failure the sub-channels gathered so far and the pool block
            // are dropped here, releasing them.
            let ch = module.io_channel().inspect_err(|e| {
                warn!(
                    module = module.name(),
                    opcode = %op,
                    error = %e,
                    "module failed to create sub-channel, rolling back"
                );
            })?;
            owners.push((Arc::clone(module), Rc::clone(&ch)));
            by_opcode.push(ch);
        }

        Ok(Self {
            framework_id: params.framework_id,
            by_opcode,
            distinct: owners.into_iter().map(|(_, ch)| ch).collect(),
            pool,
            dualcast_alignment: params.dualcast_alignment,
        })
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let id = self.framework_id;
        // The map may already be gone during thread exit, or borrowed if the
        // last clone drops while a new channel is being cached.
        let _ = CHANNELS.try_with(|map| {
            if let Ok(mut map) = map.try_borrow_mut() {
                if map.get(&id).is_some_and(|w| w.strong_count() == 0) {
                    map.remove(&id);
                }
            }
        });
        debug!(framework = id, "accel channel released");
    }
}

// ---------------------------------------------------------------------------
// AccelChannel
// ---------------------------------------------------------------------------

/// Handle to the calling thread's channel.
#[derive(Clone)]
pub struct AccelChannel {
    inner: Rc<ChannelInner>,
}

impl AccelChannel {
    /// Takes a task from the pool, or `None` when the pool is exhausted.
    ///
    /// The task is not submitted; modules and tests use this to drive a
    /// channel's pool directly.
    pub fn acquire_task(
        &self,
        payload: Payload,
        flags: u32,
        callback: impl FnOnce(Completion) + 'static,
    ) -> Option<Task> {
        self.inner.pool.acquire(payload, flags, Box::new(callback))
    }

    /// Number of tasks currently free in the pool.
    #[must_use]
    pub fn available_tasks(&self) -> usize {
        self.inner.pool.available()
    }

    /// Total number of tasks in the pool.
    #[must_use]
    pub fn task_pool_capacity(&self) -> usize {
        self.inner.pool.capacity()
    }

    /// Bytes of module scratch space carried by every task.
    #[must_use]
    pub fn task_ctx_size(&self) -> usize {
        self.inner.pool.ctx_size()
    }

    /// Drives every module sub-channel once. Returns the number of
    /// completions delivered.
    pub fn poll(&self) -> usize {
        self.inner.distinct.iter().map(|ch| ch.poll()).sum()
    }

    fn submit(&self, payload: Payload, flags: u32, callback: CompletionFn) -> Result<(), AccelError> {
        let opcode = payload.opcode();
        let nbytes = payload.nbytes();
        let Some(task) = self.inner.pool.acquire(payload, flags, callback) else {
            metrics::counter!("accel_task_pool_exhausted_total").increment(1);
            return Err(AccelError::NoMemory("task pool exhausted".to_string()));
        };
        metrics::counter!("accel_tasks_submitted_total", "opcode" => opcode.name()).increment(1);
        metrics::counter!("accel_bytes_submitted_total", "opcode" => opcode.name()).increment(nbytes);
        self.inner.by_opcode[opcode.index()].submit(task)
    }

    /// Copies `src` into the front of `dst`.
    ///
    /// # Errors
    ///
    /// [`AccelError::InvalidArgument`] if `dst` is shorter than `src`,
    /// [`AccelError::NoMemory`] if the task pool is exhausted, or the module's
    /// submission error.
    pub fn submit_copy(
        &self,
        dst: BytesMut,
        src: Bytes,
        flags: u32,
        callback: impl FnOnce(Completion) + 'static,
    ) -> Result<(), AccelError> {
        check_capacity("copy", dst.len(), src.len() as u64)?;
        self.submit(Payload::Copy { dst, src }, flags, Box::new(callback))
    }

    /// Copies `src` into both destinations. Both destinations must be aligned
    /// to the configured dualcast boundary.
    ///
    /// # Errors
    ///
    /// [`AccelError::InvalidArgument`] on misalignment or short destinations,
    /// plus the errors of [`submit_copy`](Self::submit_copy).
    pub fn submit_dualcast(
        &self,
        dst: BytesMut,
        dst2: BytesMut,
        src: Bytes,
        flags: u32,
        callback: impl FnOnce(Completion) + 'static,
    ) -> Result<(), AccelError> {
        let align = self.inner.dualcast_alignment;
        if !is_aligned(&dst, align) || !is_aligned(&dst2, align) {
            return Err(AccelError::InvalidArgument(format!(
                "dualcast destinations must be aligned to {align} bytes"
            )));
        }
        check_capacity("dualcast", dst.len(), src.len() as u64)?;
        check_capacity("dualcast", dst2.len(), src.len() as u64)?;
        self.submit(Payload::Dualcast { dst, dst2, src }, flags, Box::new(callback))
    }

    /// Compares two equally sized buffers. A difference completes with
    /// [`AccelError::Miscompare`].
    ///
    /// # Errors
    ///
    /// [`AccelError::InvalidArgument`] if the lengths differ, otherwise as
    /// [`submit_copy`](Self::submit_copy).
    pub fn submit_compare(
        &self,
        src: Bytes,
        src2: Bytes,
        flags: u32,
        callback: impl FnOnce(Completion) + 'static,
    ) -> Result<(), AccelError> {
        if src.len() != src2.len() {
            return Err(AccelError::InvalidArgument(format!(
                "compare lengths differ: {} vs {}",
                src.len(),
                src2.len()
            )));
        }
        self.submit(Payload::Compare { src, src2 }, flags, Box::new(callback))
    }

    /// Fills `dst` with `fill`.
    ///
    /// # Errors
    ///
    /// As [`submit_copy`](Self::submit_copy).
    pub fn submit_fill(
        &self,
        dst: BytesMut,
        fill: u8,
        flags: u32,
        callback: impl FnOnce(Completion) + 'static,
    ) -> Result<(), AccelError> {
        let pattern = u64::from_ne_bytes([fill; 8]);
        self.submit(Payload::Fill { dst, pattern }, flags, Box::new(callback))
    }

    /// Computes the CRC-32C of one buffer starting from `seed`.
    ///
    /// # Errors
    ///
    /// As [`submit_copy`](Self::submit_copy).
    pub fn submit_crc32c(
        &self,
        src: Bytes,
        seed: u32,
        flags: u32,
        callback: impl FnOnce(Completion) + 'static,
    ) -> Result<(), AccelError> {
        self.submit_crc32cv(vec![src], seed, flags, callback)
    }

    /// Computes the CRC-32C across a scatter list starting from `seed`.
    ///
    /// # Errors
    ///
    /// [`AccelError::InvalidArgument`] for an empty list, otherwise as
    /// [`submit_copy`](Self::submit_copy).
    pub fn submit_crc32cv(
        &self,
        src: Vec<Bytes>,
        seed: u32,
        flags: u32,
        callback: impl FnOnce(Completion) + 'static,
    ) -> Result<(), AccelError> {
        check_not_empty("crc32c source", &src)?;
        self.submit(Payload::Crc32c { src, seed, crc: 0 }, flags, Box::new(callback))
    }

    /// Copies `src` into `dst` and computes its CRC-32C.
    ///
    /// # Errors
    ///
    /// As [`submit_copy_crc32cv`](Self::submit_copy_crc32cv).
    pub fn submit_copy_crc32c(
        &self,
        dst: BytesMut,
        src: Bytes,
        seed: u32,
        flags: u32,
        callback: impl FnOnce(Completion) + 'static,
    ) -> Result<(), AccelError> {
        self.submit_copy_crc32cv(dst, vec![src], seed, flags, callback)
    }

    /// Gathers a scatter list into `dst` and computes its CRC-32C.
    ///
    /// # Errors
    ///
    /// [`AccelError::InvalidArgument`] for an empty list or a short
    /// destination, otherwise as [`submit_copy`](Self::submit_copy).
    pub fn submit_copy_crc32cv(
        &self,
        dst: BytesMut,
        src: Vec<Bytes>,
        seed: u32,
        flags: u32,
        callback: impl FnOnce(Completion) + 'static,
    ) -> Result<(), AccelError> {
        check_not_empty("copy_crc32c source", &src)?;
        check_capacity("copy_crc32c", dst.len(), total_len(&src))?;
        self.submit(
            Payload::CopyCrc32c {
                dst,
                src,
                seed,
                crc: 0,
            },
            flags,
            Box::new(callback),
        )
    }

    /// Compresses a scatter list into `dst`. The compressed length is
    /// reported in the completion payload's `output_size`.
    ///
    /// # Errors
    ///
    /// [`AccelError::InvalidArgument`] for an empty source list, otherwise as
    /// [`submit_copy`](Self::submit_copy).
    pub fn submit_compress(
        &self,
        dst: BytesMut,
        src: Vec<Bytes>,
        flags: u32,
        callback: impl FnOnce(Completion) + 'static,
    ) -> Result<(), AccelError> {
        check_not_empty("compress source", &src)?;
        self.submit(
            Payload::Compress {
                dst,
                src,
                output_size: 0,
            },
            flags,
            Box::new(callback),
        )
    }

    /// Decompresses a scatter list into a destination scatter list.
    ///
    /// # Errors
    ///
    /// [`AccelError::InvalidArgument`] for an empty list on either side,
    /// otherwise as [`submit_copy`](Self::submit_copy).
    pub fn submit_decompress(
        &self,
        dst: Vec<BytesMut>,
        src: Vec<Bytes>,
        flags: u32,
        callback: impl FnOnce(Completion) + 'static,
    ) -> Result<(), AccelError> {
        check_not_empty("decompress source", &src)?;
        check_not_empty("decompress destination", &dst)?;
        self.submit(Payload::Decompress { dst, src }, flags, Box::new(callback))
    }

    /// Encrypts `src` into `dst` with `key`, starting at tweak `iv`.
    ///
    /// # Errors
    ///
    /// - [`AccelError::InvalidArgument`] for empty scatter lists or a zero
    ///   block size.
    /// - [`AccelError::LengthMismatch`] when source and destination totals
    ///   differ or are zero. Checked before a task is taken from the pool.
    /// - Otherwise as [`submit_copy`](Self::submit_copy).
    #[allow(clippy::too_many_arguments)]
    pub fn submit_encrypt(
        &self,
        key: &Arc<CryptoKey>,
        dst: Vec<BytesMut>,
        src: Vec<Bytes>,
        iv: u64,
        block_size: u32,
        flags: u32,
        callback: impl FnOnce(Completion) + 'static,
    ) -> Result<(), AccelError> {
        let payload = crypto_payload(key, dst, src, iv, block_size)?;
        self.submit(Payload::Encrypt(payload), flags, Box::new(callback))
    }

    /// Decrypts `src` into `dst` with `key`, starting at tweak `iv`.
    ///
    /// # Errors
    ///
    /// As [`submit_encrypt`](Self::submit_encrypt).
    #[allow(clippy::too_many_arguments)]
    pub fn submit_decrypt(
        &self,
        key: &Arc<CryptoKey>,
        dst: Vec<BytesMut>,
        src: Vec<Bytes>,
        iv: u64,
        block_size: u32,
        flags: u32,
        callback: impl FnOnce(Completion) + 'static,
    ) -> Result<(), AccelError> {
        let payload = crypto_payload(key, dst, src, iv, block_size)?;
        self.submit(Payload::Decrypt(payload), flags, Box::new(callback))
    }
}

impl std::fmt::Debug for AccelChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelChannel")
            .field("framework", &self.inner.framework_id)
            .field("available_tasks", &self.available_tasks())
            .finish_non_exhaustive()
    }
}

fn crypto_payload(
    key: &Arc<CryptoKey>,
    dst: Vec<BytesMut>,
    src: Vec<Bytes>,
    iv: u64,
    block_size: u32,
) -> Result<CryptoPayload, AccelError> {
    check_not_empty("crypto source", &src)?;
    check_not_empty("crypto destination", &dst)?;
    if block_size == 0 {
        return Err(AccelError::InvalidArgument(
            "block size must be non-zero".to_string(),
        ));
    }
    let src_len = total_len(&src);
    let dst_len = total_len(&dst);
    if src_len != dst_len || src_len == 0 {
        return Err(AccelError::LengthMismatch {
            src: src_len,
            dst: dst_len,
        });
    }
    Ok(CryptoPayload {
        key: Arc::clone(key),
        dst,
        src,
        iv,
        block_size,
    })
}

fn is_aligned(buf: &BytesMut, align: usize) -> bool {
    align <= 1 || (buf.as_ptr() as usize) % align == 0
}

fn check_capacity(what: &str, dst_len: usize, needed: u64) -> Result<(), AccelError> {
    if (dst_len as u64) < needed {
        return Err(AccelError::InvalidArgument(format!(
            "{what} destination holds {dst_len} bytes, {needed} required"
        )));
    }
    Ok(())
}

fn check_not_empty<T>(what: &str, list: &[T]) -> Result<(), AccelError> {
    if list.is_empty() {
        return Err(AccelError::InvalidArgument(format!("{what} list is empty")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
