//! Built-in software fallback module.
//!
//! Claims every opcode so that routing is always complete. Executes the
//! memory operations and CRC-32C on the submitting thread and queues the
//! result; completions are delivered by the next `poll` of the channel.
//! Compression and crypto have no software engine here and complete with
//! [`AccelError::NotSupported`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::BytesMut;
use offload_core::crc32c::crc32c_update;
use offload_core::Opcode;

use crate::error::AccelError;
use crate::module::{AccelModule, ModuleChannel, SOFTWARE_MODULE_NAME};
use crate::task::{Payload, Task};

/// The software module. Register it through
/// [`Accel::with_software_module`](crate::Accel::with_software_module).
#[derive(Debug, Default)]
pub struct SoftwareModule;

impl SoftwareModule {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl AccelModule for SoftwareModule {
    fn name(&self) -> &str {
        SOFTWARE_MODULE_NAME
    }

    fn init(&self) -> Result<(), AccelError> {
        Ok(())
    }

    fn supports_opcode(&self, _opcode: Opcode) -> bool {
        true
    }

    fn io_channel(&self) -> Result<Rc<dyn ModuleChannel>, AccelError> {
        Ok(Rc::new(SwChannel::default()))
    }
}

#[derive(Default)]
struct SwChannel {
    completed: RefCell<VecDeque<(Task, Result<(), AccelError>)>>,
}

impl ModuleChannel for SwChannel {
    fn submit(&self, mut task: Task) -> Result<(), AccelError> {
        let status = execute(task.payload_mut());
        self.completed.borrow_mut().push_back((task, status));
        Ok(())
    }

    fn poll(&self) -> usize {
        // Callbacks may submit again; those land in the fresh queue and wait
        // for the next poll.
        let ready = std::mem::take(&mut *self.completed.borrow_mut());
        let count = ready.len();
        for (task, status) in ready {
            task.complete(status);
        }
        count
    }
}

fn execute(payload: &mut Payload) -> Result<(), AccelError> {
    match payload {
        Payload::Copy { dst, src } => copy_into(dst, src),
        Payload::Fill { dst, pattern } => {
            let byte = pattern.to_ne_bytes()[0];
            dst.fill(byte);
            Ok(())
        }
        Payload::Dualcast { dst, dst2, src } => {
            copy_into(dst, src)?;
            copy_into(dst2, src)
        }
        Payload::Compare { src, src2 } => {
            match src.iter().zip(src2.iter()).position(|(a, b)| a != b) {
                Some(offset) => Err(AccelError::Miscompare {
                    offset: offset as u64,
                }),
                None => Ok(()),
            }
        }
        Payload::Crc32c { src, seed, crc } => {
            *crc = src.iter().fold(!*seed, |acc, seg| crc32c_update(acc, seg));
            Ok(())
        }
        Payload::CopyCrc32c { dst, src, seed, crc } => {
            let mut offset = 0;
            let mut acc = !*seed;
            for seg in &*src {
                let end = offset + seg.len();
                let out = dst.get_mut(offset..end).ok_or_else(|| {
                    AccelError::InvalidArgument("copy_crc32c destination too small".to_string())
                })?;
                out.copy_from_slice(seg);
                acc = crc32c_update(acc, seg);
                offset = end;
            }
            *crc = acc;
            Ok(())
        }
        Payload::Compress { .. }
        | Payload::Decompress { .. }
        | Payload::Encrypt(_)
        | Payload::Decrypt(_) => Err(AccelError::NotSupported(format!(
            "software module has no engine for {}",
            payload.opcode()
        ))),
    }
}

fn copy_into(dst: &mut BytesMut, src: &[u8]) -> Result<(), AccelError> {
    let out = dst.get_mut(..src.len()).ok_or_else(|| {
        AccelError::InvalidArgument("copy destination too small".to_string())
    })?;
    out.copy_from_slice(src);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
