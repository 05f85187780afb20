//! Heap-backed buffers addressable from the host.

use std::sync::Mutex;

use bytemuck::{Pod, Zeroable};

use super::{BackendError, BackendResult, BufferId, BufferUsage, BackendBuffer, CPU_BACKEND_NAME};
use crate::layout::TENSOR_ALIGNMENT;

// The storage unit of host buffers; its alignment aligns the whole block.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, align(32))]
struct HostBlock([u8; TENSOR_ALIGNMENT]);

/// A zero-initialized, 32-byte aligned heap block.
pub struct HostBuffer {
    id: BufferId,
    owner: String,
    size: usize,
    storage: Mutex<Option<Vec<HostBlock>>>,
    usage: Mutex<BufferUsage>,
}

impl HostBuffer {
    pub fn new(size: usize) -> Self {
        Self::with_owner(size, CPU_BACKEND_NAME)
    }

    pub fn with_owner(size: usize, owner: impl Into<String>) -> Self {
        let blocks = vec![HostBlock::zeroed(); size.div_ceil(TENSOR_ALIGNMENT)];
        Self {
            id: BufferId::next(),
            owner: owner.into(),
            size,
            storage: Mutex::new(Some(blocks)),
            usage: Mutex::new(BufferUsage::Any),
        }
    }

    fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> BackendResult<R> {
        let mut storage = self.storage.lock().expect("host buffer poisoned");
        let blocks = storage.as_mut().ok_or(BackendError::Freed(self.id))?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(blocks.as_mut_slice());
        Ok(f(&mut bytes[..self.size]))
    }
}

impl BackendBuffer for HostBuffer {
    fn id(&self) -> BufferId {
        self.id
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn size(&self) -> usize {
        self.size
    }

    fn alignment(&self) -> usize {
        TENSOR_ALIGNMENT
    }

    fn base(&self) -> usize {
        let storage = self.storage.lock().expect("host buffer poisoned");
        storage
            .as_ref()
            .map_or(0, |blocks| blocks.as_ptr() as usize)
    }

    fn is_host(&self) -> bool {
        true
    }

    fn usage(&self) -> BufferUsage {
        *self.usage.lock().expect("host buffer poisoned")
    }

    fn set_usage(&self, usage: BufferUsage) {
        *self.usage.lock().expect("host buffer poisoned") = usage;
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> BackendResult<()> {
        BackendError::check_range(offset, out.len(), self.size)?;
        self.with_bytes(|bytes| out.copy_from_slice(&bytes[offset..offset + out.len()]))
    }

    fn write(&self, offset: usize, data: &[u8]) -> BackendResult<()> {
        BackendError::check_range(offset, data.len(), self.size)?;
        self.with_bytes(|bytes| bytes[offset..offset + data.len()].copy_from_slice(data))
    }

    fn fill(&self, offset: usize, len: usize, value: u8) -> BackendResult<()> {
        BackendError::check_range(offset, len, self.size)?;
        self.with_bytes(|bytes| bytes[offset..offset + len].fill(value))
    }

    fn free(&self) {
        let released = self
            .storage
            .lock()
            .expect("host buffer poisoned")
            .take()
            .is_some();
        if released {
            tracing::debug!(buffer = %self.id, size = self.size, "freed host buffer");
        }
    }

    fn is_freed(&self) -> bool {
        self.storage
            .lock()
            .expect("host buffer poisoned")
            .is_none()
    }
}
