//! Backend abstraction: buffer types, buffers and compute backends.
//!
//! A [`BufferType`] is pure allocation policy. A [`BackendBuffer`] is one
//! allocation, shared through [`BufferHandle`] so tensor bindings can refer to
//! it. A [`Backend`] moves bytes in and out of its buffers and executes graphs.

mod buffer;
pub mod host;
pub mod registry;
pub mod unavailable;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::{Context, ContextError};
use crate::graph::Graph;
use crate::tensor::{TensorHeader, TensorId};

pub use buffer::BufferHandle;
pub use host::HostBuffer;
pub use unavailable::UnavailableBackend;

/// Name reported by the host backend and by buffers it can address directly.
pub const CPU_BACKEND_NAME: &str = "CPU";

static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    pub fn next() -> Self {
        BufferId(BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// What a buffer holds; informs backends that place weights differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferUsage {
    #[default]
    Any,
    Weights,
    Compute,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
    #[error("cannot copy from a {src} buffer into a {dst} buffer")]
    BufferTypeMismatch { src: String, dst: String },
    #[error("access of {len} bytes at offset {offset} exceeds size {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("{0} has been freed")]
    Freed(BufferId),
    #[error("requested {requested} bytes but {backend} allows at most {max}")]
    TooLarge {
        backend: String,
        requested: usize,
        max: usize,
    },
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    pub(crate) fn check_range(offset: usize, len: usize, size: usize) -> BackendResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(BackendError::OutOfBounds { offset, len, size }),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// One backend allocation. Methods take `&self`; implementations guard their
/// storage internally so handles can be shared by many tensor bindings.
pub trait BackendBuffer: Send + Sync {
    fn id(&self) -> BufferId;

    /// Name of the backend that can address this buffer.
    fn owner(&self) -> &str;

    fn size(&self) -> usize;

    fn alignment(&self) -> usize;

    /// Address of the first byte; 0 once freed.
    fn base(&self) -> usize;

    fn is_host(&self) -> bool;

    fn usage(&self) -> BufferUsage;

    fn set_usage(&self, usage: BufferUsage);

    fn read(&self, offset: usize, out: &mut [u8]) -> BackendResult<()>;

    fn write(&self, offset: usize, data: &[u8]) -> BackendResult<()>;

    fn fill(&self, offset: usize, len: usize, value: u8) -> BackendResult<()>;

    /// Sets every byte of the buffer to `value`.
    fn clear(&self, value: u8) -> BackendResult<()> {
        self.fill(0, self.size(), value)
    }

    fn reset(&self) -> BackendResult<()> {
        self.clear(0)
    }

    /// Releases the storage. Further access fails with [`BackendError::Freed`].
    fn free(&self);

    fn is_freed(&self) -> bool;
}

/// Allocation policy of a family of buffers.
pub trait BufferType: Send + Sync {
    fn name(&self) -> &str;

    fn alloc_buffer(&self, size: usize) -> BackendResult<BufferHandle>;

    fn alignment(&self) -> usize;

    fn max_size(&self) -> usize {
        usize::MAX
    }

    /// Bytes a planner must reserve for `tensor` in a buffer of this type.
    fn alloc_size(&self, tensor: &TensorHeader) -> usize {
        tensor.nbytes()
    }

    fn supports_backend(&self, backend: &dyn Backend) -> bool;

    fn is_host(&self) -> bool;
}

/// A compute backend.
///
/// `graph_compute` runs every node of the graph in stored order. Transfers
/// marked async may return before completion; callers must `synchronize`
/// before reading results.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn default_buffer_type(&self) -> Arc<dyn BufferType>;

    fn alloc_buffer(&self, size: usize) -> BackendResult<BufferHandle> {
        self.default_buffer_type().alloc_buffer(size)
    }

    fn alignment(&self) -> usize {
        self.default_buffer_type().alignment()
    }

    fn max_size(&self) -> usize {
        self.default_buffer_type().max_size()
    }

    fn set_tensor_async(
        &self,
        ctx: &Context,
        tensor: TensorId,
        offset: usize,
        data: &[u8],
    ) -> BackendResult<()>;

    fn get_tensor_async(
        &self,
        ctx: &Context,
        tensor: TensorId,
        offset: usize,
        out: &mut [u8],
    ) -> BackendResult<()>;

    fn cpy_tensor_async(&self, ctx: &Context, src: TensorId, dst: TensorId) -> BackendResult<()>;

    fn synchronize(&self) -> BackendResult<()>;

    fn graph_compute(&self, ctx: &mut Context, graph: &Graph) -> BackendResult<()>;

    fn supports_op(&self, tensor: &TensorHeader) -> bool;
}
