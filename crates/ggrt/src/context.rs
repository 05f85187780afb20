//! Fixed-capacity arena holding tensor headers and, unless `no_alloc`, their data.
//!
//! Every tensor takes a `TENSOR_OVERHEAD` header slot followed by its data
//! padded to `CONTEXT_ALIGNMENT`, bump-allocated in creation order. The arena
//! never grows and never frees individual tensors; `reset` rewinds it as a unit.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use crate::backend::{BackendBuffer, BackendError, BufferHandle, HostBuffer};
use crate::layout::{self, MAX_DIMS, TENSOR_ALIGNMENT};
use crate::tensor::header::truncate_name;
use crate::tensor::{DType, Op, PerfCounters, TensorData, TensorHeader, TensorId};

pub const CONTEXT_ALIGNMENT: usize = TENSOR_ALIGNMENT;

/// Arena bytes reserved for each tensor header.
pub const TENSOR_OVERHEAD: usize = 384;

static CONTEXT_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    pub mem_size: usize,
    /// Create headers only; data is bound later by a planner or buffer.
    pub no_alloc: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            mem_size: 16 * 1024 * 1024,
            no_alloc: false,
        }
    }
}

impl ContextParams {
    pub fn new(mem_size: usize) -> Self {
        Self {
            mem_size,
            no_alloc: false,
        }
    }

    pub fn headers_only(mem_size: usize) -> Self {
        Self {
            mem_size,
            no_alloc: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context out of memory: need {needed} bytes, {available} of {capacity} available")]
    OutOfMemory {
        needed: usize,
        available: usize,
        capacity: usize,
    },
    #[error("invalid shape {dims:?}: {reason}")]
    InvalidShape { dims: Vec<usize>, reason: String },
    #[error("tensor {tensor} belongs to another context")]
    ForeignTensor { tensor: TensorId },
    #[error("tensor {tensor} was created before the context was reset")]
    StaleTensor { tensor: TensorId },
    #[error("tensor {tensor} does not exist")]
    UnknownTensor { tensor: TensorId },
    #[error("{op}: incompatible shapes {lhs:?} and {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: [usize; MAX_DIMS],
        rhs: [usize; MAX_DIMS],
    },
    #[error("{op}: tensor {tensor} is not contiguous")]
    NotContiguous { op: &'static str, tensor: String },
    #[error("{op} does not support {dtype}")]
    UnsupportedType { op: &'static str, dtype: DType },
    #[error("tensor {tensor} has no data binding")]
    Unbound { tensor: String },
    #[error("expected {expected} elements, got {actual}")]
    ElementCount { expected: usize, actual: usize },
    #[error("buffer access failed: {0}")]
    Buffer(#[source] Box<BackendError>),
}

impl From<BackendError> for ContextError {
    fn from(err: BackendError) -> Self {
        ContextError::Buffer(Box::new(err))
    }
}

pub struct Context {
    id: u32,
    generation: u32,
    memory: BufferHandle,
    owns_memory: bool,
    used: usize,
    no_alloc: bool,
    tensors: Vec<TensorHeader>,
}

impl Context {
    /// Creates a context owning a zeroed host block of `params.mem_size` bytes.
    pub fn new(params: ContextParams) -> Self {
        let memory = BufferHandle::new(HostBuffer::new(params.mem_size));
        Self::build(memory, true, params.no_alloc)
    }

    /// Creates a context over caller-supplied memory, which it does not own.
    pub fn with_buffer(memory: BufferHandle, no_alloc: bool) -> Self {
        Self::build(memory, false, no_alloc)
    }

    fn build(memory: BufferHandle, owns_memory: bool, no_alloc: bool) -> Self {
        let id = CONTEXT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            context = id,
            capacity = memory.size(),
            owns_memory,
            no_alloc,
            "created context"
        );
        Self {
            id,
            generation: 0,
            memory,
            owns_memory,
            used: 0,
            no_alloc,
            tensors: Vec::new(),
        }
    }

    /// Releases owned memory. Caller-supplied memory is handed back intact.
    pub fn free(self) -> Option<BufferHandle> {
        if self.owns_memory {
            self.memory.free();
            None
        } else {
            Some(self.memory)
        }
    }

    /// Rewinds the arena. Handles issued before the reset become stale.
    pub fn reset(&mut self) {
        self.tensors.clear();
        self.used = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.memory.size()
    }

    pub fn used_mem(&self) -> usize {
        self.used
    }

    pub fn no_alloc(&self) -> bool {
        self.no_alloc
    }

    pub fn set_no_alloc(&mut self, no_alloc: bool) {
        self.no_alloc = no_alloc;
    }

    pub fn owns_memory(&self) -> bool {
        self.owns_memory
    }

    pub fn memory(&self) -> &BufferHandle {
        &self.memory
    }

    pub fn n_tensors(&self) -> usize {
        self.tensors.len()
    }

    pub fn tensors(&self) -> impl Iterator<Item = &TensorHeader> {
        self.tensors.iter()
    }

    pub fn tensor(&self, id: TensorId) -> Result<&TensorHeader, ContextError> {
        let index = self.check(id)?;
        Ok(&self.tensors[index])
    }

    pub(crate) fn tensor_mut(&mut self, id: TensorId) -> Result<&mut TensorHeader, ContextError> {
        let index = self.check(id)?;
        Ok(&mut self.tensors[index])
    }

    fn check(&self, id: TensorId) -> Result<usize, ContextError> {
        if id.context != self.id {
            return Err(ContextError::ForeignTensor { tensor: id });
        }
        if id.generation != self.generation {
            return Err(ContextError::StaleTensor { tensor: id });
        }
        let index = id.index as usize;
        if index >= self.tensors.len() {
            return Err(ContextError::UnknownTensor { tensor: id });
        }
        Ok(index)
    }

    pub fn new_tensor(&mut self, dtype: DType, dims: &[usize]) -> Result<TensorId, ContextError> {
        let ne = layout::expand_dims(dims).ok_or_else(|| ContextError::InvalidShape {
            dims: dims.to_vec(),
            reason: format!("expected 1 to {MAX_DIMS} dimensions"),
        })?;
        self.new_tensor_impl(dtype, ne, Op::None, &[])
    }

    pub fn new_tensor_1d(&mut self, dtype: DType, ne0: usize) -> Result<TensorId, ContextError> {
        self.new_tensor(dtype, &[ne0])
    }

    pub fn new_tensor_2d(
        &mut self,
        dtype: DType,
        ne0: usize,
        ne1: usize,
    ) -> Result<TensorId, ContextError> {
        self.new_tensor(dtype, &[ne0, ne1])
    }

    pub fn new_tensor_3d(
        &mut self,
        dtype: DType,
        ne0: usize,
        ne1: usize,
        ne2: usize,
    ) -> Result<TensorId, ContextError> {
        self.new_tensor(dtype, &[ne0, ne1, ne2])
    }

    pub fn new_tensor_4d(
        &mut self,
        dtype: DType,
        ne0: usize,
        ne1: usize,
        ne2: usize,
        ne3: usize,
    ) -> Result<TensorId, ContextError> {
        self.new_tensor(dtype, &[ne0, ne1, ne2, ne3])
    }

    /// Creates a tensor with contiguous strides and its own data.
    pub(crate) fn new_tensor_impl(
        &mut self,
        dtype: DType,
        ne: [usize; MAX_DIMS],
        op: Op,
        src: &[TensorId],
    ) -> Result<TensorId, ContextError> {
        if ne.iter().any(|&n| n == 0) {
            return Err(ContextError::InvalidShape {
                dims: ne.to_vec(),
                reason: "every dimension must be at least 1".into(),
            });
        }
        if ne[0] % dtype.block_size() != 0 {
            return Err(ContextError::InvalidShape {
                dims: ne.to_vec(),
                reason: format!(
                    "{dtype} rows must be a multiple of {} elements",
                    dtype.block_size()
                ),
            });
        }
        let nb = layout::contiguous_strides(dtype, &ne).ok_or_else(|| size_overflow(&ne))?;
        self.push_header(dtype, ne, nb, None, op, src)
    }

    /// Creates a header aliasing the memory of `base` at `offset` bytes past
    /// the start of `base`'s data.
    pub(crate) fn new_view_impl(
        &mut self,
        base: TensorId,
        ne: [usize; MAX_DIMS],
        nb: [usize; MAX_DIMS],
        offset: usize,
        op: Op,
        src: &[TensorId],
    ) -> Result<TensorId, ContextError> {
        let header = self.tensor(base)?;
        let dtype = header.dtype;
        // Views of views collapse onto the root owner of the memory.
        let (root, root_offs) = match header.view_src {
            Some(root) => (root, header.view_offs + offset),
            None => (base, offset),
        };
        self.push_header(dtype, ne, nb, Some((root, root_offs)), op, src)
    }

    fn push_header(
        &mut self,
        dtype: DType,
        ne: [usize; MAX_DIMS],
        nb: [usize; MAX_DIMS],
        view: Option<(TensorId, usize)>,
        op: Op,
        src: &[TensorId],
    ) -> Result<TensorId, ContextError> {
        for &id in src {
            self.check(id)?;
        }
        layout::nelements(&ne).ok_or_else(|| size_overflow(&ne))?;
        let nbytes = layout::span_bytes(dtype, &ne, &nb).ok_or_else(|| size_overflow(&ne))?;
        let data_size = if view.is_some() || self.no_alloc {
            0
        } else {
            layout::checked_align_up(nbytes, CONTEXT_ALIGNMENT)
                .ok_or_else(|| size_overflow(&ne))?
        };
        let needed = TENSOR_OVERHEAD
            .checked_add(data_size)
            .ok_or_else(|| size_overflow(&ne))?;
        let capacity = self.capacity();
        if self.used.checked_add(needed).map_or(true, |end| end > capacity) {
            tracing::warn!(
                context = self.id,
                needed,
                used = self.used,
                capacity,
                "context memory exhausted"
            );
            return Err(ContextError::OutOfMemory {
                needed,
                available: capacity - self.used,
                capacity,
            });
        }

        let header_offset = self.used;
        let data_offset = header_offset + TENSOR_OVERHEAD;
        let data = if data_size > 0 {
            // Memory may be reused after a reset or be caller-supplied.
            self.memory.fill(data_offset, data_size, 0)?;
            Some(TensorData {
                buffer: self.memory.clone(),
                offset: data_offset,
            })
        } else {
            None
        };
        self.used += needed;

        let id = TensorId {
            context: self.id,
            generation: self.generation,
            index: u32::try_from(self.tensors.len()).map_err(|_| ContextError::InvalidShape {
                dims: ne.to_vec(),
                reason: "too many tensors in one context".into(),
            })?,
        };
        let (view_src, view_offs) = match view {
            Some((root, offs)) => (Some(root), offs),
            None => (None, 0),
        };
        self.tensors.push(TensorHeader {
            id,
            dtype,
            ne,
            nb,
            nbytes,
            op,
            src: SmallVec::from_slice(src),
            view_src,
            view_offs,
            is_param: false,
            data_offset: data.as_ref().map(|d| d.offset),
            data,
            name: String::new(),
            perf: PerfCounters::default(),
            header_offset,
        });
        Ok(id)
    }

    pub fn set_name(&mut self, id: TensorId, name: &str) -> Result<(), ContextError> {
        self.tensor_mut(id)?.name = truncate_name(name);
        Ok(())
    }

    pub fn name(&self, id: TensorId) -> Result<&str, ContextError> {
        Ok(self.tensor(id)?.name())
    }

    /// First tensor carrying `name`.
    pub fn find_tensor(&self, name: &str) -> Option<TensorId> {
        self.tensors.iter().find(|t| t.name == name).map(|t| t.id)
    }

    /// Marks a tensor as a trainable parameter; graphs treat it as a node.
    pub fn set_param(&mut self, id: TensorId) -> Result<(), ContextError> {
        self.tensor_mut(id)?.is_param = true;
        Ok(())
    }

    /// Resolved data binding: the tensor's own, or its root source's shifted
    /// by the view offset.
    pub fn data(&self, id: TensorId) -> Result<Option<TensorData>, ContextError> {
        let header = self.tensor(id)?;
        if let Some(data) = &header.data {
            return Ok(Some(data.clone()));
        }
        let Some(root) = header.view_src else {
            return Ok(None);
        };
        let base = self.tensor(root)?;
        Ok(base.data.as_ref().map(|data| TensorData {
            buffer: data.buffer.clone(),
            offset: data.offset + header.view_offs,
        }))
    }

    /// Host address of the resolved data, when bound.
    pub fn data_addr(&self, id: TensorId) -> Result<Option<usize>, ContextError> {
        Ok(self.data(id)?.map(|data| data.addr()))
    }

    pub(crate) fn bind(&mut self, id: TensorId, data: Option<TensorData>) -> Result<(), ContextError> {
        self.tensor_mut(id)?.data = data;
        Ok(())
    }

    pub fn record_perf(&mut self, id: TensorId, elapsed: Duration) -> Result<(), ContextError> {
        self.tensor_mut(id)?.perf.record(elapsed);
        Ok(())
    }

    pub fn reset_perf(&mut self) {
        for tensor in &mut self.tensors {
            tensor.perf = PerfCounters::default();
        }
    }
}

fn size_overflow(ne: &[usize; MAX_DIMS]) -> ContextError {
    ContextError::InvalidShape {
        dims: ne.to_vec(),
        reason: "byte size does not fit in usize".into(),
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .field("no_alloc", &self.no_alloc)
            .field("tensors", &self.tensors.len())
            .finish()
    }
}
