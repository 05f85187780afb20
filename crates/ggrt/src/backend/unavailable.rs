//! Placeholder for accelerators that are not compiled in.
//!
//! It accepts no op and allocates nothing, so a scheduler that lists it
//! routes every node elsewhere.

use std::sync::Arc;

use super::{Backend, BackendError, BackendResult, BufferHandle, BufferType};
use crate::context::Context;
use crate::graph::Graph;
use crate::tensor::{TensorHeader, TensorId};

#[derive(Debug, Clone)]
pub struct UnavailableBufferType {
    name: String,
}

impl BufferType for UnavailableBufferType {
    fn name(&self) -> &str {
        &self.name
    }

    fn alloc_buffer(&self, _size: usize) -> BackendResult<BufferHandle> {
        Err(BackendError::unimplemented(
            "alloc_buffer",
            format!("{} buffers are not available in this build", self.name),
        ))
    }

    fn alignment(&self) -> usize {
        crate::layout::TENSOR_ALIGNMENT
    }

    fn supports_backend(&self, backend: &dyn Backend) -> bool {
        backend.name() == self.name
    }

    fn is_host(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct UnavailableBackend {
    buffer_type: Arc<UnavailableBufferType>,
}

impl UnavailableBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            buffer_type: Arc::new(UnavailableBufferType { name: name.into() }),
        }
    }

    fn unavailable(&self, op: &'static str) -> BackendError {
        BackendError::unimplemented(op, format!("{} is not available", self.buffer_type.name))
    }
}

impl Backend for UnavailableBackend {
    fn name(&self) -> &str {
        &self.buffer_type.name
    }

    fn default_buffer_type(&self) -> Arc<dyn BufferType> {
        self.buffer_type.clone()
    }

    fn set_tensor_async(
        &self,
        _ctx: &Context,
        _tensor: TensorId,
        _offset: usize,
        _data: &[u8],
    ) -> BackendResult<()> {
        Err(self.unavailable("set_tensor_async"))
    }

    fn get_tensor_async(
        &self,
        _ctx: &Context,
        _tensor: TensorId,
        _offset: usize,
        _out: &mut [u8],
    ) -> BackendResult<()> {
        Err(self.unavailable("get_tensor_async"))
    }

    fn cpy_tensor_async(&self, _ctx: &Context, _src: TensorId, _dst: TensorId) -> BackendResult<()> {
        Err(self.unavailable("cpy_tensor_async"))
    }

    fn synchronize(&self) -> BackendResult<()> {
        Ok(())
    }

    fn graph_compute(&self, _ctx: &mut Context, _graph: &Graph) -> BackendResult<()> {
        Err(self.unavailable("graph_compute"))
    }

    fn supports_op(&self, _tensor: &TensorHeader) -> bool {
        false
    }
}
