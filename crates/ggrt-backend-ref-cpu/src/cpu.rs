use std::sync::Arc;
use std::time::Instant;

use ggrt::backend::{BackendBuffer, CPU_BACKEND_NAME};
use ggrt::layout::{self, TENSOR_ALIGNMENT};
use ggrt::{
    Backend, BackendError, BackendResult, BufferHandle, BufferType, Context, Graph, HostBuffer,
    TensorData, TensorHeader, TensorId,
};

use crate::kernels;

/// Host buffers aligned to 32 bytes, with every tensor padded to 32 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBufferType;

impl BufferType for CpuBufferType {
    fn name(&self) -> &str {
        CPU_BACKEND_NAME
    }

    fn alloc_buffer(&self, size: usize) -> BackendResult<BufferHandle> {
        let buffer = HostBuffer::new(size);
        tracing::debug!(buffer = %buffer.id(), size, "allocated cpu buffer");
        Ok(BufferHandle::new(buffer))
    }

    fn alignment(&self) -> usize {
        TENSOR_ALIGNMENT
    }

    fn alloc_size(&self, tensor: &TensorHeader) -> usize {
        layout::checked_align_up(tensor.nbytes(), TENSOR_ALIGNMENT).unwrap_or(usize::MAX)
    }

    fn supports_backend(&self, backend: &dyn Backend) -> bool {
        backend.name() == CPU_BACKEND_NAME
    }

    fn is_host(&self) -> bool {
        true
    }
}

/// Reference backend: runs every op with straightforward f32 kernels on the
/// calling thread. All transfers complete before returning.
#[derive(Debug, Clone, Default)]
pub struct CpuBackend {
    buffer_type: Arc<CpuBufferType>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn host_binding(&self, ctx: &Context, tensor: TensorId) -> BackendResult<TensorData> {
        let binding = ctx
            .data(tensor)?
            .ok_or_else(|| BackendError::execution(format!("tensor {tensor} has no data")))?;
        if !binding.buffer.is_host() {
            return Err(BackendError::BufferTypeMismatch {
                src: binding.buffer.owner().to_string(),
                dst: CPU_BACKEND_NAME.to_string(),
            });
        }
        Ok(binding)
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        CPU_BACKEND_NAME
    }

    fn default_buffer_type(&self) -> Arc<dyn BufferType> {
        self.buffer_type.clone()
    }

    fn set_tensor_async(
        &self,
        ctx: &Context,
        tensor: TensorId,
        offset: usize,
        data: &[u8],
    ) -> BackendResult<()> {
        let binding = self.host_binding(ctx, tensor)?;
        binding.buffer.set_tensor(ctx, tensor, offset, data)
    }

    fn get_tensor_async(
        &self,
        ctx: &Context,
        tensor: TensorId,
        offset: usize,
        out: &mut [u8],
    ) -> BackendResult<()> {
        let binding = self.host_binding(ctx, tensor)?;
        binding.buffer.get_tensor(ctx, tensor, offset, out)
    }

    fn cpy_tensor_async(&self, ctx: &Context, src: TensorId, dst: TensorId) -> BackendResult<()> {
        let binding = self.host_binding(ctx, dst)?;
        binding.buffer.cpy_tensor(ctx, src, dst)
    }

    fn synchronize(&self) -> BackendResult<()> {
        Ok(())
    }

    fn graph_compute(&self, ctx: &mut Context, graph: &Graph) -> BackendResult<()> {
        for &node in graph.nodes() {
            let op = ctx.tensor(node)?.op();
            let start = Instant::now();
            kernels::compute_forward(ctx, node)?;
            let elapsed = start.elapsed();
            ctx.record_perf(node, elapsed)?;
            tracing::trace!(
                tensor = %node,
                op = op.name(),
                elapsed_us = elapsed.as_micros() as u64,
                "computed node"
            );
        }
        Ok(())
    }

    fn supports_op(&self, _tensor: &TensorHeader) -> bool {
        true
    }
}
