use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::{BackendBuffer, BackendError, BackendResult};
use crate::context::{Context, ContextError};
use crate::tensor::{TensorData, TensorId};

/// Shared handle to a backend buffer. Tensor bindings hold clones of it.
#[derive(Clone)]
pub struct BufferHandle(Arc<dyn BackendBuffer>);

impl BufferHandle {
    pub fn new<B: BackendBuffer + 'static>(buffer: B) -> Self {
        BufferHandle(Arc::new(buffer))
    }

    pub fn from_arc(buffer: Arc<dyn BackendBuffer>) -> Self {
        BufferHandle(buffer)
    }

    pub fn same_buffer(&self, other: &BufferHandle) -> bool {
        self.0.id() == other.0.id()
    }

    /// Binds `tensor` into this buffer at the tensor's view offset.
    pub fn init_tensor(&self, ctx: &mut Context, tensor: TensorId) -> BackendResult<()> {
        let header = ctx.tensor(tensor)?;
        let offset = header.view_offs();
        BackendError::check_range(offset, header.nbytes(), self.size())?;
        ctx.bind(
            tensor,
            Some(TensorData {
                buffer: self.clone(),
                offset,
            }),
        )?;
        Ok(())
    }

    /// Writes `data` at `offset` bytes into the tensor's data.
    pub fn set_tensor(
        &self,
        ctx: &Context,
        tensor: TensorId,
        offset: usize,
        data: &[u8],
    ) -> BackendResult<()> {
        let binding = self.binding_of(ctx, tensor, offset, data.len())?;
        self.write(binding.offset + offset, data)
    }

    /// Reads `out.len()` bytes starting `offset` bytes into the tensor's data.
    pub fn get_tensor(
        &self,
        ctx: &Context,
        tensor: TensorId,
        offset: usize,
        out: &mut [u8],
    ) -> BackendResult<()> {
        let binding = self.binding_of(ctx, tensor, offset, out.len())?;
        self.read(binding.offset + offset, out)
    }

    /// Copies the bytes of `src` into `dst`. Both must live in host memory or
    /// in buffers of the same backend.
    pub fn cpy_tensor(&self, ctx: &Context, src: TensorId, dst: TensorId) -> BackendResult<()> {
        let src_data = bound(ctx, src)?;
        let dst_data = bound(ctx, dst)?;
        let compatible = (src_data.buffer.is_host() && dst_data.buffer.is_host())
            || src_data.buffer.owner() == dst_data.buffer.owner();
        if !compatible {
            return Err(BackendError::BufferTypeMismatch {
                src: src_data.buffer.owner().to_string(),
                dst: dst_data.buffer.owner().to_string(),
            });
        }
        let len = ctx.tensor(src)?.nbytes();
        BackendError::check_range(0, len, ctx.tensor(dst)?.nbytes())?;
        let mut staging = vec![0u8; len];
        src_data.buffer.read(src_data.offset, &mut staging)?;
        dst_data.buffer.write(dst_data.offset, &staging)
    }

    fn binding_of(
        &self,
        ctx: &Context,
        tensor: TensorId,
        offset: usize,
        len: usize,
    ) -> BackendResult<TensorData> {
        let binding = bound(ctx, tensor)?;
        if !binding.buffer.same_buffer(self) {
            return Err(BackendError::execution(format!(
                "tensor {tensor} is bound to {}, not {}",
                binding.buffer.id(),
                self.id()
            )));
        }
        BackendError::check_range(offset, len, ctx.tensor(tensor)?.nbytes())?;
        Ok(binding)
    }
}

fn bound(ctx: &Context, tensor: TensorId) -> BackendResult<TensorData> {
    ctx.data(tensor)?.ok_or_else(|| {
        BackendError::from(ContextError::Unbound {
            tensor: tensor.to_string(),
        })
    })
}

impl Deref for BufferHandle {
    type Target = dyn BackendBuffer;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.0.id())
            .field("owner", &self.0.owner())
            .field("size", &self.0.size())
            .finish()
    }
}
