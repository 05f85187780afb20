use std::sync::Arc;

use ggrt::backend::{BufferId, CPU_BACKEND_NAME};
use ggrt::{
    Backend, BackendBuffer, BackendError, BackendResult, BufferHandle, BufferUsage, Context,
    ContextParams, DType, HostBuffer, UnavailableBackend,
};

/// Host memory that reports itself as device memory of another backend.
struct DeviceBuffer(HostBuffer);

impl BackendBuffer for DeviceBuffer {
    fn id(&self) -> BufferId {
        self.0.id()
    }

    fn owner(&self) -> &str {
        self.0.owner()
    }

    fn size(&self) -> usize {
        self.0.size()
    }

    fn alignment(&self) -> usize {
        self.0.alignment()
    }

    fn base(&self) -> usize {
        self.0.base()
    }

    fn is_host(&self) -> bool {
        false
    }

    fn usage(&self) -> BufferUsage {
        self.0.usage()
    }

    fn set_usage(&self, usage: BufferUsage) {
        self.0.set_usage(usage)
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> BackendResult<()> {
        self.0.read(offset, out)
    }

    fn write(&self, offset: usize, data: &[u8]) -> BackendResult<()> {
        self.0.write(offset, data)
    }

    fn fill(&self, offset: usize, len: usize, value: u8) -> BackendResult<()> {
        self.0.fill(offset, len, value)
    }

    fn free(&self) {
        self.0.free()
    }

    fn is_freed(&self) -> bool {
        self.0.is_freed()
    }
}

fn device(size: usize) -> BufferHandle {
    BufferHandle::from_arc(Arc::new(DeviceBuffer(HostBuffer::with_owner(size, "GPU"))))
}

#[test]
fn copies_need_host_memory_or_a_shared_owner() -> anyhow::Result<()> {
    let mut ctx = Context::new(ContextParams::headers_only(1 << 16));
    let host = ctx.new_tensor_1d(DType::F32, 4)?;
    let dev = ctx.new_tensor_1d(DType::F32, 4)?;
    let dev2 = ctx.new_tensor_1d(DType::F32, 4)?;

    let host_buffer = BufferHandle::new(HostBuffer::new(64));
    let (first, second) = (device(64), device(64));
    host_buffer.init_tensor(&mut ctx, host)?;
    first.init_tensor(&mut ctx, dev)?;
    second.init_tensor(&mut ctx, dev2)?;
    assert_eq!(first.owner(), "GPU");
    assert_eq!(host_buffer.owner(), CPU_BACKEND_NAME);

    match host_buffer.cpy_tensor(&ctx, dev, host) {
        Err(BackendError::BufferTypeMismatch { src, dst }) => {
            assert_eq!((src.as_str(), dst.as_str()), ("GPU", "CPU"));
        }
        other => panic!("expected a buffer type mismatch, got {other:?}"),
    }

    first.set_tensor(&ctx, dev, 0, &[7u8; 16])?;
    second.cpy_tensor(&ctx, dev, dev2)?;
    let mut out = [0u8; 16];
    second.get_tensor(&ctx, dev2, 0, &mut out)?;
    assert_eq!(out, [7u8; 16]);
    Ok(())
}

#[test]
fn transfers_must_target_the_bound_buffer() -> anyhow::Result<()> {
    let mut ctx = Context::new(ContextParams::headers_only(1 << 16));
    let t = ctx.new_tensor_1d(DType::F32, 2)?;
    let bound = BufferHandle::new(HostBuffer::new(32));
    let other = BufferHandle::new(HostBuffer::new(32));

    assert!(bound.set_tensor(&ctx, t, 0, &[0u8; 8]).is_err(), "unbound tensor accepted");
    bound.init_tensor(&mut ctx, t)?;
    assert!(other.set_tensor(&ctx, t, 0, &[0u8; 8]).is_err());
    bound.set_tensor(&ctx, t, 4, &1.5f32.to_ne_bytes())?;
    assert_eq!(ctx.read_f32(t)?, vec![0.0, 1.5]);

    let tiny = BufferHandle::new(HostBuffer::new(4));
    assert!(matches!(
        tiny.init_tensor(&mut ctx, t),
        Err(BackendError::OutOfBounds { .. })
    ));
    Ok(())
}

#[test]
fn views_bind_at_their_offset() -> anyhow::Result<()> {
    let mut ctx = Context::new(ContextParams::headers_only(1 << 16));
    let base = ctx.new_tensor_2d(DType::F32, 4, 2)?;
    let row = ctx.view_1d(base, 4, 16)?;
    assert_eq!(ctx.tensor(row)?.n_dims(), 1);
    assert_eq!(ctx.tensor(base)?.nrows(), 2);
    assert!(!ctx.tensor(row)?.same_shape(ctx.tensor(base)?));

    let buffer = BufferHandle::new(HostBuffer::new(64));
    buffer.init_tensor(&mut ctx, row)?;
    assert_eq!(ctx.data(row)?.map(|d| d.offset), Some(16));
    Ok(())
}

#[test]
fn usage_tags_and_freeing() {
    let buffer = BufferHandle::new(HostBuffer::new(64));
    assert_eq!(buffer.usage(), BufferUsage::Any);
    buffer.set_usage(BufferUsage::Weights);
    assert_eq!(buffer.usage(), BufferUsage::Weights);
    let alias = buffer.clone();
    assert!(alias.same_buffer(&buffer));
    buffer.free();
    assert!(alias.is_freed());
    assert!(matches!(alias.write(0, &[1]), Err(BackendError::Freed(_))));
}

#[test]
fn unavailable_backends_refuse_everything() -> anyhow::Result<()> {
    let gpu = UnavailableBackend::new("GPU");
    assert_eq!(gpu.name(), "GPU");
    assert!(matches!(
        gpu.alloc_buffer(64),
        Err(BackendError::Unimplemented { .. })
    ));
    assert!(gpu.default_buffer_type().supports_backend(&gpu));
    assert!(!gpu.default_buffer_type().is_host());

    let mut ctx = Context::new(ContextParams::new(1 << 12));
    let a = ctx.new_tensor_1d(DType::F32, 1)?;
    assert!(!gpu.supports_op(ctx.tensor(a)?));
    assert!(gpu.set_tensor_async(&ctx, a, 0, &[0u8; 4]).is_err());
    gpu.synchronize()?;
    Ok(())
}
