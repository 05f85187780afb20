use std::sync::Arc;

use anyhow::{bail, ensure};
use ggrt::layout::align_up;
use ggrt::{
    ArenaPlanner, Backend, BackendBuffer, BackendError, Context, ContextParams, DType, Graph,
    MeasuringPlanner, Planner,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::smoke::{download, upload};

/// A measured size is always enough for the real pass over the same graph,
/// and every binding is aligned and disjoint from the others.
pub fn measured_size_fits_real_pass(backend: &Arc<dyn Backend>) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..8 {
        let mut ctx = Context::new(ContextParams::headers_only(1 << 20));
        let mut tensor = ctx.new_tensor_2d(DType::F32, rng.gen_range(1..64), rng.gen_range(1..8))?;
        for _ in 0..rng.gen_range(1..12) {
            let width = ctx.tensor(tensor)?.ne()[0];
            let row = ctx.new_tensor_1d(DType::F32, width)?;
            tensor = match rng.gen_range(0..5) {
                0 => ctx.add(tensor, row)?,
                1 => ctx.mul(tensor, row)?,
                2 => ctx.soft_max(tensor)?,
                3 => ctx.mean(tensor)?,
                _ => ctx.sqr(tensor)?,
            };
        }
        let graph = Graph::build_forward(&ctx, tensor)?;
        let mut measure = MeasuringPlanner::for_backend(backend.as_ref())?;
        let size = measure.alloc_graph(&mut ctx, &graph)?;

        let mut planner = ArenaPlanner::from_backend(backend.as_ref(), size)?;
        let used = planner.alloc_graph(&mut ctx, &graph)?;
        ensure!(used <= size, "real pass used {used} of {size} bytes");

        let alignment = backend.alignment();
        let mut spans = Vec::new();
        for id in graph.nodes().iter().chain(graph.leafs()) {
            let Some(data) = ctx.data(*id)? else {
                bail!("tensor {id} left unbound");
            };
            ensure!(data.offset % alignment == 0, "offset {} unaligned", data.offset);
            spans.push((data.offset, data.offset + ctx.tensor(*id)?.nbytes()));
        }
        spans.sort_unstable();
        for pair in spans.windows(2) {
            ensure!(pair[0].1 <= pair[1].0, "overlapping spans {pair:?}");
        }
    }
    Ok(())
}

pub fn transfers_are_bounds_checked(backend: &Arc<dyn Backend>) -> anyhow::Result<()> {
    let mut ctx = Context::new(ContextParams::headers_only(1 << 16));
    let t = ctx.new_tensor_1d(DType::F32, 4)?;
    let buffer = backend.alloc_buffer(align_up(16, backend.alignment()))?;
    buffer.init_tensor(&mut ctx, t)?;

    backend.set_tensor_async(&ctx, t, 8, &[0u8; 8])?;
    match backend.set_tensor_async(&ctx, t, 12, &[0u8; 8]) {
        Err(BackendError::OutOfBounds { .. }) => {}
        other => bail!("expected an out-of-bounds error, got {other:?}"),
    }
    let mut out = [0u8; 20];
    ensure!(
        backend.get_tensor_async(&ctx, t, 0, &mut out).is_err(),
        "read past the end of a tensor succeeded"
    );
    Ok(())
}

pub fn tensor_copy_between_buffers(backend: &Arc<dyn Backend>) -> anyhow::Result<()> {
    let mut ctx = Context::new(ContextParams::headers_only(1 << 16));
    let src = ctx.new_tensor_2d(DType::F32, 3, 3)?;
    let dst = ctx.new_tensor_2d(DType::F32, 3, 3)?;
    let first = backend.alloc_buffer(64)?;
    let second = backend.alloc_buffer(64)?;
    first.init_tensor(&mut ctx, src)?;
    second.init_tensor(&mut ctx, dst)?;

    let values: Vec<f32> = (0..9).map(|i| i as f32 * 1.5).collect();
    upload(backend, &ctx, src, &values)?;
    backend.cpy_tensor_async(&ctx, src, dst)?;
    ensure!(download(backend, &ctx, dst)? == values, "copy lost data");
    Ok(())
}

pub fn buffers_are_aligned(backend: &Arc<dyn Backend>) -> anyhow::Result<()> {
    let buffer = backend.alloc_buffer(100)?;
    ensure!(buffer.size() >= 100, "buffer smaller than requested");
    if buffer.is_host() {
        ensure!(buffer.base() % backend.alignment() == 0, "unaligned host buffer");
    }
    buffer.clear(0xab)?;
    buffer.free();
    ensure!(buffer.is_freed(), "buffer still live after free");
    ensure!(buffer.clear(0).is_err(), "cleared a freed buffer");
    Ok(())
}
