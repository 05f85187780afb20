use std::sync::Arc;

use ggrt::{
    AllocError, ArenaPlanner, Backend, BackendBuffer, BufferHandle, Context, ContextParams, DType,
    Graph, HostBuffer, MeasuringPlanner, Planner,
};
use ggrt_backend_ref_cpu::CpuBackend;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn cpu() -> Arc<dyn Backend> {
    Arc::new(CpuBackend::new())
}

/// Three-tensor chain of 10 floats each: every tensor pads to 64 bytes.
fn chain(ctx: &mut Context) -> anyhow::Result<Graph> {
    let a = ctx.new_tensor_1d(DType::F32, 10)?;
    let b = ctx.sqr(a)?;
    let c = ctx.scale(b, 3.0)?;
    Ok(Graph::build_forward(ctx, c)?)
}

/// Bound offset of every node, then every leaf.
fn offsets(ctx: &Context, graph: &Graph) -> anyhow::Result<Vec<usize>> {
    graph
        .nodes()
        .iter()
        .chain(graph.leafs())
        .map(|id| Ok(ctx.data(*id)?.map_or(usize::MAX, |d| d.offset)))
        .collect()
}

#[test]
fn measured_size_is_the_sum_of_padded_sizes() -> anyhow::Result<()> {
    let mut ctx = Context::new(ContextParams::headers_only(1 << 16));
    let graph = chain(&mut ctx)?;
    assert_eq!(graph.n_nodes(), 2);
    assert_eq!(graph.n_leafs(), 1);

    let backend = cpu();
    let mut measure = MeasuringPlanner::for_backend(backend.as_ref())?;
    let size = measure.alloc_graph(&mut ctx, &graph)?;
    assert_eq!(size, 3 * 64);
    assert_eq!(measure.watermark(), size);
    for id in graph.nodes().iter().chain(graph.leafs()) {
        assert!(ctx.data(*id)?.is_none(), "measuring bound {id}");
    }

    let mut planner = ArenaPlanner::from_backend(backend.as_ref(), size)?;
    assert_eq!(planner.alloc_graph(&mut ctx, &graph)?, size);
    assert_eq!(offsets(&ctx, &graph)?, vec![0, 64, 128]);
    Ok(())
}

#[test]
fn measuring_is_idempotent_across_resets() -> anyhow::Result<()> {
    let mut ctx = Context::new(ContextParams::headers_only(1 << 16));
    let graph = chain(&mut ctx)?;
    let mut measure = MeasuringPlanner::new(64)?;
    let first = measure.alloc_graph(&mut ctx, &graph)?;
    measure.reset();
    assert_eq!(measure.alloc_size(), 0);
    assert_eq!(measure.alloc_graph(&mut ctx, &graph)?, first);
    Ok(())
}

#[test]
fn arena_reset_replays_the_same_offsets() -> anyhow::Result<()> {
    let mut ctx = Context::new(ContextParams::headers_only(1 << 16));
    let graph = chain(&mut ctx)?;
    let mut planner = ArenaPlanner::from_backend(cpu().as_ref(), 3 * 64)?;
    let first = planner.alloc_graph(&mut ctx, &graph)?;
    let placed = offsets(&ctx, &graph)?;
    assert_eq!(placed, vec![0, 64, 128]);

    planner.reset();
    assert_eq!(planner.alloc_size(), 0);
    assert_eq!(planner.alloc_graph(&mut ctx, &graph)?, first);
    assert_eq!(offsets(&ctx, &graph)?, placed);
    for id in graph.nodes().iter().chain(graph.leafs()) {
        assert!(ctx.data(*id)?.is_some_and(|d| d.buffer.same_buffer(planner.buffer())));
    }
    Ok(())
}

#[test]
fn measured_size_never_exhausts_a_real_pass() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(99);
    let backend = cpu();
    for alignment in [32, 64, 128] {
        for _ in 0..6 {
            let mut ctx = Context::new(ContextParams::headers_only(1 << 20));
            let rows = rng.gen_range(1..6);
            let mut x = ctx.new_tensor_2d(DType::F32, rng.gen_range(1..50), rows)?;
            for _ in 0..rng.gen_range(1..10) {
                let cols = ctx.tensor(x)?.ne()[0];
                x = if rng.gen_bool(0.5) {
                    let w = ctx.new_tensor_2d(DType::F32, cols, rng.gen_range(1..20))?;
                    ctx.mul_mat(w, x)?
                } else {
                    ctx.gelu(x)?
                };
            }
            let graph = Graph::build_forward(&ctx, x)?;

            let mut measure = MeasuringPlanner::new(alignment)?;
            let size = measure.alloc_graph(&mut ctx, &graph)?;
            let buffer = backend.alloc_buffer(size)?;
            let mut planner = ArenaPlanner::from_buffer(buffer)?;
            assert!(!planner.is_owned());
            assert_eq!(planner.alignment(), 32);
            let used = planner.alloc_graph(&mut ctx, &graph)?;
            assert!(used <= size, "real pass used {used} of {size} bytes");
        }
    }
    Ok(())
}

#[test]
fn exhaustion_leaves_the_tensor_unbound() -> anyhow::Result<()> {
    let mut ctx = Context::new(ContextParams::headers_only(1 << 16));
    let a = ctx.new_tensor_1d(DType::F32, 8)?;
    let b = ctx.new_tensor_1d(DType::F32, 16)?;
    let mut planner = ArenaPlanner::from_buffer(BufferHandle::new(HostBuffer::new(64)))?;
    planner.alloc(&mut ctx, a)?;
    assert_eq!(ctx.data(a)?.map(|d| d.offset), Some(0));

    match planner.alloc(&mut ctx, b) {
        Err(AllocError::Exhausted {
            needed, offset, size, ..
        }) => assert_eq!((needed, offset, size), (64, 32, 64)),
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert!(ctx.data(b)?.is_none());

    planner.reset();
    planner.alloc(&mut ctx, b)?;
    assert_eq!(ctx.data(b)?.map(|d| d.offset), Some(0));
    Ok(())
}

#[test]
fn views_take_no_planner_space() -> anyhow::Result<()> {
    let mut ctx = Context::new(ContextParams::headers_only(1 << 16));
    let a = ctx.new_tensor_2d(DType::F32, 4, 4)?;
    let t = ctx.transpose(a)?;
    let c = ctx.cont(t)?;
    let graph = Graph::build_forward(&ctx, c)?;
    assert_eq!(graph.n_nodes(), 2);

    let mut measure = MeasuringPlanner::new(32)?;
    assert_eq!(measure.alloc_graph(&mut ctx, &graph)?, 2 * 64);

    let mut planner = ArenaPlanner::from_buffer(BufferHandle::new(HostBuffer::new(128)))?;
    planner.alloc_graph(&mut ctx, &graph)?;
    let base = ctx.data(a)?.map(|d| d.offset);
    assert_eq!(ctx.data(t)?.map(|d| d.offset), base);
    Ok(())
}

#[test]
fn owned_buffers_are_freed_with_the_planner() -> anyhow::Result<()> {
    let backend = cpu();
    let planner = ArenaPlanner::from_backend(backend.as_ref(), 256)?;
    assert!(planner.is_owned());
    let buffer = planner.buffer().clone();
    assert!(!buffer.is_freed());
    planner.free();
    assert!(buffer.is_freed());

    let external = backend.alloc_buffer(256)?;
    drop(ArenaPlanner::from_buffer(external.clone())?);
    assert!(!external.is_freed());
    Ok(())
}

#[test]
fn compute_pass_on_an_allocating_context() -> anyhow::Result<()> {
    let mut ctx = Context::new(ContextParams::new(1 << 20));
    let a = ctx.new_tensor_2d(DType::F32, 4, 4)?;
    let b = ctx.new_tensor_2d(DType::F32, 4, 4)?;
    let c = ctx.add(a, b)?;
    let graph = Graph::build_forward(&ctx, c)?;
    assert_eq!((graph.n_nodes(), graph.n_leafs()), (1, 2));

    ctx.write_f32(a, &[1.0; 16])?;
    ctx.write_f32(b, &(0..16).map(|i| i as f32).collect::<Vec<_>>())?;
    cpu().graph_compute(&mut ctx, &graph)?;

    let header = ctx.tensor(c)?;
    assert_eq!(header.ne(), [4, 4, 1, 1]);
    assert_eq!(header.nbytes(), 64);
    assert_eq!(ctx.data_addr(c)?.map(|addr| addr % 32), Some(0));
    assert_eq!(ctx.read_f32(c)?, (1..=16).map(|i| i as f32).collect::<Vec<_>>());
    Ok(())
}
