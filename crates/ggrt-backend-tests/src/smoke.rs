use std::sync::Arc;

use anyhow::{ensure, Context as _};
use ggrt::{
    ArenaPlanner, Backend, Context, ContextParams, DType, Graph, GraphPerfReport,
    MeasuringPlanner, Planner, TensorId,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Measures `graph`, then binds it into a fresh buffer of `backend`. The
/// returned planner owns that buffer.
pub fn plan(
    backend: &Arc<dyn Backend>,
    ctx: &mut Context,
    graph: &Graph,
) -> anyhow::Result<ArenaPlanner> {
    let mut measure = MeasuringPlanner::for_backend(backend.as_ref())?;
    let size = measure.alloc_graph(ctx, graph)?;
    let mut planner = ArenaPlanner::from_backend(backend.as_ref(), size)?;
    planner.alloc_graph(ctx, graph)?;
    Ok(planner)
}

pub fn upload(
    backend: &Arc<dyn Backend>,
    ctx: &Context,
    tensor: TensorId,
    values: &[f32],
) -> anyhow::Result<()> {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    backend.set_tensor_async(ctx, tensor, 0, &bytes)?;
    Ok(())
}

/// Reads back an `f32` tensor after synchronizing the backend.
pub fn download(
    backend: &Arc<dyn Backend>,
    ctx: &Context,
    tensor: TensorId,
) -> anyhow::Result<Vec<f32>> {
    let len = ctx.tensor(tensor)?.nbytes();
    let mut bytes = vec![0u8; len];
    backend.synchronize()?;
    backend.get_tensor_async(ctx, tensor, 0, &mut bytes)?;
    backend.synchronize()?;
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn headers_only() -> Context {
    Context::new(ContextParams::headers_only(1 << 20))
}

pub fn add_matches_expected(backend: &Arc<dyn Backend>) -> anyhow::Result<()> {
    let mut ctx = headers_only();
    let a = ctx.new_tensor_2d(DType::F32, 3, 2)?;
    let b = ctx.new_tensor_1d(DType::F32, 3)?;
    let c = ctx.add(a, b)?;
    let graph = Graph::build_forward(&ctx, c)?;
    let _planner = plan(backend, &mut ctx, &graph)?;

    upload(backend, &ctx, a, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
    upload(backend, &ctx, b, &[10.0, 20.0, 30.0])?;
    backend.graph_compute(&mut ctx, &graph)?;

    let out = download(backend, &ctx, c)?;
    ensure!(
        out == [11.0, 22.0, 33.0, 14.0, 25.0, 36.0],
        "unexpected broadcast sum {out:?}"
    );
    Ok(())
}

pub fn mul_mat_matches_expected(backend: &Arc<dyn Backend>) -> anyhow::Result<()> {
    let mut ctx = headers_only();
    let a = ctx.new_tensor_2d(DType::F32, 2, 2)?;
    let b = ctx.new_tensor_2d(DType::F32, 2, 2)?;
    let c = ctx.mul_mat(a, b)?;
    let graph = Graph::build_forward(&ctx, c)?;
    let _planner = plan(backend, &mut ctx, &graph)?;

    upload(backend, &ctx, a, &[1.0, 2.0, 3.0, 4.0])?;
    upload(backend, &ctx, b, &[5.0, 6.0, 7.0, 8.0])?;
    backend.graph_compute(&mut ctx, &graph)?;

    let out = download(backend, &ctx, c)?;
    ensure!(out == [17.0, 39.0, 23.0, 53.0], "unexpected product {out:?}");
    Ok(())
}

pub fn soft_max_rows_sum_to_one(backend: &Arc<dyn Backend>) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let mut ctx = headers_only();
    let logits = ctx.new_tensor_2d(DType::F32, 17, 5)?;
    let probs = ctx.soft_max(logits)?;
    let graph = Graph::build_forward(&ctx, probs)?;
    let _planner = plan(backend, &mut ctx, &graph)?;

    let values: Vec<f32> = (0..17 * 5).map(|_| rng.gen_range(-8.0..8.0)).collect();
    upload(backend, &ctx, logits, &values)?;
    backend.graph_compute(&mut ctx, &graph)?;

    let out = download(backend, &ctx, probs)?;
    for (row, chunk) in out.chunks(17).enumerate() {
        let sum: f32 = chunk.iter().sum();
        ensure!((sum - 1.0).abs() < 1e-5, "row {row} sums to {sum}");
        ensure!(chunk.iter().all(|&p| p > 0.0), "row {row} has non-positive entries");
    }
    Ok(())
}

pub fn perf_counters_advance(backend: &Arc<dyn Backend>) -> anyhow::Result<()> {
    let mut ctx = headers_only();
    let a = ctx.new_tensor_1d(DType::F32, 64)?;
    let b = ctx.sqr(a)?;
    let c = ctx.scale(b, 0.5)?;
    let graph = Graph::build_forward(&ctx, c)?;
    let _planner = plan(backend, &mut ctx, &graph)?;
    upload(backend, &ctx, a, &[2.0; 64])?;

    backend.graph_compute(&mut ctx, &graph)?;
    backend.graph_compute(&mut ctx, &graph)?;
    backend.synchronize()?;

    let report = GraphPerfReport::collect(&ctx, &graph).context("collecting perf report")?;
    ensure!(report.nodes.len() == 2, "expected two nodes, got {}", report.nodes.len());
    for node in &report.nodes {
        ensure!(node.runs == 2, "node {} ran {} times", node.name, node.runs);
    }
    ensure!(download(backend, &ctx, c)? == vec![2.0; 64]);
    Ok(())
}
