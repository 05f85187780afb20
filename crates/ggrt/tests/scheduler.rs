use std::sync::{Arc, Mutex};

use ggrt::{
    Backend, BackendBuffer, Context, ContextParams, DType, Graph, OpKind, SchedError, Scheduler,
    TensorId, UnavailableBackend,
};
use ggrt_backend_ref_cpu::CpuBackend;
use ggrt_backend_tests::RecordingBackend;

fn cpu() -> Arc<dyn Backend> {
    Arc::new(CpuBackend::new())
}

fn headers_only() -> Context {
    Context::new(ContextParams::headers_only(1 << 20))
}

#[test]
fn unsupported_nodes_fall_through_to_the_next_backend() -> anyhow::Result<()> {
    ggrt::logging::init_tracing();
    let recorder = Arc::new(RecordingBackend::new(cpu()));
    let gpu: Arc<dyn Backend> = Arc::new(UnavailableBackend::new("GPU"));
    let mut sched = Scheduler::new(vec![(gpu, None), (recorder.clone(), None)], 64)?;

    let mut ctx = headers_only();
    let a = ctx.new_tensor_2d(DType::F32, 3, 2)?;
    let b = ctx.new_tensor_2d(DType::F32, 3, 2)?;
    let y = ctx.mul_mat(a, b)?;
    let out = ctx.relu(y)?;
    let graph = Graph::build_forward(&ctx, out)?;

    sched.alloc_graph(&mut ctx, &graph)?;
    for id in [a, b, y, out] {
        assert_eq!(sched.tensor_backend(id).map(|b| b.name()), Some("CPU"));
    }
    assert_eq!(sched.buffer_size(0), None);
    assert!(sched.buffer_size(1).is_some());

    ctx.write_f32(a, &[1.0, 0.0, -1.0, 2.0, 1.0, 0.0])?;
    ctx.write_f32(b, &[1.0, 1.0, 1.0, 3.0, 3.0, 3.0])?;
    sched.compute_graph(&mut ctx, &graph)?;

    assert_eq!(recorder.executed(), vec![y, out]);
    assert_eq!(recorder.graph_calls(), 1);
    assert_eq!(recorder.synchronize_calls(), 1);
    assert_eq!(ctx.read_f32(out)?, vec![0.0, 3.0, 0.0, 9.0]);
    Ok(())
}

#[test]
fn placement_fails_before_anything_runs() -> anyhow::Result<()> {
    let recorder = Arc::new(RecordingBackend::accepting(cpu(), |t| {
        t.op().kind() != OpKind::MulMat
    }));
    let mut sched = Scheduler::new(vec![(recorder.clone(), None)], 64)?;

    let mut ctx = headers_only();
    let a = ctx.new_tensor_2d(DType::F32, 4, 4)?;
    let pre = ctx.sqr(a)?;
    let y = ctx.mul_mat(pre, a)?;
    let graph = Graph::build_forward(&ctx, y)?;

    let err = sched.graph_compute(&mut ctx, &graph).unwrap_err();
    assert!(
        matches!(&err, SchedError::UnsupportedOp { op: "MUL_MAT", .. }),
        "{err}"
    );
    assert!(recorder.executed().is_empty());
    assert_eq!(recorder.graph_calls(), 0);
    Ok(())
}

#[test]
fn consecutive_nodes_on_one_backend_run_together() -> anyhow::Result<()> {
    let adder = Arc::new(RecordingBackend::accepting(cpu(), |t| {
        t.op().kind() == OpKind::Add
    }));
    let rest = Arc::new(RecordingBackend::new(cpu()));
    let mut sched = Scheduler::new(vec![(adder.clone(), None), (rest.clone(), None)], 64)?;

    let mut ctx = headers_only();
    let a = ctx.new_tensor_1d(DType::F32, 4)?;
    let b = ctx.new_tensor_1d(DType::F32, 4)?;
    let c = ctx.add(a, b)?;
    let d = ctx.add(c, b)?;
    let e = ctx.sqr(d)?;
    let f = ctx.scale(e, 0.5)?;
    let g = ctx.add(f, a)?;
    let graph = Graph::build_forward(&ctx, g)?;

    sched.alloc_graph(&mut ctx, &graph)?;
    ctx.write_f32(a, &[1.0, 2.0, 3.0, 4.0])?;
    ctx.write_f32(b, &[1.0; 4])?;
    sched.compute_graph(&mut ctx, &graph)?;

    assert_eq!(adder.executed(), vec![c, d, g]);
    assert_eq!(adder.graph_calls(), 2);
    assert_eq!(rest.executed(), vec![e, f]);
    assert_eq!(rest.graph_calls(), 1);
    assert_eq!(adder.synchronize_calls(), 1);
    assert_eq!(ctx.read_f32(g)?, vec![5.5, 10.0, 15.5, 22.0]);
    Ok(())
}

#[test]
fn eval_callback_brackets_every_node() -> anyhow::Result<()> {
    let seen: Arc<Mutex<Vec<(TensorId, bool)>>> = Arc::default();
    let mut sched = Scheduler::new(vec![(cpu(), None)], 64)?;
    let sink = seen.clone();
    sched.set_eval_callback(Box::new(move |tensor, ask| {
        sink.lock().expect("callback mutex poisoned").push((tensor.id(), ask));
    }));

    let mut ctx = headers_only();
    let a = ctx.new_tensor_1d(DType::F32, 2)?;
    let b = ctx.neg(a)?;
    let c = ctx.abs(b)?;
    let graph = Graph::build_forward(&ctx, c)?;
    sched.alloc_graph(&mut ctx, &graph)?;
    ctx.write_f32(a, &[-2.0, 3.0])?;
    sched.compute_graph(&mut ctx, &graph)?;

    let seen = seen.lock().expect("callback mutex poisoned").clone();
    assert_eq!(seen, vec![(b, true), (b, false), (c, true), (c, false)]);
    assert_eq!(ctx.read_f32(c)?, vec![2.0, 3.0]);

    sched.clear_eval_callback();
    sched.compute_graph(&mut ctx, &graph)?;
    assert_eq!(ctx.tensor(c)?.perf().runs, 2);
    Ok(())
}

#[test]
fn reserved_buffers_are_reused() -> anyhow::Result<()> {
    let mut sched = Scheduler::new(vec![(cpu(), None)], 64)?;

    let mut ctx = headers_only();
    let x = ctx.new_tensor_2d(DType::F32, 64, 8)?;
    let big = ctx.soft_max(x)?;
    let worst = Graph::build_forward(&ctx, big)?;
    sched.reserve(&mut ctx, &worst)?;
    let reserved = sched.reserved_size(0).unwrap_or_default();
    assert_eq!(reserved, 2 * 64 * 8 * 4);
    assert_eq!(sched.buffer_size(0), None);

    sched.graph_compute(&mut ctx, &worst)?;
    assert_eq!(sched.backend(0).map(|b| b.name()), Some("CPU"));
    let first = ctx.data(big)?.map(|d| d.buffer.id());

    ctx.reset();
    sched.reset();
    let small = ctx.new_tensor_1d(DType::F32, 16)?;
    let out = ctx.sqr(small)?;
    let graph = Graph::build_forward(&ctx, out)?;
    sched.alloc_graph(&mut ctx, &graph)?;
    assert_eq!(sched.reserved_size(0), Some(reserved));
    assert_eq!(ctx.data(out)?.map(|d| d.buffer.id()), first);
    Ok(())
}

#[test]
fn graphs_beyond_the_reservation_grow_the_buffer() -> anyhow::Result<()> {
    let mut sched = Scheduler::new(vec![(cpu(), None)], 64)?;
    let mut ctx = headers_only();
    let a = ctx.new_tensor_1d(DType::F32, 8)?;
    let b = ctx.sqr(a)?;
    let small = Graph::build_forward(&ctx, b)?;
    sched.reserve(&mut ctx, &small)?;
    assert_eq!(sched.reserved_size(0), Some(64));

    let c = ctx.new_tensor_1d(DType::F32, 1024)?;
    let d = ctx.sqr(c)?;
    let large = Graph::build_forward(&ctx, d)?;
    sched.graph_compute(&mut ctx, &large)?;
    assert_eq!(sched.reserved_size(0), Some(2 * 4096));
    assert_eq!(sched.buffer_size(0), Some(2 * 4096));
    Ok(())
}

#[test]
fn tensors_with_context_memory_keep_their_values() -> anyhow::Result<()> {
    let mut sched = Scheduler::new(vec![(cpu(), None)], 16)?;
    let mut ctx = Context::new(ContextParams::new(1 << 20));
    let a = ctx.new_tensor_1d(DType::F32, 4)?;
    let b = ctx.new_tensor_1d(DType::F32, 4)?;
    ctx.write_f32(a, &[1.0; 4])?;
    ctx.write_f32(b, &[2.0; 4])?;
    let c = ctx.add(a, b)?;
    let graph = Graph::build_forward(&ctx, c)?;
    let arena = ctx.data(a)?.map(|d| d.buffer.id());

    sched.graph_compute(&mut ctx, &graph)?;
    assert_eq!(ctx.read_f32(c)?, vec![3.0; 4]);
    assert_eq!(ctx.data(a)?.map(|d| d.buffer.id()), arena);
    assert_eq!(ctx.data(c)?.map(|d| d.buffer.id()), arena);
    assert_eq!(sched.reserved_size(0), Some(0));
    assert_eq!(sched.buffer_size(0), None);
    Ok(())
}

#[test]
fn weights_in_their_own_buffer_are_not_rebound() -> anyhow::Result<()> {
    let backend = cpu();
    let mut sched = Scheduler::new(vec![(backend.clone(), None)], 16)?;
    let mut ctx = headers_only();
    let w = ctx.new_tensor_1d(DType::F32, 4)?;
    let x = ctx.new_tensor_1d(DType::F32, 4)?;
    let y = ctx.mul(w, x)?;
    let weights = backend.alloc_buffer(64)?;
    weights.init_tensor(&mut ctx, w)?;
    ctx.write_f32(w, &[2.0; 4])?;

    let graph = Graph::build_forward(&ctx, y)?;
    sched.alloc_graph(&mut ctx, &graph)?;
    ctx.write_f32(x, &[1.0, 2.0, 3.0, 4.0])?;
    sched.compute_graph(&mut ctx, &graph)?;
    assert!(ctx.data(w)?.is_some_and(|d| d.buffer.same_buffer(&weights)));
    assert_eq!(ctx.read_f32(y)?, vec![2.0, 4.0, 6.0, 8.0]);

    // Only the input and the result take compute buffer space.
    assert_eq!(sched.reserved_size(0), Some(2 * 32));
    sched.graph_compute(&mut ctx, &graph)?;
    assert!(ctx.data(w)?.is_some_and(|d| d.buffer.same_buffer(&weights)));
    Ok(())
}

#[test]
fn a_scheduler_needs_a_backend() {
    assert!(matches!(Scheduler::new(Vec::new(), 16), Err(SchedError::NoBackends)));
}
