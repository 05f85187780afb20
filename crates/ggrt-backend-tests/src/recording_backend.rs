use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ggrt::{Backend, BackendResult, BufferType, Context, Graph, TensorHeader, TensorId};

type OpFilter = Box<dyn Fn(&TensorHeader) -> bool + Send + Sync>;

/// Test-only backend that forwards to an inner backend and records what it
/// was asked to run. An optional filter narrows the ops it claims to support.
pub struct RecordingBackend {
    inner: Arc<dyn Backend>,
    filter: Option<OpFilter>,
    executed: Mutex<Vec<TensorId>>,
    graph_calls: AtomicUsize,
    synchronize_calls: AtomicUsize,
}

impl RecordingBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self {
            inner,
            filter: None,
            executed: Mutex::new(Vec::new()),
            graph_calls: AtomicUsize::new(0),
            synchronize_calls: AtomicUsize::new(0),
        }
    }

    pub fn accepting<F>(inner: Arc<dyn Backend>, filter: F) -> Self
    where
        F: Fn(&TensorHeader) -> bool + Send + Sync + 'static,
    {
        Self {
            filter: Some(Box::new(filter)),
            ..Self::new(inner)
        }
    }

    /// Nodes passed to `graph_compute`, in execution order.
    pub fn executed(&self) -> Vec<TensorId> {
        self.executed
            .lock()
            .expect("backend mutex poisoned")
            .clone()
    }

    pub fn graph_calls(&self) -> usize {
        self.graph_calls.load(Ordering::SeqCst)
    }

    pub fn synchronize_calls(&self) -> usize {
        self.synchronize_calls.load(Ordering::SeqCst)
    }
}

impl Backend for RecordingBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn default_buffer_type(&self) -> Arc<dyn BufferType> {
        self.inner.default_buffer_type()
    }

    fn set_tensor_async(
        &self,
        ctx: &Context,
        tensor: TensorId,
        offset: usize,
        data: &[u8],
    ) -> BackendResult<()> {
        self.inner.set_tensor_async(ctx, tensor, offset, data)
    }

    fn get_tensor_async(
        &self,
        ctx: &Context,
        tensor: TensorId,
        offset: usize,
        out: &mut [u8],
    ) -> BackendResult<()> {
        self.inner.get_tensor_async(ctx, tensor, offset, out)
    }

    fn cpy_tensor_async(&self, ctx: &Context, src: TensorId, dst: TensorId) -> BackendResult<()> {
        self.inner.cpy_tensor_async(ctx, src, dst)
    }

    fn synchronize(&self) -> BackendResult<()> {
        self.synchronize_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.synchronize()
    }

    fn graph_compute(&self, ctx: &mut Context, graph: &Graph) -> BackendResult<()> {
        self.graph_calls.fetch_add(1, Ordering::SeqCst);
        self.executed
            .lock()
            .expect("backend mutex poisoned")
            .extend_from_slice(graph.nodes());
        self.inner.graph_compute(ctx, graph)
    }

    fn supports_op(&self, tensor: &TensorHeader) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(tensor)) && self.inner.supports_op(tensor)
    }
}
