//! Multi-backend scheduling.
//!
//! The scheduler places every node on the first backend able to run it,
//! plans each backend's share of the graph into a buffer of that backend,
//! and runs consecutive same-backend stretches of nodes together.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::alloc::{AllocError, ArenaPlanner, MeasuringPlanner, Planner};
use crate::backend::{Backend, BackendBuffer, BackendError, BufferType};
use crate::context::{Context, ContextError};
use crate::env;
use crate::graph::{Graph, GraphError};
use crate::tensor::{TensorHeader, TensorId};

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("no backend supports {op} for tensor {tensor}")]
    UnsupportedOp { op: &'static str, tensor: String },
    #[error("scheduler needs at least one backend")]
    NoBackends,
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Observer called with `ask = true` before and `ask = false` after each node.
pub type EvalCallback = Box<dyn FnMut(&TensorHeader, bool) + Send>;

struct SchedBackend {
    backend: Arc<dyn Backend>,
    buffer_type: Arc<dyn BufferType>,
    reserved: usize,
    planner: Option<ArenaPlanner>,
}

/// Backend index per node, plus the tensors each backend must bind, in
/// allocation order.
struct Placement {
    nodes: Vec<usize>,
    tensors: Vec<Vec<TensorId>>,
}

pub struct Scheduler {
    backends: Vec<SchedBackend>,
    assignments: HashMap<TensorId, usize>,
    eval_callback: Option<EvalCallback>,
}

impl Scheduler {
    /// Backends are tried in order. A backend without an explicit buffer type
    /// uses its default one.
    pub fn new(
        backends: Vec<(Arc<dyn Backend>, Option<Arc<dyn BufferType>>)>,
        graph_size: usize,
    ) -> Result<Self, SchedError> {
        if backends.is_empty() {
            return Err(SchedError::NoBackends);
        }
        let backends = backends
            .into_iter()
            .map(|(backend, buffer_type)| SchedBackend {
                buffer_type: buffer_type.unwrap_or_else(|| backend.default_buffer_type()),
                backend,
                reserved: 0,
                planner: None,
            })
            .collect();
        Ok(Self {
            backends,
            assignments: HashMap::with_capacity(graph_size),
            eval_callback: None,
        })
    }

    pub fn n_backends(&self) -> usize {
        self.backends.len()
    }

    pub fn backend(&self, index: usize) -> Option<&Arc<dyn Backend>> {
        self.backends.get(index).map(|b| &b.backend)
    }

    /// Backend the last placement chose for `tensor`.
    pub fn tensor_backend(&self, tensor: TensorId) -> Option<&Arc<dyn Backend>> {
        let index = *self.assignments.get(&tensor)?;
        self.backend(index)
    }

    /// Bytes reserved for the backend at `index`.
    pub fn reserved_size(&self, index: usize) -> Option<usize> {
        self.backends.get(index).map(|b| b.reserved)
    }

    /// Compute buffer currently held for the backend at `index`.
    pub fn buffer_size(&self, index: usize) -> Option<usize> {
        self.backends
            .get(index)?
            .planner
            .as_ref()
            .map(|planner| planner.buffer().size())
    }

    pub fn set_eval_callback(&mut self, callback: EvalCallback) {
        self.eval_callback = Some(callback);
    }

    pub fn clear_eval_callback(&mut self) {
        self.eval_callback = None;
    }

    fn place(&mut self, ctx: &Context, graph: &Graph) -> Result<Placement, SchedError> {
        let mut nodes = Vec::with_capacity(graph.n_nodes());
        let mut tensors = vec![Vec::new(); self.backends.len()];
        self.assignments.clear();

        for &node in graph.nodes() {
            let header = ctx.tensor(node)?;
            let index = self
                .backends
                .iter()
                .position(|b| {
                    b.backend.supports_op(header)
                        && b.buffer_type.supports_backend(b.backend.as_ref())
                })
                .ok_or_else(|| SchedError::UnsupportedOp {
                    op: header.op().name(),
                    tensor: header.label(),
                })?;
            if env::sched_debug_enabled() {
                tracing::debug!(
                    tensor = %header.label(),
                    op = header.op().name(),
                    backend = self.backends[index].backend.name(),
                    "placed node"
                );
            }
            nodes.push(index);
            if self.needs_binding(header) {
                tensors[index].push(node);
            }
            self.assignments.insert(node, index);
        }

        // Leafs live with their first consumer.
        for (position, &node) in graph.nodes().iter().enumerate() {
            for &src in ctx.tensor(node)?.src() {
                self.assignments.entry(src).or_insert(nodes[position]);
            }
        }
        for &leaf in graph.leafs() {
            let index = *self.assignments.entry(leaf).or_insert(0);
            if self.needs_binding(ctx.tensor(leaf)?) {
                tensors[index].push(leaf);
            }
        }
        Ok(Placement { nodes, tensors })
    }

    /// Tensors bound outside the compute buffers keep their data.
    fn needs_binding(&self, header: &TensorHeader) -> bool {
        match header.data() {
            None => true,
            Some(data) => self.backends.iter().any(|slot| {
                slot.planner
                    .as_ref()
                    .is_some_and(|planner| planner.buffer().same_buffer(&data.buffer))
            }),
        }
    }

    /// Sizes each backend's compute buffer from a measuring pass over
    /// `measure_graph`. Sizes only grow.
    pub fn reserve(&mut self, ctx: &mut Context, measure_graph: &Graph) -> Result<(), SchedError> {
        let placement = self.place(ctx, measure_graph)?;
        for (slot, tensors) in self.backends.iter_mut().zip(&placement.tensors) {
            let mut planner = MeasuringPlanner::for_buffer_type(slot.buffer_type.clone())?;
            for &tensor in tensors {
                planner.alloc(ctx, tensor)?;
            }
            slot.reserved = slot.reserved.max(planner.alloc_size());
            tracing::debug!(
                backend = slot.backend.name(),
                tensors = tensors.len(),
                reserved = slot.reserved,
                "reserved compute buffer"
            );
        }
        Ok(())
    }

    /// Binds every unbound tensor of `graph` into its backend's compute
    /// buffer. Tensors that already own memory elsewhere are left alone.
    pub fn alloc_graph(&mut self, ctx: &mut Context, graph: &Graph) -> Result<(), SchedError> {
        let placement = self.place(ctx, graph)?;
        for (slot, tensors) in self.backends.iter_mut().zip(&placement.tensors) {
            let mut measure = MeasuringPlanner::for_buffer_type(slot.buffer_type.clone())?;
            for &tensor in tensors {
                measure.alloc(ctx, tensor)?;
            }
            let needed = measure.alloc_size();
            if needed > slot.reserved {
                if slot.reserved > 0 {
                    tracing::warn!(
                        backend = slot.backend.name(),
                        reserved = slot.reserved,
                        needed,
                        "graph exceeds reserved size, growing compute buffer"
                    );
                }
                slot.reserved = needed;
            }
            if slot.reserved == 0 {
                continue;
            }

            let reusable = slot
                .planner
                .as_ref()
                .is_some_and(|planner| planner.buffer().size() >= slot.reserved);
            let planner = match slot.planner.take() {
                Some(mut planner) if reusable => {
                    planner.reset();
                    planner
                }
                _ => ArenaPlanner::from_buffer_type(slot.buffer_type.clone(), slot.reserved)?,
            };
            let planner = slot.planner.insert(planner);
            for &tensor in tensors {
                planner.alloc(ctx, tensor)?;
            }
        }
        Ok(())
    }

    /// Runs `graph`. Placement is checked for every node before any executes.
    pub fn compute_graph(&mut self, ctx: &mut Context, graph: &Graph) -> Result<(), SchedError> {
        let placement = self.place(ctx, graph)?;

        if let Some(callback) = self.eval_callback.as_mut() {
            for (i, &node) in graph.nodes().iter().enumerate() {
                callback(ctx.tensor(node)?, true);
                let backend = &self.backends[placement.nodes[i]].backend;
                backend.graph_compute(ctx, &graph.view(i, i + 1)?)?;
                backend.synchronize()?;
                callback(ctx.tensor(node)?, false);
            }
            return Ok(());
        }

        let mut used = vec![false; self.backends.len()];
        let mut start = 0;
        while start < placement.nodes.len() {
            let index = placement.nodes[start];
            let end = placement.nodes[start..]
                .iter()
                .position(|&b| b != index)
                .map_or(placement.nodes.len(), |len| start + len);
            let backend = &self.backends[index].backend;
            tracing::trace!(backend = backend.name(), start, end, "running split");
            backend.graph_compute(ctx, &graph.view(start, end)?)?;
            used[index] = true;
            start = end;
        }
        for (slot, used) in self.backends.iter().zip(used) {
            if used {
                slot.backend.synchronize()?;
            }
        }
        Ok(())
    }

    /// `alloc_graph` followed by `compute_graph`.
    pub fn graph_compute(&mut self, ctx: &mut Context, graph: &Graph) -> Result<(), SchedError> {
        self.alloc_graph(ctx, graph)?;
        self.compute_graph(ctx, graph)
    }

    /// Forgets the last placement and rewinds the compute buffers for reuse.
    pub fn reset(&mut self) {
        self.assignments.clear();
        for slot in &mut self.backends {
            if let Some(planner) = slot.planner.as_mut() {
                planner.reset();
            }
        }
    }
}
