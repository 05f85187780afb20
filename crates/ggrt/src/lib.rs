//! Arena-planned tensor graphs over pluggable compute backends.
//!
//! Tensors are created as headers in a fixed-capacity [`Context`] and wired
//! into a [`Graph`]. Planners bind their data into backend buffers, and a
//! [`Backend`] or the multi-backend [`Scheduler`] executes the graph.

pub mod alloc;
pub mod backend;
pub mod context;
mod env;
pub mod graph;
pub mod layout;
pub mod logging;
mod ops;
pub mod profiling;
pub mod sched;
pub mod tensor;

pub use alloc::{AllocError, ArenaPlanner, MeasuringPlanner, Planner};
pub use backend::{
    Backend, BackendBuffer, BackendError, BackendResult, BufferHandle, BufferType, BufferUsage,
    HostBuffer, UnavailableBackend,
};
pub use context::{Context, ContextError, ContextParams, TENSOR_OVERHEAD};
pub use graph::{EvalOrder, Graph, GraphError};
pub use profiling::GraphPerfReport;
pub use sched::{EvalCallback, SchedError, Scheduler};
pub use tensor::{DType, Op, OpKind, PerfCounters, TensorData, TensorHeader, TensorId, UnaryOp};
