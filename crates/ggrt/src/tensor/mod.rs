mod access;
pub mod dtype;
pub(crate) mod header;
pub mod op;

pub use dtype::{DType, TypeTraits};
pub use header::{PerfCounters, TensorData, TensorHeader, TensorId, MAX_NAME};
pub use op::{op_name, op_symbol, Op, OpKind, UnaryOp};
