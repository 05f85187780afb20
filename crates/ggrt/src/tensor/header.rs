use std::fmt;
use std::time::Duration;

use serde::Serialize;
use smallvec::SmallVec;

use crate::backend::{BackendBuffer, BufferHandle};
use crate::layout::{self, MAX_DIMS, TENSOR_ALIGNMENT};

use super::{DType, Op};

/// Longest tensor name kept; longer names are truncated on a char boundary.
pub const MAX_NAME: usize = 64;

/// Handle to a tensor header living in a [`crate::Context`].
///
/// Handles are only meaningful to the context that issued them and only until
/// that context is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId {
    pub(crate) context: u32,
    pub(crate) generation: u32,
    pub(crate) index: u32,
}

impl TensorId {
    /// Creation index within the owning context.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}@{}", self.index, self.context)
    }
}

/// Per-tensor execution counters maintained by backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PerfCounters {
    pub runs: u64,
    /// Monotonic clock ticks (nanoseconds) spent computing the tensor.
    pub cycles: u64,
    pub time: Duration,
}

impl PerfCounters {
    pub(crate) fn record(&mut self, elapsed: Duration) {
        self.runs += 1;
        self.cycles += u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.time += elapsed;
    }
}

/// Where a tensor's bytes live.
#[derive(Clone)]
pub struct TensorData {
    pub buffer: BufferHandle,
    pub offset: usize,
}

impl TensorData {
    /// Host address of the first byte, for alignment checks and diagnostics.
    pub fn addr(&self) -> usize {
        self.buffer.base() + self.offset
    }
}

impl fmt::Debug for TensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorData")
            .field("buffer", &self.buffer.id())
            .field("offset", &self.offset)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TensorHeader {
    pub(crate) id: TensorId,
    pub(crate) dtype: DType,
    pub(crate) ne: [usize; MAX_DIMS],
    pub(crate) nb: [usize; MAX_DIMS],
    pub(crate) nbytes: usize,
    pub(crate) op: Op,
    pub(crate) src: SmallVec<[TensorId; 2]>,
    pub(crate) view_src: Option<TensorId>,
    pub(crate) view_offs: usize,
    pub(crate) is_param: bool,
    pub(crate) data: Option<TensorData>,
    pub(crate) name: String,
    pub(crate) perf: PerfCounters,
    pub(crate) header_offset: usize,
    pub(crate) data_offset: Option<usize>,
}

impl TensorHeader {
    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn ne(&self) -> [usize; MAX_DIMS] {
        self.ne
    }

    pub fn nb(&self) -> [usize; MAX_DIMS] {
        self.nb
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn src(&self) -> &[TensorId] {
        &self.src
    }

    /// Root tensor whose memory this view aliases.
    pub fn view_src(&self) -> Option<TensorId> {
        self.view_src
    }

    pub fn view_offs(&self) -> usize {
        self.view_offs
    }

    pub fn is_view(&self) -> bool {
        self.view_src.is_some()
    }

    pub fn is_param(&self) -> bool {
        self.is_param
    }

    pub fn is_leaf(&self) -> bool {
        self.op == Op::None && !self.is_param
    }

    /// The header's own binding; views usually have none and resolve through
    /// [`crate::Context::data`].
    pub fn data(&self) -> Option<&TensorData> {
        self.data.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn perf(&self) -> PerfCounters {
        self.perf
    }

    /// Offset of the header slot inside the context arena.
    pub fn header_offset(&self) -> usize {
        self.header_offset
    }

    /// Offset of the data inside the context arena, when the context allocated it.
    pub fn data_offset(&self) -> Option<usize> {
        self.data_offset
    }

    pub fn n_dims(&self) -> usize {
        self.ne
            .iter()
            .rposition(|&n| n > 1)
            .map_or(1, |last| last + 1)
    }

    pub fn nelements(&self) -> usize {
        // Checked when the header was created.
        layout::nelements(&self.ne).unwrap_or(usize::MAX)
    }

    pub fn nrows(&self) -> usize {
        self.ne[1] * self.ne[2] * self.ne[3]
    }

    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// Byte size rounded up to the tensor alignment.
    pub fn padded_nbytes(&self) -> usize {
        layout::checked_align_up(self.nbytes, TENSOR_ALIGNMENT).unwrap_or(usize::MAX)
    }

    pub fn is_contiguous(&self) -> bool {
        layout::contiguous_strides(self.dtype, &self.ne).is_some_and(|nb| nb == self.nb)
    }

    pub fn same_shape(&self, other: &TensorHeader) -> bool {
        self.ne == other.ne
    }

    /// Name if set, otherwise the handle.
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            self.id.to_string()
        } else {
            self.name.clone()
        }
    }
}

pub(crate) fn truncate_name(name: &str) -> String {
    if name.len() < MAX_NAME {
        return name.to_string();
    }
    let mut end = MAX_NAME - 1;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
