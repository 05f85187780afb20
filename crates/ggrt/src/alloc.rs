//! Two-phase arena planning.
//!
//! A [`MeasuringPlanner`] walks a graph and records how large a buffer it
//! needs without binding anything. An [`ArenaPlanner`] then walks the same
//! graph and binds each tensor at increasing aligned offsets of a real buffer.
//! Neither reuses memory across tensor lifetimes.

use std::sync::Arc;

use thiserror::Error;

use crate::backend::{Backend, BackendBuffer, BackendError, BufferHandle, BufferType, BufferUsage};
use crate::context::{Context, ContextError};
use crate::graph::Graph;
use crate::layout;
use crate::tensor::{TensorData, TensorHeader, TensorId};

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("allocation exhausted: tensor {tensor} needs {needed} bytes at offset {offset}, buffer holds {size}")]
    Exhausted {
        tensor: String,
        needed: usize,
        offset: usize,
        size: usize,
    },
    #[error("planner alignment must be a power of two, got {alignment}")]
    InvalidAlignment { alignment: usize },
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub trait Planner {
    fn is_measure(&self) -> bool;

    fn alignment(&self) -> usize;

    /// Reserves space for one tensor. Views take no space.
    fn alloc(&mut self, ctx: &mut Context, tensor: TensorId) -> Result<(), AllocError>;

    /// Allocates every node, then every leaf, in stored order. Returns
    /// [`Planner::alloc_size`] afterwards.
    fn alloc_graph(&mut self, ctx: &mut Context, graph: &Graph) -> Result<usize, AllocError> {
        for &node in graph.nodes() {
            self.alloc(ctx, node)?;
        }
        for &leaf in graph.leafs() {
            self.alloc(ctx, leaf)?;
        }
        let size = self.alloc_size();
        tracing::debug!(
            measure = self.is_measure(),
            nodes = graph.n_nodes(),
            leafs = graph.n_leafs(),
            size,
            "planned graph"
        );
        Ok(size)
    }

    /// Rewinds to offset zero. Bindings already made are left in place.
    fn reset(&mut self);

    fn alloc_size(&self) -> usize;
}

/// Per-tensor size rule: the buffer type's, else the byte size padded to
/// the planner alignment.
#[derive(Clone)]
struct SizePolicy {
    alignment: usize,
    buffer_type: Option<Arc<dyn BufferType>>,
}

impl SizePolicy {
    fn size_of(&self, tensor: &TensorHeader) -> usize {
        match &self.buffer_type {
            Some(buffer_type) => buffer_type.alloc_size(tensor),
            None => layout::checked_align_up(tensor.nbytes(), self.alignment).unwrap_or(usize::MAX),
        }
    }
}

fn check_alignment(alignment: usize) -> Result<usize, AllocError> {
    if alignment.is_power_of_two() {
        Ok(alignment)
    } else {
        Err(AllocError::InvalidAlignment { alignment })
    }
}

pub struct MeasuringPlanner {
    policy: SizePolicy,
    offset: usize,
    watermark: usize,
}

impl MeasuringPlanner {
    /// Fails with [`AllocError::InvalidAlignment`] unless `alignment` is a
    /// power of two.
    pub fn new(alignment: usize) -> Result<Self, AllocError> {
        Ok(Self {
            policy: SizePolicy {
                alignment: check_alignment(alignment)?,
                buffer_type: None,
            },
            offset: 0,
            watermark: 0,
        })
    }

    pub fn for_buffer_type(buffer_type: Arc<dyn BufferType>) -> Result<Self, AllocError> {
        Ok(Self {
            policy: SizePolicy {
                alignment: check_alignment(buffer_type.alignment())?,
                buffer_type: Some(buffer_type),
            },
            offset: 0,
            watermark: 0,
        })
    }

    pub fn for_backend(backend: &dyn Backend) -> Result<Self, AllocError> {
        Self::for_buffer_type(backend.default_buffer_type())
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }
}

impl Planner for MeasuringPlanner {
    fn is_measure(&self) -> bool {
        true
    }

    fn alignment(&self) -> usize {
        self.policy.alignment
    }

    fn alloc(&mut self, ctx: &mut Context, tensor: TensorId) -> Result<(), AllocError> {
        let header = ctx.tensor(tensor)?;
        if header.is_view() {
            return Ok(());
        }
        let size = self.policy.size_of(header);
        // Saturates so an impossible plan still fails when the buffer is made.
        self.offset = layout::checked_align_up(self.offset, self.policy.alignment)
            .map_or(usize::MAX, |offset| offset.saturating_add(size));
        self.watermark = self.watermark.max(self.offset);
        Ok(())
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.watermark = 0;
    }

    fn alloc_size(&self) -> usize {
        self.watermark
    }
}

/// Binds tensors into one backend buffer.
pub struct ArenaPlanner {
    policy: SizePolicy,
    buffer: BufferHandle,
    owned: bool,
    offset: usize,
}

impl ArenaPlanner {
    /// Plans into a caller-owned buffer.
    pub fn from_buffer(buffer: BufferHandle) -> Result<Self, AllocError> {
        Ok(Self {
            policy: SizePolicy {
                alignment: check_alignment(buffer.alignment())?,
                buffer_type: None,
            },
            buffer,
            owned: false,
            offset: 0,
        })
    }

    /// Allocates a buffer of `size` bytes owned and freed by the planner.
    pub fn from_buffer_type(buffer_type: Arc<dyn BufferType>, size: usize) -> Result<Self, AllocError> {
        let alignment = check_alignment(buffer_type.alignment())?;
        let max = buffer_type.max_size();
        if size > max {
            return Err(BackendError::TooLarge {
                backend: buffer_type.name().to_string(),
                requested: size,
                max,
            }
            .into());
        }
        let buffer = buffer_type.alloc_buffer(size)?;
        buffer.set_usage(BufferUsage::Compute);
        tracing::debug!(
            buffer_type = buffer_type.name(),
            buffer = %buffer.id(),
            size,
            "allocated planner buffer"
        );
        Ok(Self {
            policy: SizePolicy {
                alignment,
                buffer_type: Some(buffer_type),
            },
            buffer,
            owned: true,
            offset: 0,
        })
    }

    pub fn from_backend(backend: &dyn Backend, size: usize) -> Result<Self, AllocError> {
        Self::from_buffer_type(backend.default_buffer_type(), size)
    }

    pub fn buffer(&self) -> &BufferHandle {
        &self.buffer
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Frees the buffer when owned; a caller-owned buffer is left alone.
    pub fn free(self) {}
}

impl Planner for ArenaPlanner {
    fn is_measure(&self) -> bool {
        false
    }

    fn alignment(&self) -> usize {
        self.policy.alignment
    }

    fn alloc(&mut self, ctx: &mut Context, tensor: TensorId) -> Result<(), AllocError> {
        let header = ctx.tensor(tensor)?;
        if header.is_view() {
            return Ok(());
        }
        let needed = self.policy.size_of(header);
        let offset = layout::checked_align_up(self.offset, self.policy.alignment).unwrap_or(usize::MAX);
        let size = self.buffer.size();
        if offset.checked_add(needed).map_or(true, |end| end > size) {
            let label = header.label();
            ctx.bind(tensor, None)?;
            tracing::warn!(tensor = %label, needed, offset, size, "planner buffer exhausted");
            return Err(AllocError::Exhausted {
                tensor: label,
                needed,
                offset,
                size,
            });
        }
        ctx.bind(
            tensor,
            Some(TensorData {
                buffer: self.buffer.clone(),
                offset,
            }),
        )?;
        self.offset = offset + needed;
        Ok(())
    }

    fn reset(&mut self) {
        self.offset = 0;
    }

    fn alloc_size(&self) -> usize {
        self.offset
    }
}

impl Drop for ArenaPlanner {
    fn drop(&mut self) {
        if self.owned {
            self.buffer.free();
        }
    }
}
