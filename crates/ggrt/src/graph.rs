//! Forward computation graphs.
//!
//! A graph is an append-only topological listing of tensors from one context:
//! `leafs` hold supplied data, `nodes` hold computed results in an order where
//! every operand precedes its consumers.

use std::collections::HashSet;

use thiserror::Error;

use crate::context::{Context, ContextError};
use crate::env;
use crate::tensor::TensorId;

pub const DEFAULT_GRAPH_SIZE: usize = 2048;

/// Which operand a depth-first expansion visits first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalOrder {
    #[default]
    LeftToRight,
    RightToLeft,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph is full: capacity {capacity}")]
    Full { capacity: usize },
    #[error("node range {start}..{end} is outside a graph of {len} nodes")]
    RangeOutOfBounds { start: usize, end: usize, len: usize },
    #[error(transparent)]
    Context(#[from] ContextError),
}

#[derive(Debug, Clone)]
pub struct Graph {
    capacity: usize,
    nodes: Vec<TensorId>,
    leafs: Vec<TensorId>,
    visited: HashSet<TensorId>,
    order: EvalOrder,
}

impl Graph {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            nodes: Vec::new(),
            leafs: Vec::new(),
            visited: HashSet::new(),
            order: EvalOrder::default(),
        }
    }

    /// Graph sized from `GGRT_GRAPH_SIZE`, or [`DEFAULT_GRAPH_SIZE`].
    pub fn with_default_size() -> Self {
        Self::new(env::default_graph_size())
    }

    pub fn with_order(mut self, order: EvalOrder) -> Self {
        self.order = order;
        self
    }

    pub fn build_forward(ctx: &Context, root: TensorId) -> Result<Self, GraphError> {
        let mut graph = Self::with_default_size();
        graph.build_forward_expand(ctx, root)?;
        Ok(graph)
    }

    /// Adds `root` and every operand not already in the graph. On error the
    /// graph is left as it was before the call.
    pub fn build_forward_expand(&mut self, ctx: &Context, root: TensorId) -> Result<(), GraphError> {
        let (n_nodes, n_leafs) = (self.nodes.len(), self.leafs.len());
        let mut inserted = Vec::new();
        if let Err(err) = self.expand(ctx, root, &mut inserted) {
            self.nodes.truncate(n_nodes);
            self.leafs.truncate(n_leafs);
            for id in &inserted {
                self.visited.remove(id);
            }
            return Err(err);
        }
        tracing::trace!(
            root = %root,
            added = self.nodes.len() - n_nodes,
            nodes = self.nodes.len(),
            leafs = self.leafs.len(),
            "expanded graph"
        );
        Ok(())
    }

    fn expand(
        &mut self,
        ctx: &Context,
        root: TensorId,
        inserted: &mut Vec<TensorId>,
    ) -> Result<(), GraphError> {
        // (tensor, operands already pushed)
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                self.append(ctx, id)?;
                continue;
            }
            if !self.visited.insert(id) {
                continue;
            }
            inserted.push(id);
            let header = ctx.tensor(id)?;
            stack.push((id, true));
            // The stack pops in reverse, so push the first-visited operand last.
            match self.order {
                EvalOrder::LeftToRight => {
                    stack.extend(header.src().iter().rev().map(|&src| (src, false)))
                }
                EvalOrder::RightToLeft => {
                    stack.extend(header.src().iter().map(|&src| (src, false)))
                }
            }
        }
        Ok(())
    }

    fn append(&mut self, ctx: &Context, id: TensorId) -> Result<(), GraphError> {
        let list = if ctx.tensor(id)?.is_leaf() {
            &mut self.leafs
        } else {
            &mut self.nodes
        };
        if list.len() >= self.capacity {
            return Err(GraphError::Full {
                capacity: self.capacity,
            });
        }
        list.push(id);
        Ok(())
    }

    pub fn nodes(&self) -> &[TensorId] {
        &self.nodes
    }

    pub fn leafs(&self) -> &[TensorId] {
        &self.leafs
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_leafs(&self) -> usize {
        self.leafs.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn order(&self) -> EvalOrder {
        self.order
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.visited.contains(&id)
    }

    /// The last node added, usually the root of the final expansion.
    pub fn output(&self) -> Option<TensorId> {
        self.nodes.last().copied()
    }

    pub fn dup(&self) -> Self {
        self.clone()
    }

    /// Nodes `start..end` as a standalone graph without leafs.
    pub fn view(&self, start: usize, end: usize) -> Result<Self, GraphError> {
        if start > end || end > self.nodes.len() {
            return Err(GraphError::RangeOutOfBounds {
                start,
                end,
                len: self.nodes.len(),
            });
        }
        let nodes = self.nodes[start..end].to_vec();
        Ok(Self {
            capacity: nodes.len(),
            visited: nodes.iter().copied().collect(),
            nodes,
            leafs: Vec::new(),
            order: self.order,
        })
    }

    /// Replaces `dst`'s contents with this graph's; `dst` keeps its capacity.
    pub fn copy_into(&self, dst: &mut Graph) -> Result<(), GraphError> {
        if self.nodes.len() > dst.capacity || self.leafs.len() > dst.capacity {
            return Err(GraphError::Full {
                capacity: dst.capacity,
            });
        }
        dst.nodes.clone_from(&self.nodes);
        dst.leafs.clone_from(&self.leafs);
        dst.visited.clone_from(&self.visited);
        dst.order = self.order;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.leafs.clear();
        self.visited.clear();
    }
}
