//! Op builders. Each call validates operand shapes and records a result
//! tensor in the arena; nothing is computed until a backend runs the graph.

use crate::context::{Context, ContextError};
use crate::layout::{self, MAX_DIMS};
use crate::tensor::{DType, Op, TensorHeader, TensorId, UnaryOp};

fn can_repeat(src: &TensorHeader, dst: &TensorHeader) -> bool {
    (0..MAX_DIMS).all(|i| dst.ne[i] % src.ne[i] == 0)
}

fn view_mismatch(lhs: [usize; MAX_DIMS], rhs: [usize; MAX_DIMS]) -> ContextError {
    ContextError::ShapeMismatch { op: "VIEW", lhs, rhs }
}

impl Context {
    fn shape_of(&self, id: TensorId) -> Result<(DType, [usize; MAX_DIMS]), ContextError> {
        let header = self.tensor(id)?;
        Ok((header.dtype, header.ne))
    }

    fn map_op(&mut self, a: TensorId, op: Op) -> Result<TensorId, ContextError> {
        let (dtype, ne) = self.shape_of(a)?;
        self.new_tensor_impl(dtype, ne, op, &[a])
    }

    /// Elementwise op; `b` is broadcast over `a` by repetition.
    fn binary_op(
        &mut self,
        a: TensorId,
        b: TensorId,
        op: Op,
    ) -> Result<TensorId, ContextError> {
        let lhs = self.tensor(a)?;
        let rhs = self.tensor(b)?;
        if !can_repeat(rhs, lhs) {
            return Err(ContextError::ShapeMismatch {
                op: op.name(),
                lhs: lhs.ne,
                rhs: rhs.ne,
            });
        }
        let (dtype, ne) = (lhs.dtype, lhs.ne);
        self.new_tensor_impl(dtype, ne, op, &[a, b])
    }

    pub fn add(&mut self, a: TensorId, b: TensorId) -> Result<TensorId, ContextError> {
        self.binary_op(a, b, Op::Add)
    }

    pub fn sub(&mut self, a: TensorId, b: TensorId) -> Result<TensorId, ContextError> {
        self.binary_op(a, b, Op::Sub)
    }

    pub fn mul(&mut self, a: TensorId, b: TensorId) -> Result<TensorId, ContextError> {
        self.binary_op(a, b, Op::Mul)
    }

    pub fn div(&mut self, a: TensorId, b: TensorId) -> Result<TensorId, ContextError> {
        self.binary_op(a, b, Op::Div)
    }

    pub fn sqr(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        self.map_op(a, Op::Sqr)
    }

    pub fn sqrt(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        self.map_op(a, Op::Sqrt)
    }

    pub fn log(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        self.map_op(a, Op::Log)
    }

    pub fn scale(&mut self, a: TensorId, factor: f32) -> Result<TensorId, ContextError> {
        self.map_op(a, Op::Scale { factor })
    }

    pub fn clamp(&mut self, a: TensorId, min: f32, max: f32) -> Result<TensorId, ContextError> {
        self.map_op(a, Op::Clamp { min, max })
    }

    pub fn unary(&mut self, a: TensorId, op: UnaryOp) -> Result<TensorId, ContextError> {
        self.map_op(a, Op::Unary(op))
    }

    pub fn abs(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        self.unary(a, UnaryOp::Abs)
    }

    pub fn neg(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        self.unary(a, UnaryOp::Neg)
    }

    pub fn step(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        self.unary(a, UnaryOp::Step)
    }

    pub fn tanh(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        self.unary(a, UnaryOp::Tanh)
    }

    pub fn relu(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        self.unary(a, UnaryOp::Relu)
    }

    pub fn gelu(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        self.unary(a, UnaryOp::Gelu)
    }

    pub fn silu(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        self.unary(a, UnaryOp::Silu)
    }

    /// Sum of all elements, as a scalar.
    pub fn sum(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        let (dtype, _) = self.shape_of(a)?;
        self.new_tensor_impl(dtype, [1; MAX_DIMS], Op::Sum, &[a])
    }

    /// Mean of each row.
    pub fn mean(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        let (_, ne) = self.shape_of(a)?;
        self.new_tensor_impl(DType::F32, [1, ne[1], ne[2], ne[3]], Op::Mean, &[a])
    }

    /// Row normalisation to zero mean and unit variance.
    pub fn norm(&mut self, a: TensorId, eps: f32) -> Result<TensorId, ContextError> {
        let (_, ne) = self.shape_of(a)?;
        self.new_tensor_impl(DType::F32, ne, Op::Norm { eps }, &[a])
    }

    pub fn rms_norm(&mut self, a: TensorId, eps: f32) -> Result<TensorId, ContextError> {
        let (_, ne) = self.shape_of(a)?;
        self.new_tensor_impl(DType::F32, ne, Op::RmsNorm { eps }, &[a])
    }

    /// Softmax over each row.
    pub fn soft_max(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        let (_, ne) = self.shape_of(a)?;
        self.new_tensor_impl(DType::F32, ne, Op::SoftMax, &[a])
    }

    /// `a` is `[K, N, ..]`, `b` is `[K, M, ..]`; the result is `[N, M, ..]`
    /// with `a` broadcast over the outer dimensions of `b`.
    pub fn mul_mat(&mut self, a: TensorId, b: TensorId) -> Result<TensorId, ContextError> {
        let lhs = self.tensor(a)?;
        let rhs = self.tensor(b)?;
        let (an, bn) = (lhs.ne, rhs.ne);
        if an[0] != bn[0] || bn[2] % an[2] != 0 || bn[3] % an[3] != 0 {
            return Err(ContextError::ShapeMismatch {
                op: "MUL_MAT",
                lhs: an,
                rhs: bn,
            });
        }
        self.new_tensor_impl(DType::F32, [an[1], bn[1], bn[2], bn[3]], Op::MulMat, &[a, b])
    }

    /// Contiguous copy with the same type and shape.
    pub fn dup(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        self.map_op(a, Op::Dup)
    }

    /// Contiguous copy of a possibly strided tensor.
    pub fn cont(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        self.map_op(a, Op::Cont)
    }

    /// Copies `a` into `b`, converting the element type. The result aliases `b`.
    pub fn cpy(&mut self, a: TensorId, b: TensorId) -> Result<TensorId, ContextError> {
        let src = self.tensor(a)?;
        let dst = self.tensor(b)?;
        if src.nelements() != dst.nelements() {
            return Err(ContextError::ShapeMismatch {
                op: "CPY",
                lhs: src.ne,
                rhs: dst.ne,
            });
        }
        let (ne, nb) = (dst.ne, dst.nb);
        self.new_view_impl(b, ne, nb, 0, Op::Cpy, &[a, b])
    }

    pub fn reshape_1d(&mut self, a: TensorId, ne0: usize) -> Result<TensorId, ContextError> {
        self.reshape(a, [ne0, 1, 1, 1])
    }

    pub fn reshape_2d(&mut self, a: TensorId, ne0: usize, ne1: usize) -> Result<TensorId, ContextError> {
        self.reshape(a, [ne0, ne1, 1, 1])
    }

    pub fn reshape_3d(
        &mut self,
        a: TensorId,
        ne0: usize,
        ne1: usize,
        ne2: usize,
    ) -> Result<TensorId, ContextError> {
        self.reshape(a, [ne0, ne1, ne2, 1])
    }

    pub fn reshape_4d(
        &mut self,
        a: TensorId,
        ne0: usize,
        ne1: usize,
        ne2: usize,
        ne3: usize,
    ) -> Result<TensorId, ContextError> {
        self.reshape(a, [ne0, ne1, ne2, ne3])
    }

    fn reshape(&mut self, a: TensorId, ne: [usize; MAX_DIMS]) -> Result<TensorId, ContextError> {
        let src = self.tensor(a)?;
        if !src.is_contiguous() {
            return Err(ContextError::NotContiguous {
                op: "RESHAPE",
                tensor: src.label(),
            });
        }
        let mismatch = ContextError::ShapeMismatch {
            op: "RESHAPE",
            lhs: src.ne,
            rhs: ne,
        };
        if layout::nelements(&ne) != Some(src.nelements()) || ne[0] % src.dtype.block_size() != 0 {
            return Err(mismatch);
        }
        let Some(nb) = layout::contiguous_strides(src.dtype, &ne) else {
            return Err(mismatch);
        };
        self.new_view_impl(a, ne, nb, 0, Op::Reshape, &[a])
    }

    pub fn view_1d(&mut self, a: TensorId, ne0: usize, offset: usize) -> Result<TensorId, ContextError> {
        let (dtype, src_ne) = self.shape_of(a)?;
        let ne = [ne0, 1, 1, 1];
        let nb = layout::contiguous_strides(dtype, &ne).ok_or_else(|| view_mismatch(src_ne, ne))?;
        self.view(a, ne, nb, offset)
    }

    pub fn view_2d(
        &mut self,
        a: TensorId,
        ne0: usize,
        ne1: usize,
        nb1: usize,
        offset: usize,
    ) -> Result<TensorId, ContextError> {
        let (dtype, src_ne) = self.shape_of(a)?;
        let ne = [ne0, ne1, 1, 1];
        let nb2 = nb1.checked_mul(ne1).ok_or_else(|| view_mismatch(src_ne, ne))?;
        self.view(a, ne, [dtype.type_size(), nb1, nb2, nb2], offset)
    }

    pub fn view_3d(
        &mut self,
        a: TensorId,
        ne: [usize; 3],
        nb1: usize,
        nb2: usize,
        offset: usize,
    ) -> Result<TensorId, ContextError> {
        let (dtype, src_ne) = self.shape_of(a)?;
        let ne = [ne[0], ne[1], ne[2], 1];
        let nb3 = nb2.checked_mul(ne[2]).ok_or_else(|| view_mismatch(src_ne, ne))?;
        self.view(a, ne, [dtype.type_size(), nb1, nb2, nb3], offset)
    }

    pub fn view_4d(
        &mut self,
        a: TensorId,
        ne: [usize; MAX_DIMS],
        nb1: usize,
        nb2: usize,
        nb3: usize,
        offset: usize,
    ) -> Result<TensorId, ContextError> {
        let (dtype, _) = self.shape_of(a)?;
        self.view(a, ne, [dtype.type_size(), nb1, nb2, nb3], offset)
    }

    fn view(
        &mut self,
        a: TensorId,
        ne: [usize; MAX_DIMS],
        nb: [usize; MAX_DIMS],
        offset: usize,
    ) -> Result<TensorId, ContextError> {
        let src = self.tensor(a)?;
        if ne.iter().any(|&n| n == 0) {
            return Err(ContextError::InvalidShape {
                dims: ne.to_vec(),
                reason: "every dimension must be at least 1".into(),
            });
        }
        let end = layout::span_bytes(src.dtype, &ne, &nb).and_then(|span| offset.checked_add(span));
        if end.map_or(true, |end| end > src.nbytes()) {
            return Err(view_mismatch(src.ne, ne));
        }
        self.new_view_impl(a, ne, nb, offset, Op::View { offset }, &[a])
    }

    /// Swaps the first two dimensions without moving data.
    pub fn transpose(&mut self, a: TensorId) -> Result<TensorId, ContextError> {
        let src = self.tensor(a)?;
        let (mut ne, mut nb) = (src.ne, src.nb);
        ne.swap(0, 1);
        nb.swap(0, 1);
        self.new_view_impl(a, ne, nb, 0, Op::Transpose, &[a])
    }
}
