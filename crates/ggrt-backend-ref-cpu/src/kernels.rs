//! Stand-in f32 kernels. Operands are gathered in logical order, computed on
//! the host, and scattered back into the destination's element type.

use ggrt::{BackendError, BackendResult, Context, Op, TensorHeader, TensorId, UnaryOp};

pub(crate) fn compute_forward(ctx: &Context, node: TensorId) -> BackendResult<()> {
    let dst = ctx.tensor(node)?;
    let op = dst.op();
    let values = match op {
        // Supplied data and zero-copy views have nothing to compute.
        Op::None | Op::Reshape | Op::View { .. } | Op::Transpose => return Ok(()),
        // Conversion to the destination type happens on write.
        Op::Dup | Op::Cont | Op::Cpy => ctx.read_f32(src(dst, 0)?)?,
        Op::Add | Op::Sub | Op::Mul | Op::Div => binary(ctx, dst, op)?,
        Op::Sqr => map(ctx, dst, |x| x * x)?,
        Op::Sqrt => map(ctx, dst, f32::sqrt)?,
        Op::Log => map(ctx, dst, f32::ln)?,
        Op::Scale { factor } => map(ctx, dst, |x| x * factor)?,
        Op::Clamp { min, max } => map(ctx, dst, |x| x.clamp(min, max))?,
        Op::Unary(unary) => map(ctx, dst, unary_fn(unary))?,
        Op::Sum => vec![ctx.read_f32(src(dst, 0)?)?.iter().sum::<f32>()],
        Op::Mean => rows(ctx, dst, |row| vec![row.iter().sum::<f32>() / row.len() as f32])?,
        Op::Norm { eps } => rows(ctx, dst, |row| norm_row(row, eps))?,
        Op::RmsNorm { eps } => rows(ctx, dst, |row| rms_norm_row(row, eps))?,
        Op::SoftMax => rows(ctx, dst, soft_max_row)?,
        Op::MulMat => mul_mat(ctx, dst)?,
    };
    ctx.write_f32(node, &values)?;
    Ok(())
}

fn src(dst: &TensorHeader, index: usize) -> BackendResult<TensorId> {
    dst.src().get(index).copied().ok_or_else(|| {
        BackendError::execution(format!(
            "{} node {} is missing operand {index}",
            dst.op().name(),
            dst.label()
        ))
    })
}

fn map(ctx: &Context, dst: &TensorHeader, f: impl Fn(f32) -> f32) -> BackendResult<Vec<f32>> {
    Ok(ctx.read_f32(src(dst, 0)?)?.into_iter().map(f).collect())
}

fn unary_fn(op: UnaryOp) -> fn(f32) -> f32 {
    match op {
        UnaryOp::Abs => f32::abs,
        UnaryOp::Neg => |x| -x,
        UnaryOp::Step => |x| if x > 0.0 { 1.0 } else { 0.0 },
        UnaryOp::Tanh => f32::tanh,
        UnaryOp::Relu => |x| x.max(0.0),
        UnaryOp::Gelu => |x| 0.5 * x * (1.0 + libm::erff(x * std::f32::consts::FRAC_1_SQRT_2)),
        UnaryOp::Silu => |x| x / (1.0 + (-x).exp()),
    }
}

/// Elementwise op with the rhs repeated over the lhs shape.
fn binary(ctx: &Context, dst: &TensorHeader, op: Op) -> BackendResult<Vec<f32>> {
    let lhs = ctx.tensor(src(dst, 0)?)?;
    let rhs = ctx.tensor(src(dst, 1)?)?;
    let a = ctx.read_f32(lhs.id())?;
    let b = ctx.read_f32(rhs.id())?;
    let (an, bn) = (lhs.ne(), rhs.ne());
    let f: fn(f32, f32) -> f32 = match op {
        Op::Add => |x, y| x + y,
        Op::Sub => |x, y| x - y,
        Op::Mul => |x, y| x * y,
        _ => |x, y| x / y,
    };

    let mut out = Vec::with_capacity(a.len());
    for i3 in 0..an[3] {
        for i2 in 0..an[2] {
            for i1 in 0..an[1] {
                let row = an[0] * (i1 + an[1] * (i2 + an[2] * i3));
                let b_row =
                    bn[0] * (i1 % bn[1] + bn[1] * (i2 % bn[2] + bn[2] * (i3 % bn[3])));
                for i0 in 0..an[0] {
                    out.push(f(a[row + i0], b[b_row + i0 % bn[0]]));
                }
            }
        }
    }
    Ok(out)
}

/// Applies `f` to each row of the first operand and concatenates the results.
fn rows(
    ctx: &Context,
    dst: &TensorHeader,
    f: impl Fn(&[f32]) -> Vec<f32>,
) -> BackendResult<Vec<f32>> {
    let input = ctx.tensor(src(dst, 0)?)?;
    let values = ctx.read_f32(input.id())?;
    Ok(values.chunks(input.ne()[0]).flat_map(f).collect())
}

fn norm_row(row: &[f32], eps: f32) -> Vec<f32> {
    let n = row.len() as f32;
    let mean = row.iter().sum::<f32>() / n;
    let variance = row.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
    let scale = 1.0 / (variance + eps).sqrt();
    row.iter().map(|x| (x - mean) * scale).collect()
}

fn rms_norm_row(row: &[f32], eps: f32) -> Vec<f32> {
    let mean_sq = row.iter().map(|x| x * x).sum::<f32>() / row.len() as f32;
    let scale = 1.0 / (mean_sq + eps).sqrt();
    row.iter().map(|x| x * scale).collect()
}

fn soft_max_row(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = row.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// `a` is `[K, N, a2, a3]`, `b` is `[K, M, b2, b3]`; `dst[n, m] = a[:, n] · b[:, m]`.
fn mul_mat(ctx: &Context, dst: &TensorHeader) -> BackendResult<Vec<f32>> {
    let lhs = ctx.tensor(src(dst, 0)?)?;
    let rhs = ctx.tensor(src(dst, 1)?)?;
    let a = ctx.read_f32(lhs.id())?;
    let b = ctx.read_f32(rhs.id())?;
    let (an, bn) = (lhs.ne(), rhs.ne());
    let k = an[0];
    let (r2, r3) = (bn[2] / an[2], bn[3] / an[3]);

    let mut out = Vec::with_capacity(an[1] * bn[1] * bn[2] * bn[3]);
    for i3 in 0..bn[3] {
        for i2 in 0..bn[2] {
            let a_mat = k * an[1] * (i2 / r2 + an[2] * (i3 / r3));
            let b_mat = k * bn[1] * (i2 + bn[2] * i3);
            for m in 0..bn[1] {
                let b_col = &b[b_mat + m * k..b_mat + (m + 1) * k];
                for n in 0..an[1] {
                    let a_col = &a[a_mat + n * k..a_mat + (n + 1) * k];
                    out.push(a_col.iter().zip(b_col).map(|(x, y)| x * y).sum());
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_max_row_is_a_distribution() {
        let out = soft_max_row(&[1.0, 2.0, 3.0, 1000.0]);
        assert!((out.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(out[3] > 0.99);
    }

    #[test]
    fn norm_row_centers_and_scales() {
        let out = norm_row(&[1.0, 2.0, 3.0, 4.0], 0.0);
        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        let var: f32 = out.iter().map(|x| x * x).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-5);
    }

    #[test]
    fn unary_functions() {
        assert_eq!(unary_fn(UnaryOp::Step)(0.0), 0.0);
        assert_eq!(unary_fn(UnaryOp::Relu)(-3.0), 0.0);
        assert_eq!(unary_fn(UnaryOp::Neg)(2.0), -2.0);
        assert!((unary_fn(UnaryOp::Gelu)(1.0) - 0.841_344_7).abs() < 1e-5);
        assert!((unary_fn(UnaryOp::Silu)(0.0)).abs() < 1e-7);
    }
}
