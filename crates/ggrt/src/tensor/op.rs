//! Operation tags carried by tensor headers.
//!
//! `Op` holds the typed parameters of each operation; `OpKind` is its
//! fieldless discriminant, used for the static name and symbol tables.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Abs,
    Neg,
    Step,
    Tanh,
    Relu,
    Gelu,
    Silu,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Abs => "ABS",
            UnaryOp::Neg => "NEG",
            UnaryOp::Step => "STEP",
            UnaryOp::Tanh => "TANH",
            UnaryOp::Relu => "RELU",
            UnaryOp::Gelu => "GELU",
            UnaryOp::Silu => "SILU",
        }
    }
}

/// Operation that produces a tensor. `Op::None` marks data that is supplied
/// rather than computed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Op {
    #[default]
    None,
    Dup,
    Add,
    Sub,
    Mul,
    Div,
    Sqr,
    Sqrt,
    Log,
    Sum,
    Mean,
    Scale {
        factor: f32,
    },
    Clamp {
        min: f32,
        max: f32,
    },
    Norm {
        eps: f32,
    },
    RmsNorm {
        eps: f32,
    },
    MulMat,
    SoftMax,
    Cpy,
    Cont,
    Reshape,
    View {
        offset: usize,
    },
    Transpose,
    Unary(UnaryOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    None,
    Dup,
    Add,
    Sub,
    Mul,
    Div,
    Sqr,
    Sqrt,
    Log,
    Sum,
    Mean,
    Scale,
    Clamp,
    Norm,
    RmsNorm,
    MulMat,
    SoftMax,
    Cpy,
    Cont,
    Reshape,
    View,
    Transpose,
    Unary,
}

// Both tables are indexed by `OpKind as usize`.
static OP_NAMES: [&str; OpKind::COUNT] = [
    "NONE",
    "DUP",
    "ADD",
    "SUB",
    "MUL",
    "DIV",
    "SQR",
    "SQRT",
    "LOG",
    "SUM",
    "MEAN",
    "SCALE",
    "CLAMP",
    "NORM",
    "RMS_NORM",
    "MUL_MAT",
    "SOFT_MAX",
    "CPY",
    "CONT",
    "RESHAPE",
    "VIEW",
    "TRANSPOSE",
    "UNARY",
];

static OP_SYMBOLS: [&str; OpKind::COUNT] = [
    "none",
    "x",
    "x+y",
    "x-y",
    "x*y",
    "x/y",
    "x^2",
    "√x",
    "log(x)",
    "Σx",
    "Σx/n",
    "v*x",
    "clamp(x)",
    "norm(x)",
    "rms_norm(x)",
    "X*Y",
    "soft_max(x)",
    "x-\\>y",
    "cont(x)",
    "reshape(x)",
    "view(x)",
    "transpose(x)",
    "unary(x)",
];

impl OpKind {
    pub const COUNT: usize = 23;

    pub fn name(self) -> &'static str {
        OP_NAMES[self as usize]
    }

    pub fn symbol(self) -> &'static str {
        OP_SYMBOLS[self as usize]
    }
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::None => OpKind::None,
            Op::Dup => OpKind::Dup,
            Op::Add => OpKind::Add,
            Op::Sub => OpKind::Sub,
            Op::Mul => OpKind::Mul,
            Op::Div => OpKind::Div,
            Op::Sqr => OpKind::Sqr,
            Op::Sqrt => OpKind::Sqrt,
            Op::Log => OpKind::Log,
            Op::Sum => OpKind::Sum,
            Op::Mean => OpKind::Mean,
            Op::Scale { .. } => OpKind::Scale,
            Op::Clamp { .. } => OpKind::Clamp,
            Op::Norm { .. } => OpKind::Norm,
            Op::RmsNorm { .. } => OpKind::RmsNorm,
            Op::MulMat => OpKind::MulMat,
            Op::SoftMax => OpKind::SoftMax,
            Op::Cpy => OpKind::Cpy,
            Op::Cont => OpKind::Cont,
            Op::Reshape => OpKind::Reshape,
            Op::View { .. } => OpKind::View,
            Op::Transpose => OpKind::Transpose,
            Op::Unary(_) => OpKind::Unary,
        }
    }

    /// Display name; unary ops report the concrete function.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Unary(unary) => unary.name(),
            other => other.kind().name(),
        }
    }

    pub fn symbol(&self) -> &'static str {
        self.kind().symbol()
    }

    /// Ops whose result aliases the memory of a source instead of owning data.
    pub fn is_view(&self) -> bool {
        matches!(
            self,
            Op::Reshape | Op::View { .. } | Op::Transpose | Op::Cpy
        )
    }
}

pub fn op_name(op: &Op) -> &'static str {
    op.name()
}

pub fn op_symbol(op: &Op) -> &'static str {
    op.symbol()
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
