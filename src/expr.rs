// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::fmt::{Display, Error as FmtError, Formatter};

use crate::metric::{MetricId, MetricValue, ValueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

/// Expression a computed metric is derived from. Trees are plain owned
/// data; leaves name metrics that were registered before the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Leaf(MetricId),
    Constant(MetricValue),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn leaf(id: MetricId) -> Self {
        Expr::Leaf(id)
    }

    pub fn constant(value: impl Into<MetricValue>) -> Self {
        Expr::Constant(value.into())
    }

    pub fn unary(op: UnaryOp, child: Expr) -> Self {
        Expr::Unary(op, Box::new(child))
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary(op, Box::new(left), Box::new(right))
    }

    /// Calls `f` for every leaf, left to right.
    pub fn for_each_leaf<F: FnMut(MetricId)>(&self, f: &mut F) {
        match self {
            Expr::Leaf(id) => f(*id),
            Expr::Constant(_) => {}
            Expr::Unary(_, child) => child.for_each_leaf(f),
            Expr::Binary(_, left, right) => {
                left.for_each_leaf(f);
                right.for_each_leaf(f);
            }
        }
    }

    pub fn leaves(&self) -> Vec<MetricId> {
        let mut leaves = Vec::new();
        self.for_each_leaf(&mut |id| leaves.push(id));
        leaves
    }

    pub fn depth(&self) -> usize {
        match self {
            Expr::Leaf(_) | Expr::Constant(_) => 1,
            Expr::Unary(_, child) => 1 + child.depth(),
            Expr::Binary(_, left, right) => 1 + left.depth().max(right.depth()),
        }
    }

    /// Representation the expression produces, given the representation
    /// of each leaf.
    pub fn value_kind<F: Fn(MetricId) -> ValueKind>(&self, leaf_kind: &F) -> ValueKind {
        match self {
            Expr::Leaf(id) => leaf_kind(*id),
            Expr::Constant(v) => v.kind(),
            Expr::Unary(UnaryOp::Sqrt, _) => ValueKind::Real,
            Expr::Unary(_, child) => child.value_kind(leaf_kind),
            Expr::Binary(BinaryOp::Div, _, _) => ValueKind::Real,
            Expr::Binary(_, left, right) => {
                match (left.value_kind(leaf_kind), right.value_kind(leaf_kind)) {
                    (ValueKind::Int, ValueKind::Int) => ValueKind::Int,
                    _ => ValueKind::Real,
                }
            }
        }
    }
}

impl UnaryOp {
    pub fn apply(self, v: MetricValue) -> MetricValue {
        match (self, v) {
            (UnaryOp::Neg, MetricValue::Int(i)) => MetricValue::Int(i.wrapping_neg()),
            (UnaryOp::Neg, MetricValue::Real(r)) => MetricValue::Real(-r),
            (UnaryOp::Abs, MetricValue::Int(i)) => MetricValue::Int(i.wrapping_abs()),
            (UnaryOp::Abs, MetricValue::Real(r)) => MetricValue::Real(r.abs()),
            (UnaryOp::Sqrt, v) => MetricValue::Real(v.as_f64().sqrt()),
        }
    }
}

impl BinaryOp {
    /// Integer operands stay integral (wrapping); a real operand on either
    /// side promotes the result. Division always yields a real and maps a
    /// zero divisor to [`MetricValue::UNDEFINED`].
    pub fn apply(self, l: MetricValue, r: MetricValue) -> MetricValue {
        if let BinaryOp::Div = self {
            return if r.is_zero() {
                MetricValue::UNDEFINED
            } else {
                MetricValue::Real(l.as_f64() / r.as_f64())
            };
        }

        match (l, r) {
            (MetricValue::Int(a), MetricValue::Int(b)) => MetricValue::Int(match self {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::Min => a.min(b),
                BinaryOp::Max => a.max(b),
                BinaryOp::Div => unreachable!(),
            }),
            (l, r) => {
                let (a, b) = (l.as_f64(), r.as_f64());
                MetricValue::Real(match self {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Min => a.min(b),
                    BinaryOp::Max => a.max(b),
                    BinaryOp::Div => unreachable!(),
                })
            }
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Min => "min",
            BinaryOp::Max => "max",
        }
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter) -> Result<(), FmtError> {
        match self {
            Expr::Leaf(id) => write!(f, "{}", id),
            Expr::Constant(v) => write!(f, "{}", v),
            Expr::Unary(UnaryOp::Neg, child) => write!(f, "-{}", child),
            Expr::Unary(UnaryOp::Abs, child) => write!(f, "abs({})", child),
            Expr::Unary(UnaryOp::Sqrt, child) => write!(f, "sqrt({})", child),
            Expr::Binary(op @ (BinaryOp::Min | BinaryOp::Max), left, right) => {
                write!(f, "{}({}, {})", op.symbol(), left, right)
            }
            Expr::Binary(op, left, right) => write!(f, "({} {} {})", left, op.symbol(), right),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Expr {
        // ($0 - $1) / max($2, 1)
        Expr::binary(
            BinaryOp::Div,
            Expr::binary(BinaryOp::Sub, Expr::leaf(MetricId(0)), Expr::leaf(MetricId(1))),
            Expr::binary(BinaryOp::Max, Expr::leaf(MetricId(2)), Expr::constant(1i64)),
        )
    }

    #[test]
    fn leaves_in_order() {
        assert_eq!(sample().leaves(), vec![MetricId(0), MetricId(1), MetricId(2)]);
        assert_eq!(sample().depth(), 3);
    }

    #[test]
    fn display() {
        assert_eq!(sample().to_string(), "(($0 - $1) / max($2, 1))");
        assert_eq!(
            Expr::unary(UnaryOp::Neg, Expr::leaf(MetricId(4))).to_string(),
            "-$4"
        );
    }

    #[test]
    fn kind_inference() {
        let all_int = |_: MetricId| ValueKind::Int;
        let sum = Expr::binary(BinaryOp::Add, Expr::leaf(MetricId(0)), Expr::leaf(MetricId(1)));
        assert_eq!(sum.value_kind(&all_int), ValueKind::Int);
        assert_eq!(sample().value_kind(&all_int), ValueKind::Real);

        let second_real = |id: MetricId| {
            if id == MetricId(1) {
                ValueKind::Real
            } else {
                ValueKind::Int
            }
        };
        assert_eq!(sum.value_kind(&second_real), ValueKind::Real);
    }

    #[test]
    fn promotion() {
        let i = MetricValue::Int(7);
        let r = MetricValue::Real(0.5);
        assert_eq!(BinaryOp::Add.apply(i, i), MetricValue::Int(14));
        assert_eq!(BinaryOp::Add.apply(i, r), MetricValue::Real(7.5));
        assert_eq!(BinaryOp::Min.apply(r, i), MetricValue::Real(0.5));
        assert_eq!(BinaryOp::Div.apply(i, MetricValue::Int(2)), MetricValue::Real(3.5));
        assert_eq!(UnaryOp::Abs.apply(MetricValue::Int(-3)), MetricValue::Int(3));
        assert_eq!(UnaryOp::Sqrt.apply(MetricValue::Int(16)), MetricValue::Real(4.0));
    }

    #[test]
    fn divide_by_zero() {
        assert!(BinaryOp::Div.apply(MetricValue::Int(1), MetricValue::Int(0)).is_undefined());
        assert!(BinaryOp::Div
            .apply(MetricValue::Real(1.0), MetricValue::Real(0.0))
            .is_undefined());
        // the sentinel propagates through the rest of the expression
        let v = BinaryOp::Add.apply(MetricValue::UNDEFINED, MetricValue::Int(1));
        assert!(v.is_undefined());
    }

    #[test]
    fn integer_overflow_wraps() {
        assert_eq!(
            BinaryOp::Add.apply(MetricValue::Int(i64::MAX), MetricValue::Int(1)),
            MetricValue::Int(i64::MIN)
        );
    }
}
