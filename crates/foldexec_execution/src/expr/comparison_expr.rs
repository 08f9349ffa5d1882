use std::cmp::Ordering;
use std::fmt;

use foldexec_datum::datum::{cmp_datums, Datum};
use foldexec_datum::row::Row;
use foldexec_error::Result;

use super::{PhysicalExpr, PhysicalExprRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonOp::Eq => write!(f, "="),
            ComparisonOp::NotEq => write!(f, "<>"),
            ComparisonOp::Lt => write!(f, "<"),
            ComparisonOp::LtEq => write!(f, "<="),
            ComparisonOp::Gt => write!(f, ">"),
            ComparisonOp::GtEq => write!(f, ">="),
        }
    }
}

/// Comparison between two expressions. Null on either side yields null.
#[derive(Debug)]
pub struct PhysicalComparisonExpr {
    pub op: ComparisonOp,
    pub left: PhysicalExprRef,
    pub right: PhysicalExprRef,
}

impl PhysicalComparisonExpr {
    pub fn new(op: ComparisonOp, left: PhysicalExprRef, right: PhysicalExprRef) -> Self {
        PhysicalComparisonExpr { op, left, right }
    }
}

impl PhysicalExpr for PhysicalComparisonExpr {
    fn eval(&self, row: &Row) -> Result<Datum> {
        let left = self.left.eval(row)?;
        let right = self.right.eval(row)?;
        if left.is_null() || right.is_null() {
            return Ok(Datum::Null);
        }

        let ord = cmp_datums(&left, &right);
        let result = match self.op {
            ComparisonOp::Eq => ord == Ordering::Equal,
            ComparisonOp::NotEq => ord != Ordering::Equal,
            ComparisonOp::Lt => ord == Ordering::Less,
            ComparisonOp::LtEq => ord != Ordering::Greater,
            ComparisonOp::Gt => ord == Ordering::Greater,
            ComparisonOp::GtEq => ord != Ordering::Less,
        };
        Ok(Datum::Boolean(result))
    }

    fn fingerprint(&self) -> String {
        format!(
            "cmp({} {} {})",
            self.left.fingerprint(),
            self.op,
            self.right.fingerprint()
        )
    }

    fn is_volatile(&self) -> bool {
        self.left.is_volatile() || self.right.is_volatile()
    }

    fn contains_aggregate(&self) -> bool {
        self.left.contains_aggregate() || self.right.contains_aggregate()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::expr::{PhysicalColumnExpr, PhysicalLiteralExpr};

    #[test]
    fn null_propagates() {
        let expr = PhysicalComparisonExpr::new(
            ComparisonOp::Gt,
            Arc::new(PhysicalColumnExpr::new(0)),
            Arc::new(PhysicalLiteralExpr::new(Datum::Int64(10))),
        );
        let out = expr.eval(&Row::from_iter([Datum::Null])).unwrap();
        assert_eq!(Datum::Null, out);
    }

    #[test]
    fn basic_comparison() {
        let expr = PhysicalComparisonExpr::new(
            ComparisonOp::GtEq,
            Arc::new(PhysicalColumnExpr::new(0)),
            Arc::new(PhysicalLiteralExpr::new(Datum::Int64(10))),
        );
        let out = expr.eval(&Row::from_iter([Datum::Int64(10)])).unwrap();
        assert_eq!(Datum::Boolean(true), out);
    }
}
