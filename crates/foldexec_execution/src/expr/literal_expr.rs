use foldexec_datum::datum::Datum;
use foldexec_datum::row::Row;
use foldexec_error::Result;

use super::PhysicalExpr;

/// A constant value.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalLiteralExpr {
    pub literal: Datum,
}

impl PhysicalLiteralExpr {
    pub fn new(literal: Datum) -> Self {
        PhysicalLiteralExpr { literal }
    }
}

impl PhysicalExpr for PhysicalLiteralExpr {
    fn eval(&self, _row: &Row) -> Result<Datum> {
        Ok(self.literal.clone())
    }

    fn fingerprint(&self) -> String {
        format!("literal({})", self.literal)
    }
}
