use foldexec_datum::datum::Datum;
use foldexec_datum::row::Row;
use foldexec_error::{FoldexecError, Result};

use super::PhysicalExpr;

/// Reference to a column in the input row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalColumnExpr {
    pub column: usize,
}

impl PhysicalColumnExpr {
    pub const fn new(column: usize) -> Self {
        PhysicalColumnExpr { column }
    }
}

impl PhysicalExpr for PhysicalColumnExpr {
    fn eval(&self, row: &Row) -> Result<Datum> {
        row.column(self.column).cloned().ok_or_else(|| {
            FoldexecError::new(format!(
                "column index {} out of range for row with {} columns",
                self.column,
                row.num_columns()
            ))
        })
    }

    fn fingerprint(&self) -> String {
        format!("column({})", self.column)
    }
}
