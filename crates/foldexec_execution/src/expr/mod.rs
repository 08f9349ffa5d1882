//! Physical expressions evaluated against input rows.
//!
//! The aggregate operator only needs the evaluation seam: projection of
//! aggregate arguments, filter and HAVING quals, and grouping-key access.

pub mod column_expr;
pub mod comparison_expr;
pub mod literal_expr;

use std::fmt::Debug;
use std::sync::Arc;

use foldexec_datum::datum::Datum;
use foldexec_datum::row::Row;
use foldexec_error::Result;

pub use column_expr::PhysicalColumnExpr;
pub use comparison_expr::{ComparisonOp, PhysicalComparisonExpr};
pub use literal_expr::PhysicalLiteralExpr;

/// A fully planned expression ready for evaluation.
pub trait PhysicalExpr: Debug + Send + Sync {
    fn eval(&self, row: &Row) -> Result<Datum>;

    /// Stable identity string.
    ///
    /// Two expressions with equal fingerprints evaluate identically on every
    /// row; state-sharing decisions key off this. Expressions that cannot
    /// guarantee that must return a unique fingerprint.
    fn fingerprint(&self) -> String;

    /// Whether repeated evaluation on the same row may produce different
    /// results. Volatile expressions disqualify an aggregate call from state
    /// sharing.
    fn is_volatile(&self) -> bool {
        false
    }

    /// Whether an aggregate call is nested somewhere inside this expression.
    fn contains_aggregate(&self) -> bool {
        false
    }
}

pub type PhysicalExprRef = Arc<dyn PhysicalExpr>;

/// Evaluate a filter qual: null and false both reject the row.
pub fn evaluate_filter(expr: &dyn PhysicalExpr, row: &Row) -> Result<bool> {
    Ok(expr.eval(row)?.try_as_bool().unwrap_or(false))
}

/// Fingerprint for an optional expression; used in call-site identity keys.
pub fn fingerprint_opt(expr: &Option<PhysicalExprRef>) -> String {
    match expr {
        Some(expr) => expr.fingerprint(),
        None => "none".to_string(),
    }
}

/// Marker for an aggregate call appearing where only scalar expressions are
/// allowed. Materializing one during setup is the nested-aggregate error.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalAggregateRefExpr;

impl PhysicalExpr for PhysicalAggregateRefExpr {
    fn eval(&self, _row: &Row) -> Result<Datum> {
        Err(foldexec_error::FoldexecError::new(
            "aggregate function calls cannot be nested",
        ))
    }

    fn fingerprint(&self) -> String {
        "aggref".to_string()
    }

    fn contains_aggregate(&self) -> bool {
        true
    }
}
