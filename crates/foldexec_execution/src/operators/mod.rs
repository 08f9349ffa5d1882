//! Execution operators.
//!
//! Operators follow a cooperative pull contract: each call returns one row or
//! end-of-input. Suspension points are only at pull boundaries; nothing
//! blocks inside a per-tuple hot path.

pub mod aggregate;
pub mod values;

use std::fmt::Debug;

use foldexec_datum::datatype::Schema;
use foldexec_datum::row::Row;
use foldexec_error::Result;

pub use values::ValuesSource;

/// Supplier of input tuples to an operator.
pub trait TupleSource: Debug + Send {
    fn schema(&self) -> &Schema;

    /// Produce the next tuple, or None once exhausted.
    fn next_tuple(&mut self) -> Result<Option<Row>>;

    /// Restart the stream from the beginning with unchanged parameters.
    fn rescan(&mut self) -> Result<()>;
}
