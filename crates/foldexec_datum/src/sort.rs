use std::cmp::Ordering;

use foldexec_error::{FoldexecError, Result};

use crate::datum::{cmp_datums, Datum};
use crate::row::Row;

/// Ordering for a single column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortColumn {
    /// Column index into the row being sorted.
    pub column: usize,
    pub desc: bool,
    pub nulls_first: bool,
}

impl SortColumn {
    pub const fn asc(column: usize) -> Self {
        SortColumn {
            column,
            desc: false,
            nulls_first: false,
        }
    }
}

/// Sort specification for an external sort: column order plus the number of
/// leading columns that participate in duplicate elimination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub columns: Vec<SortColumn>,
    /// 0, or equal to `columns.len()`.
    pub num_distinct: usize,
}

impl SortSpec {
    pub fn new(columns: Vec<SortColumn>) -> Self {
        SortSpec {
            columns,
            num_distinct: 0,
        }
    }

    pub fn new_distinct(columns: Vec<SortColumn>) -> Self {
        let num_distinct = columns.len();
        SortSpec {
            columns,
            num_distinct,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_distinct != 0 && self.num_distinct != self.columns.len() {
            return Err(FoldexecError::new(format!(
                "distinct prefix must cover no columns or all sort columns, got {} of {}",
                self.num_distinct,
                self.columns.len()
            )));
        }
        Ok(())
    }

    /// Compare two rows under this specification.
    pub fn compare_rows(&self, a: &Row, b: &Row) -> Ordering {
        for col in &self.columns {
            let left = a.columns.get(col.column).unwrap_or(&Datum::Null);
            let right = b.columns.get(col.column).unwrap_or(&Datum::Null);
            match compare_with(col, left, right) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

/// Compare two datums under a single column's ordering.
pub fn compare_with(col: &SortColumn, a: &Datum, b: &Datum) -> Ordering {
    let ord = match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => {
            return if col.nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, true) => {
            return if col.nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, false) => cmp_datums(a, b),
    };
    if col.desc {
        ord.reverse()
    } else {
        ord
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(vals: impl IntoIterator<Item = i64>) -> Row {
        Row::from_iter(vals.into_iter().map(Datum::Int64))
    }

    #[test]
    fn multi_column_compare() {
        let spec = SortSpec::new(vec![SortColumn::asc(0), SortColumn::asc(1)]);
        assert_eq!(
            Ordering::Less,
            spec.compare_rows(&row([1, 2]), &row([1, 3]))
        );
        assert_eq!(
            Ordering::Greater,
            spec.compare_rows(&row([2, 0]), &row([1, 9]))
        );
    }

    #[test]
    fn nulls_last_by_default() {
        let spec = SortSpec::new(vec![SortColumn::asc(0)]);
        let null_row = Row::from_iter([Datum::Null]);
        assert_eq!(
            Ordering::Less,
            spec.compare_rows(&row([5]), &null_row)
        );
    }

    #[test]
    fn desc_does_not_flip_null_placement() {
        let col = SortColumn {
            column: 0,
            desc: true,
            nulls_first: false,
        };
        assert_eq!(
            Ordering::Greater,
            compare_with(&col, &Datum::Null, &Datum::Int64(1))
        );
        assert_eq!(
            Ordering::Less,
            compare_with(&col, &Datum::Int64(2), &Datum::Int64(1))
        );
    }

    #[test]
    fn distinct_prefix_validation() {
        let mut spec = SortSpec::new_distinct(vec![SortColumn::asc(0), SortColumn::asc(1)]);
        assert!(spec.validate().is_ok());
        spec.num_distinct = 1;
        assert!(spec.validate().is_err());
    }
}
