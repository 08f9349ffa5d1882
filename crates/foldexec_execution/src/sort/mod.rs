//! External sorts consumed as black boxes by the aggregate operator.
//!
//! Two shapes: a tuple sorter for multi-column input and a datum sorter for
//! the single-input fast path, which also carries an abbreviated key so the
//! duplicate check can usually skip the full comparison. Both follow a
//! put / perform_sort / get protocol; getting before sorting is an error.

use foldexec_datum::datum::{abbreviated_key, Datum};
use foldexec_datum::row::Row;
use foldexec_datum::sort::{compare_with, SortColumn, SortSpec};
use foldexec_error::{FoldexecError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortState {
    Accumulating,
    Sorted,
}

/// Sorts whole rows under a sort specification.
#[derive(Debug)]
pub struct TupleSorter {
    spec: SortSpec,
    rows: Vec<Row>,
    state: SortState,
    read_idx: usize,
}

impl TupleSorter {
    pub fn new(spec: SortSpec) -> Self {
        TupleSorter {
            spec,
            rows: Vec::new(),
            state: SortState::Accumulating,
            read_idx: 0,
        }
    }

    pub fn put_tuple(&mut self, row: Row) -> Result<()> {
        if self.state != SortState::Accumulating {
            return Err(FoldexecError::new("sort already performed"));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn num_tuples(&self) -> usize {
        self.rows.len()
    }

    pub fn perform_sort(&mut self) -> Result<()> {
        if self.state != SortState::Accumulating {
            return Err(FoldexecError::new("sort already performed"));
        }
        let spec = self.spec.clone();
        self.rows.sort_by(|a, b| spec.compare_rows(a, b));
        self.state = SortState::Sorted;
        Ok(())
    }

    pub fn get_tuple(&mut self) -> Result<Option<Row>> {
        if self.state != SortState::Sorted {
            return Err(FoldexecError::new("sort not yet performed"));
        }
        if self.read_idx >= self.rows.len() {
            return Ok(None);
        }
        let row = std::mem::take(&mut self.rows[self.read_idx]);
        self.read_idx += 1;
        Ok(Some(row))
    }
}

/// One sorted value from a datum sorter.
#[derive(Debug, Clone, PartialEq)]
pub struct SortedDatum {
    pub value: Datum,
    pub abbrev: u64,
    pub is_null: bool,
}

/// Sorts single datums under one sort column.
#[derive(Debug)]
pub struct DatumSorter {
    column: SortColumn,
    entries: Vec<SortedDatum>,
    state: SortState,
    read_idx: usize,
}

impl DatumSorter {
    pub fn new(column: SortColumn) -> Self {
        DatumSorter {
            column,
            entries: Vec::new(),
            state: SortState::Accumulating,
            read_idx: 0,
        }
    }

    pub fn put_datum(&mut self, value: Datum) -> Result<()> {
        if self.state != SortState::Accumulating {
            return Err(FoldexecError::new("sort already performed"));
        }
        let is_null = value.is_null();
        let abbrev = abbreviated_key(&value);
        self.entries.push(SortedDatum {
            value,
            abbrev,
            is_null,
        });
        Ok(())
    }

    pub fn num_tuples(&self) -> usize {
        self.entries.len()
    }

    pub fn perform_sort(&mut self) -> Result<()> {
        if self.state != SortState::Accumulating {
            return Err(FoldexecError::new("sort already performed"));
        }
        let column = self.column;
        self.entries.sort_by(|a, b| {
            // Unequal abbreviated keys are conclusive for ascending non-null
            // values of one type; everything else takes the full comparison.
            if !a.is_null && !b.is_null && !column.desc && a.abbrev != b.abbrev {
                return a.abbrev.cmp(&b.abbrev);
            }
            compare_with(&column, &a.value, &b.value)
        });
        self.state = SortState::Sorted;
        Ok(())
    }

    pub fn get_datum(&mut self) -> Result<Option<SortedDatum>> {
        if self.state != SortState::Sorted {
            return Err(FoldexecError::new("sort not yet performed"));
        }
        if self.read_idx >= self.entries.len() {
            return Ok(None);
        }
        let entry = std::mem::replace(
            &mut self.entries[self.read_idx],
            SortedDatum {
                value: Datum::Null,
                abbrev: 0,
                is_null: true,
            },
        );
        self.read_idx += 1;
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_sorter_orders_rows() {
        let spec = SortSpec::new(vec![SortColumn::asc(0), SortColumn::asc(1)]);
        let mut sorter = TupleSorter::new(spec);
        sorter
            .put_tuple(Row::from_iter([Datum::Int64(2), Datum::Int64(1)]))
            .unwrap();
        sorter
            .put_tuple(Row::from_iter([Datum::Int64(1), Datum::Int64(9)]))
            .unwrap();
        sorter
            .put_tuple(Row::from_iter([Datum::Int64(1), Datum::Int64(3)]))
            .unwrap();

        sorter.perform_sort().unwrap();

        let mut firsts = Vec::new();
        while let Some(row) = sorter.get_tuple().unwrap() {
            firsts.push((
                row.columns[0].try_as_i64().unwrap(),
                row.columns[1].try_as_i64().unwrap(),
            ));
        }
        assert_eq!(vec![(1, 3), (1, 9), (2, 1)], firsts);
    }

    #[test]
    fn get_before_sort_is_an_error() {
        let mut sorter = TupleSorter::new(SortSpec::new(vec![SortColumn::asc(0)]));
        assert!(sorter.get_tuple().is_err());
    }

    #[test]
    fn datum_sorter_handles_duplicates_and_nulls() {
        let mut sorter = DatumSorter::new(SortColumn::asc(0));
        for v in [Datum::Int64(3), Datum::Null, Datum::Int64(1), Datum::Int64(3)] {
            sorter.put_datum(v).unwrap();
        }
        sorter.perform_sort().unwrap();

        let mut out = Vec::new();
        while let Some(entry) = sorter.get_datum().unwrap() {
            out.push(entry.value);
        }
        // Nulls sort last by default.
        assert_eq!(
            vec![Datum::Int64(1), Datum::Int64(3), Datum::Int64(3), Datum::Null],
            out
        );
    }

    #[test]
    fn datum_sorter_desc() {
        let mut sorter = DatumSorter::new(SortColumn {
            column: 0,
            desc: true,
            nulls_first: false,
        });
        for v in [Datum::Int64(1), Datum::Int64(5), Datum::Int64(3)] {
            sorter.put_datum(v).unwrap();
        }
        sorter.perform_sort().unwrap();

        let mut out = Vec::new();
        while let Some(entry) = sorter.get_datum().unwrap() {
            out.push(entry.value.try_as_i64().unwrap());
        }
        assert_eq!(vec![5, 3, 1], out);
    }
}
