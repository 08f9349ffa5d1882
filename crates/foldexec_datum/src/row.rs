use crate::datum::Datum;

/// Representation of a single row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub columns: Vec<Datum>,
}

impl Row {
    pub const fn empty() -> Self {
        Row {
            columns: Vec::new(),
        }
    }

    pub fn new(columns: Vec<Datum>) -> Self {
        Row { columns }
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, idx: usize) -> Option<&Datum> {
        self.columns.get(idx)
    }

    /// Produce a new row containing only the columns at `indices`, in order.
    ///
    /// Indices out of range become null. Used for key projections where a
    /// grouping column is absent from the current set.
    pub fn project(&self, indices: &[usize]) -> Row {
        Row {
            columns: indices
                .iter()
                .map(|&idx| self.columns.get(idx).cloned().unwrap_or(Datum::Null))
                .collect(),
        }
    }
}

impl FromIterator<Datum> for Row {
    fn from_iter<T: IntoIterator<Item = Datum>>(iter: T) -> Self {
        Row {
            columns: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_fills_missing_with_null() {
        let row = Row::from_iter([Datum::Int64(1), Datum::Int64(2)]);
        let projected = row.project(&[1, 5]);
        assert_eq!(
            Row::from_iter([Datum::Int64(2), Datum::Null]),
            projected
        );
    }
}
