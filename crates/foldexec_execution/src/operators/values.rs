use foldexec_datum::datatype::Schema;
use foldexec_datum::row::Row;
use foldexec_error::Result;

use super::TupleSource;

/// Tuple source over a fixed set of rows.
#[derive(Debug)]
pub struct ValuesSource {
    schema: Schema,
    rows: Vec<Row>,
    idx: usize,
}

impl ValuesSource {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        ValuesSource {
            schema,
            rows,
            idx: 0,
        }
    }
}

impl TupleSource for ValuesSource {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn next_tuple(&mut self) -> Result<Option<Row>> {
        if self.idx >= self.rows.len() {
            return Ok(None);
        }
        let row = self.rows[self.idx].clone();
        self.idx += 1;
        Ok(Some(row))
    }

    fn rescan(&mut self) -> Result<()> {
        self.idx = 0;
        Ok(())
    }
}
