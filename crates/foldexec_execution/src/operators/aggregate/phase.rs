//! Phase sequencing and grouping-set boundary detection.
//!
//! Phase 0 is reserved for hashed grouping sets and runs last (only reached
//! in mixed plans after every sorted phase). Sorted phases run 1..P in plan
//! order; the first consumes the child's ordering, each later one consumes a
//! re-sort of the same input.

use foldexec_datum::datum::group_eq;
use foldexec_datum::row::Row;
use foldexec_datum::sort::SortSpec;
use foldexec_error::{FoldexecError, Result};

/// One sorted phase's execution shape.
#[derive(Debug, Clone)]
pub struct PerPhase {
    /// Input column indices in this phase's sort order.
    pub group_cols: Vec<usize>,

    /// Grouping-set prefix lengths over `group_cols`, most specific first.
    pub set_prefixes: Vec<usize>,

    /// Sort needed to produce this phase's input. None for the first phase.
    pub input_sort: Option<SortSpec>,
}

impl PerPhase {
    /// Widest prefix any of this phase's grouping sets uses.
    pub fn max_prefix(&self) -> usize {
        self.set_prefixes.first().copied().unwrap_or(0)
    }

    /// Position of the first grouping column where two rows differ, or None
    /// when all compared columns match. Only the widest prefix participates.
    pub fn first_changed_col(&self, prev: &Row, current: &Row) -> Option<usize> {
        for (pos, &col) in self.group_cols[..self.max_prefix()].iter().enumerate() {
            let a = prev.column(col);
            let b = current.column(col);
            let equal = match (a, b) {
                (Some(a), Some(b)) => group_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if !equal {
                return Some(pos);
            }
        }
        None
    }
}

/// How many grouping sets must be finalized and reset for a change at the
/// given column position. Sets are counted from the most specific; a set is
/// affected exactly when its prefix covers the changed column.
pub fn sets_to_finalize(set_prefixes: &[usize], changed_at: usize) -> usize {
    set_prefixes
        .iter()
        .take_while(|&&prefix| prefix > changed_at)
        .count()
}

/// Drives the phase sequence: sorted phases in order, then the hash phase
/// when hashed grouping sets exist.
#[derive(Debug)]
pub struct PhaseScheduler {
    phases: Vec<PerPhase>,
    has_hash_phase: bool,
    /// 1-based index into `phases`; one past the end means the hash phase.
    current: usize,
}

impl PhaseScheduler {
    pub fn new(phases: Vec<PerPhase>, has_hash_phase: bool) -> Result<Self> {
        if phases.is_empty() && !has_hash_phase {
            return Err(FoldexecError::new("aggregation requires at least one phase"));
        }
        let current = if phases.is_empty() { 0 } else { 1 };
        Ok(PhaseScheduler {
            phases,
            has_hash_phase,
            current,
        })
    }

    pub fn num_sorted_phases(&self) -> usize {
        self.phases.len()
    }

    /// Largest grouping-set count any sorted phase carries.
    pub fn max_sets(&self) -> usize {
        self.phases
            .iter()
            .map(|p| p.set_prefixes.len())
            .max()
            .unwrap_or(0)
    }

    pub fn in_hash_phase(&self) -> bool {
        self.current == 0 || self.current > self.phases.len()
    }

    pub fn current_sorted(&self) -> Option<&PerPhase> {
        if self.in_hash_phase() {
            return None;
        }
        self.phases.get(self.current - 1)
    }

    /// Sorted phase by zero-based position.
    pub fn sorted_phase(&self, idx: usize) -> Option<&PerPhase> {
        self.phases.get(idx)
    }

    pub fn current_index(&self) -> usize {
        if self.in_hash_phase() {
            0
        } else {
            self.current
        }
    }

    /// Whether another sorted phase follows the current one.
    pub fn has_next_sorted(&self) -> bool {
        !self.in_hash_phase() && self.current < self.phases.len()
    }

    /// Advance to the next phase. Returns false once every phase (including
    /// the hash phase, when present) is done.
    pub fn advance(&mut self) -> bool {
        if self.current == 0 {
            // Hash phase was current; nothing follows.
            return false;
        }
        if self.current < self.phases.len() {
            self.current += 1;
            return true;
        }
        if self.current == self.phases.len() && self.has_hash_phase {
            self.current = 0;
            return true;
        }
        self.current = self.phases.len() + 1;
        false
    }

    pub fn restart(&mut self) {
        self.current = if self.phases.is_empty() { 0 } else { 1 };
    }
}

#[cfg(test)]
mod tests {
    use foldexec_datum::datum::Datum;

    use super::*;

    fn rollup_phase() -> PerPhase {
        // Grouping sets ((a,b,c), (a,b), (a), ()) over columns 0,1,2.
        PerPhase {
            group_cols: vec![0, 1, 2],
            set_prefixes: vec![3, 2, 1, 0],
            input_sort: None,
        }
    }

    fn row(vals: [i64; 4]) -> Row {
        Row::from_iter(vals.into_iter().map(Datum::Int64))
    }

    #[test]
    fn change_in_last_column_resets_only_most_specific() {
        let phase = rollup_phase();
        let changed = phase
            .first_changed_col(&row([1, 1, 1, 10]), &row([1, 1, 2, 20]))
            .unwrap();
        assert_eq!(2, changed);
        assert_eq!(1, sets_to_finalize(&phase.set_prefixes, changed));
    }

    #[test]
    fn change_in_middle_column_resets_covering_sets() {
        let phase = rollup_phase();
        let changed = phase
            .first_changed_col(&row([1, 1, 2, 20]), &row([1, 2, 1, 30]))
            .unwrap();
        assert_eq!(1, changed);
        assert_eq!(2, sets_to_finalize(&phase.set_prefixes, changed));
    }

    #[test]
    fn change_in_first_column_resets_all_but_grand_total() {
        let phase = rollup_phase();
        let changed = phase
            .first_changed_col(&row([1, 2, 1, 30]), &row([2, 1, 1, 40]))
            .unwrap();
        assert_eq!(0, changed);
        assert_eq!(3, sets_to_finalize(&phase.set_prefixes, changed));
    }

    #[test]
    fn equal_rows_cross_no_boundary() {
        let phase = rollup_phase();
        assert_eq!(
            None,
            phase.first_changed_col(&row([1, 1, 1, 10]), &row([1, 1, 1, 99]))
        );
    }

    #[test]
    fn null_group_values_compare_equal() {
        let phase = rollup_phase();
        let a = Row::from_iter([Datum::Null, Datum::Int64(1), Datum::Int64(1)]);
        let b = Row::from_iter([Datum::Null, Datum::Int64(1), Datum::Int64(1)]);
        assert_eq!(None, phase.first_changed_col(&a, &b));
    }

    #[test]
    fn scheduler_walks_sorted_then_hash() {
        let mut scheduler =
            PhaseScheduler::new(vec![rollup_phase(), rollup_phase()], true).unwrap();
        assert_eq!(1, scheduler.current_index());
        assert!(scheduler.has_next_sorted());

        assert!(scheduler.advance());
        assert_eq!(2, scheduler.current_index());
        assert!(!scheduler.has_next_sorted());

        assert!(scheduler.advance());
        assert!(scheduler.in_hash_phase());

        assert!(!scheduler.advance());
    }

    #[test]
    fn hash_only_scheduler_starts_in_hash_phase() {
        let scheduler = PhaseScheduler::new(Vec::new(), true).unwrap();
        assert!(scheduler.in_hash_phase());
    }
}
