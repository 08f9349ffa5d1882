//! Group-boundary processing of DISTINCT/ORDER BY transitions.
//!
//! Input rows for these transitions were routed into an external sort
//! instead of being aggregated directly. At the group boundary the sort is
//! performed, duplicates are dropped when requested, and each surviving
//! entry is replayed through the ordinary transition path.
//!
//! Duplicate checks compare values without consulting any collation; for
//! collated text types this can merge values a collation-aware comparison
//! would keep apart.

use std::cmp::Ordering;

use foldexec_datum::datum::cmp_datums;
use foldexec_datum::row::Row;
use foldexec_error::{FoldexecError, Result};

use crate::memory::MemoryArena;

use super::state::{PerGroup, PerTrans, PerTransSorter};
use super::transition::advance_transition;

/// Run the deferred sort for one (transition, grouping set) pair and replay
/// it into the transition state.
pub fn process_ordered(
    pertrans: &mut PerTrans,
    setno: usize,
    pergroup: &mut PerGroup,
    set_arena: &MemoryArena,
    tmp_arena: &MemoryArena,
) -> Result<()> {
    // Rows may never have been routed here (all filtered, or all suppressed
    // by strictness); finalize then sees an untouched initial state.
    let sorter = match pertrans.sorters[setno].take() {
        Some(sorter) => sorter,
        None => return Ok(()),
    };

    match sorter {
        PerTransSorter::Single(sorter) => {
            process_ordered_single(pertrans, sorter, pergroup, set_arena, tmp_arena)
        }
        PerTransSorter::Multi(sorter) => {
            process_ordered_multi(pertrans, sorter, pergroup, set_arena, tmp_arena)
        }
    }
}

fn process_ordered_single(
    pertrans: &mut PerTrans,
    mut sorter: crate::sort::DatumSorter,
    pergroup: &mut PerGroup,
    set_arena: &MemoryArena,
    tmp_arena: &MemoryArena,
) -> Result<()> {
    sorter.perform_sort()?;

    let distinct = pertrans.num_distinct() == 1;
    let mut prev: Option<crate::sort::SortedDatum> = None;

    while let Some(entry) = sorter.get_datum()? {
        if distinct {
            if let Some(prev) = &prev {
                // The abbreviated key rules out equality cheaply; the full
                // comparison runs only on abbreviated ties.
                let equal = prev.is_null == entry.is_null
                    && (entry.is_null
                        || (prev.abbrev == entry.abbrev
                            && cmp_datums(&prev.value, &entry.value) == Ordering::Equal));
                if equal {
                    continue;
                }
            }
        }

        advance_transition(
            pertrans,
            pergroup,
            set_arena,
            tmp_arena,
            std::slice::from_ref(&entry.value),
        )?;
        prev = Some(entry);
    }

    Ok(())
}

fn process_ordered_multi(
    pertrans: &mut PerTrans,
    mut sorter: crate::sort::TupleSorter,
    pergroup: &mut PerGroup,
    set_arena: &MemoryArena,
    tmp_arena: &MemoryArena,
) -> Result<()> {
    sorter.perform_sort()?;

    let num_trans_inputs = pertrans.num_trans_inputs;
    let distinct = pertrans.num_distinct() > 0;
    let mut prev: Option<Row> = None;

    while let Some(row) = sorter.get_tuple()? {
        if row.num_columns() < num_trans_inputs {
            return Err(FoldexecError::new(
                "sorted tuple narrower than the transition input list",
            ));
        }

        if distinct {
            if let Some(prev) = &prev {
                let equal = (0..num_trans_inputs).all(|idx| {
                    cmp_datums(&prev.columns[idx], &row.columns[idx]) == Ordering::Equal
                });
                if equal {
                    continue;
                }
            }
        }

        advance_transition(
            pertrans,
            pergroup,
            set_arena,
            tmp_arena,
            &row.columns[..num_trans_inputs],
        )?;

        // Hold the just-accepted row as the next comparison point, then
        // clear per-row scratch.
        prev = Some(row);
        tmp_arena.reset();
    }

    Ok(())
}
