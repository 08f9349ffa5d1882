//! The per-tuple hot path.
//!
//! One combined projection evaluation per input tuple, then one dispatch per
//! transition descriptor: regular transition, combine transition, or a push
//! into the deferred DISTINCT/ORDER BY sort.

use foldexec_datum::datum::Datum;
use foldexec_datum::row::Row;
use foldexec_error::{FoldexecError, Result};

use crate::expr::{evaluate_filter, PhysicalExprRef};
use crate::functions::{AggCallContext, AggValue};
use crate::memory::MemoryArena;
use crate::sort::{DatumSorter, TupleSorter};

use super::state::{PerGroup, PerTrans, PerTransSorter, TransValue};

/// Evaluate the combined argument projection into `out`, exactly once per
/// input tuple.
pub fn eval_combined_input(
    exprs: &[PhysicalExprRef],
    row: &Row,
    out: &mut Vec<Datum>,
) -> Result<()> {
    out.clear();
    out.reserve(exprs.len());
    for expr in exprs {
        out.push(expr.eval(row)?);
    }
    Ok(())
}

/// Evaluate a transition's FILTER clause; null and false both skip.
pub fn filter_passes(pertrans: &PerTrans, row: &Row) -> Result<bool> {
    match &pertrans.filter {
        Some(filter) => evaluate_filter(filter.as_ref(), row),
        None => Ok(true),
    }
}

/// Advance one (group, transition) pair with the given argument datums.
pub fn advance_transition(
    pertrans: &mut PerTrans,
    pergroup: &mut PerGroup,
    set_arena: &MemoryArena,
    tmp_arena: &MemoryArena,
    args: &[Datum],
) -> Result<()> {
    if pertrans.trans_fn_strict {
        if args[..pertrans.num_trans_inputs].iter().any(|d| d.is_null()) {
            return Ok(());
        }
        if pergroup.no_trans_value {
            // First non-null input becomes the transition value without
            // invoking the transition function. Valid because setup verified
            // the input is usable as the transition type.
            pergroup.trans_value = TransValue::adopt(
                AggValue::Datum(args[0].clone()),
                pertrans.trans_type_by_val,
                set_arena.scope(),
            );
            pergroup.trans_value_is_null = false;
            pergroup.no_trans_value = false;
            return Ok(());
        }
        if pergroup.trans_value_is_null {
            // A strict transition function returned null earlier; the group
            // stays null no matter what arrives.
            return Ok(());
        }
    }

    let frame = &mut pertrans.trans_frame;
    frame.clear();
    frame.set_context(AggCallContext {
        set_arena: set_arena.clone(),
        tmp_arena: tmp_arena.clone(),
        aggref: Some(pertrans.aggref.clone()),
    });
    frame.set_arg(
        0,
        pergroup.trans_value.take_agg_value(),
        pergroup.trans_value_is_null,
    );
    for (idx, arg) in args[..pertrans.num_trans_inputs].iter().enumerate() {
        frame.set_arg_datum(1 + idx, arg.clone());
    }

    (pertrans.trans_fn)(frame)?;
    let (value, is_null) = frame.take_result()?;

    store_result(pergroup, value, is_null, pertrans.trans_type_by_val, set_arena);
    pergroup.no_trans_value = false;
    Ok(())
}

/// Advance one (group, transition) pair in combine mode.
///
/// The incoming value is a partial transition state produced elsewhere; when
/// a deserialize function exists it is applied first, unless the input is
/// null and the deserialize function is strict, in which case the null passes
/// through untouched. Set `deserialize` to false when the caller already
/// holds a deserialized state (spill reload does).
pub fn advance_combine(
    pertrans: &mut PerTrans,
    pergroup: &mut PerGroup,
    set_arena: &MemoryArena,
    tmp_arena: &MemoryArena,
    incoming: AggValue,
    incoming_is_null: bool,
    deserialize: bool,
) -> Result<()> {
    let (incoming, incoming_is_null) = if deserialize {
        deserialize_incoming(pertrans, set_arena, tmp_arena, incoming, incoming_is_null)?
    } else {
        (incoming, incoming_is_null)
    };

    if pertrans.combine_fn_strict {
        if incoming_is_null {
            return Ok(());
        }
        if pergroup.trans_value_is_null && !pergroup.no_trans_value {
            return Ok(());
        }
    }

    // First incoming state initializes the group outright; the combine
    // function only runs from the second input on. This initialization is
    // mandatory in every path, including spill reloads.
    if pergroup.no_trans_value && !incoming_is_null {
        pergroup.trans_value = TransValue::adopt(
            incoming,
            pertrans.trans_type_by_val,
            set_arena.scope(),
        );
        pergroup.trans_value_is_null = false;
        pergroup.no_trans_value = false;
        return Ok(());
    }

    let combine_fn = pertrans.combine_fn.ok_or_else(|| {
        FoldexecError::new("combine transition invoked without a combine function")
    })?;

    let frame = &mut pertrans.combine_frame;
    frame.clear();
    frame.set_context(AggCallContext {
        set_arena: set_arena.clone(),
        tmp_arena: tmp_arena.clone(),
        aggref: Some(pertrans.aggref.clone()),
    });
    frame.set_arg(
        0,
        pergroup.trans_value.take_agg_value(),
        pergroup.trans_value_is_null,
    );
    frame.set_arg(1, incoming, incoming_is_null);

    combine_fn(frame)?;
    let (value, is_null) = frame.take_result()?;

    store_result(pergroup, value, is_null, pertrans.trans_type_by_val, set_arena);
    pergroup.no_trans_value = false;
    Ok(())
}

pub(crate) fn deserialize_incoming(
    pertrans: &mut PerTrans,
    set_arena: &MemoryArena,
    tmp_arena: &MemoryArena,
    incoming: AggValue,
    incoming_is_null: bool,
) -> Result<(AggValue, bool)> {
    let deserial_fn = match pertrans.deserial_fn {
        Some(f) => f,
        None => return Ok((incoming, incoming_is_null)),
    };
    if incoming_is_null && pertrans.deserial_fn_strict {
        return Ok((incoming, true));
    }

    let frame = &mut pertrans.deserial_frame;
    frame.clear();
    frame.set_context(AggCallContext {
        set_arena: set_arena.clone(),
        tmp_arena: tmp_arena.clone(),
        aggref: Some(pertrans.aggref.clone()),
    });
    frame.set_arg(0, incoming, incoming_is_null);
    deserial_fn(frame)?;
    frame.take_result()
}

/// Store a transition function's result back into the group state.
///
/// Ownership moved through the call frame, so adopting the result needs no
/// copy and the prior value has already been released where it was consumed.
fn store_result(
    pergroup: &mut PerGroup,
    value: AggValue,
    is_null: bool,
    by_val: bool,
    set_arena: &MemoryArena,
) {
    if is_null {
        pergroup.trans_value = TransValue::Empty;
        pergroup.trans_value_is_null = true;
        return;
    }
    pergroup.trans_value = TransValue::adopt(value, by_val, set_arena.scope());
    pergroup.trans_value_is_null = false;
}

/// Route one input tuple's arguments into the deferred sort for a
/// DISTINCT/ORDER BY transition, for one grouping set.
///
/// A strict transition function would ignore rows whose transition inputs
/// contain a null, so those rows are not worth sorting at all.
pub fn push_sort_input(pertrans: &mut PerTrans, setno: usize, args: &[Datum]) -> Result<()> {
    if pertrans.trans_fn_strict
        && args[..pertrans.num_trans_inputs].iter().any(|d| d.is_null())
    {
        return Ok(());
    }

    if pertrans.sorters[setno].is_none() {
        let spec = pertrans.sort_spec.clone().ok_or_else(|| {
            FoldexecError::new("sort push on a transition without a sort spec")
        })?;
        let sorter = if pertrans.num_args == 1 {
            PerTransSorter::Single(DatumSorter::new(spec.columns[0]))
        } else {
            PerTransSorter::Multi(TupleSorter::new(spec))
        };
        pertrans.sorters[setno] = Some(sorter);
    }

    match &mut pertrans.sorters[setno] {
        Some(PerTransSorter::Single(sorter)) => sorter.put_datum(args[0].clone()),
        Some(PerTransSorter::Multi(sorter)) => {
            sorter.put_tuple(Row::new(args[..pertrans.num_args].to_vec()))
        }
        None => Err(FoldexecError::new("sorter initialization failed")),
    }
}
