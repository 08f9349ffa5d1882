//! Producing the output value of one aggregate for one completed group.

use foldexec_datum::datum::Datum;
use foldexec_datum::row::Row;
use foldexec_error::{FoldexecError, Result};

use crate::functions::AggCallContext;
use crate::memory::MemoryArena;

use super::state::{PerAgg, PerGroup, PerTrans};

/// Finalize one aggregate for one group.
///
/// In skip-final mode the transition value itself is emitted, serialized
/// when the transition carries a serialize function. Otherwise the final
/// function (when present) runs over the read-only transition value and any
/// direct arguments.
pub fn finalize_aggregate(
    peragg: &mut PerAgg,
    pertrans: &mut PerTrans,
    pergroup: &PerGroup,
    rep_row: &Row,
    set_arena: &MemoryArena,
    tmp_arena: &MemoryArena,
    skip_final: bool,
) -> Result<Datum> {
    if skip_final {
        return finalize_partial(pertrans, pergroup, set_arena, tmp_arena);
    }

    let frame = &mut peragg.final_frame;
    frame.clear();
    frame.set_context(AggCallContext {
        set_arena: set_arena.clone(),
        tmp_arena: tmp_arena.clone(),
        aggref: Some(peragg.aggref.clone()),
    });

    // The transition value is handed over read-only: a shared transition
    // state may be finalized again by another aggregate.
    frame.set_arg(
        0,
        pergroup.trans_value.clone_agg_value(),
        pergroup.trans_value_is_null,
    );
    for (idx, expr) in peragg.direct_args.iter().enumerate() {
        frame.set_arg_datum(1 + idx, expr.eval(rep_row)?);
    }
    // Positions past the direct arguments stay null.

    let final_fn = match peragg.final_fn {
        Some(final_fn) => final_fn,
        None => {
            if pergroup.trans_value_is_null {
                return Ok(Datum::Null);
            }
            return pergroup.trans_value.clone_agg_value().into_datum();
        }
    };

    if peragg.final_fn_strict {
        let any_null = (0..peragg.num_final_args).any(|idx| frame.arg_is_null(idx));
        if any_null {
            return Ok(Datum::Null);
        }
    }

    final_fn(frame)?;
    let (value, is_null) = frame.take_result()?;
    if is_null {
        return Ok(Datum::Null);
    }
    value.into_datum()
}

/// Emit the transition value itself, for plans that feed a combine stage.
fn finalize_partial(
    pertrans: &mut PerTrans,
    pergroup: &PerGroup,
    set_arena: &MemoryArena,
    tmp_arena: &MemoryArena,
) -> Result<Datum> {
    let serial_fn = match pertrans.serial_fn {
        Some(serial_fn) => serial_fn,
        None => {
            if pergroup.trans_value_is_null {
                return Ok(Datum::Null);
            }
            return pergroup.trans_value.clone_agg_value().into_datum();
        }
    };

    if pergroup.trans_value_is_null && pertrans.serial_fn_strict {
        return Ok(Datum::Null);
    }

    let frame = &mut pertrans.serial_frame;
    frame.clear();
    frame.set_context(AggCallContext {
        set_arena: set_arena.clone(),
        tmp_arena: tmp_arena.clone(),
        aggref: Some(pertrans.aggref.clone()),
    });
    frame.set_arg(
        0,
        pergroup.trans_value.clone_agg_value(),
        pergroup.trans_value_is_null,
    );
    serial_fn(frame)?;

    let (value, is_null) = frame.take_result()?;
    if is_null {
        return Ok(Datum::Null);
    }
    value.into_datum()
}

/// Emit one serialized (or raw) transition value for spilling; the caller
/// provides the destination buffer via the returned datum.
pub fn serialize_trans_value(
    pertrans: &mut PerTrans,
    pergroup: &PerGroup,
    set_arena: &MemoryArena,
    tmp_arena: &MemoryArena,
) -> Result<Datum> {
    finalize_partial(pertrans, pergroup, set_arena, tmp_arena)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::expr::{PhysicalColumnExpr, PhysicalLiteralExpr};
    use crate::functions::aggregate::{AccessPolicy, BUILTIN_AGGREGATES};
    use crate::operators::aggregate::plan::{AggCallExpr, AggPlan, OutputColumn};
    use crate::operators::aggregate::state::{build_aggregates, BuiltAggregates};
    use crate::operators::aggregate::transition::advance_transition;
    use foldexec_datum::sort::SortColumn;

    fn build(call: AggCallExpr) -> BuiltAggregates {
        let plan = AggPlan::plain(vec![call], vec![OutputColumn::AggregateResult(0)]);
        build_aggregates(&plan, &BUILTIN_AGGREGATES, &AccessPolicy::allow_all(), 1).unwrap()
    }

    #[test]
    fn avg_finalizes_through_final_fn() {
        let mut built = build(AggCallExpr::new(
            "avg_f64",
            vec![Arc::new(PhysicalColumnExpr::new(0))],
        ));
        let set_arena = MemoryArena::new_root("set");
        let tmp_arena = MemoryArena::new_root("tmp");

        let pt = &mut built.pertrans[0];
        let mut group = pt.initial_pergroup(&set_arena);
        for v in [1.0, 2.0, 6.0] {
            advance_transition(pt, &mut group, &set_arena, &tmp_arena, &[Datum::Float64(v)])
                .unwrap();
        }

        let out = finalize_aggregate(
            &mut built.peraggs[0],
            &mut built.pertrans[0],
            &group,
            &Row::empty(),
            &set_arena,
            &tmp_arena,
            false,
        )
        .unwrap();
        assert_eq!(Datum::Float64(3.0), out);
    }

    #[test]
    fn sum_without_final_fn_emits_state() {
        let mut built = build(AggCallExpr::new(
            "sum_i64",
            vec![Arc::new(PhysicalColumnExpr::new(0))],
        ));
        let set_arena = MemoryArena::new_root("set");
        let tmp_arena = MemoryArena::new_root("tmp");

        let pt = &mut built.pertrans[0];
        let mut group = pt.initial_pergroup(&set_arena);
        advance_transition(pt, &mut group, &set_arena, &tmp_arena, &[Datum::Int64(4)]).unwrap();

        let out = finalize_aggregate(
            &mut built.peraggs[0],
            &mut built.pertrans[0],
            &group,
            &Row::empty(),
            &set_arena,
            &tmp_arena,
            false,
        )
        .unwrap();
        assert_eq!(Datum::Int64(4), out);
    }

    #[test]
    fn skip_final_serializes_internal_state() {
        let mut built = build(AggCallExpr::new(
            "avg_f64",
            vec![Arc::new(PhysicalColumnExpr::new(0))],
        ));
        let set_arena = MemoryArena::new_root("set");
        let tmp_arena = MemoryArena::new_root("tmp");

        let pt = &mut built.pertrans[0];
        let mut group = pt.initial_pergroup(&set_arena);
        advance_transition(pt, &mut group, &set_arena, &tmp_arena, &[Datum::Float64(2.5)])
            .unwrap();

        let out = finalize_aggregate(
            &mut built.peraggs[0],
            &mut built.pertrans[0],
            &group,
            &Row::empty(),
            &set_arena,
            &tmp_arena,
            true,
        )
        .unwrap();
        match out {
            Datum::Binary(bytes) => assert_eq!(16, bytes.len()),
            other => panic!("expected serialized state, got {other}"),
        }
    }

    #[test]
    fn ordered_set_final_reads_direct_argument() {
        let mut built = build(
            AggCallExpr::new(
                "percentile_disc",
                vec![Arc::new(PhysicalColumnExpr::new(0))],
            )
            .with_direct_args(vec![Arc::new(PhysicalLiteralExpr::new(Datum::Float64(
                0.5,
            )))])
            .with_order_by(vec![SortColumn::asc(0)]),
        );
        let set_arena = MemoryArena::new_root("set");
        let tmp_arena = MemoryArena::new_root("tmp");

        let pt = &mut built.pertrans[0];
        let mut group = pt.initial_pergroup(&set_arena);
        // Values arrive in sort order through the deferred-sort replay.
        for v in [10, 20, 30] {
            advance_transition(pt, &mut group, &set_arena, &tmp_arena, &[Datum::Int64(v)])
                .unwrap();
        }

        let out = finalize_aggregate(
            &mut built.peraggs[0],
            &mut built.pertrans[0],
            &group,
            &Row::empty(),
            &set_arena,
            &tmp_arena,
            false,
        )
        .unwrap();
        assert_eq!(Datum::Int64(20), out);
    }
}
