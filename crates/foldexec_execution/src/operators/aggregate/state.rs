//! Working state descriptors for the aggregate operator.
//!
//! Construction walks the plan's aggregate call sites and assigns each a
//! (possibly shared) per-aggregate and per-transition descriptor. Sharing a
//! transition state across calls that differ only in their final function
//! halves the per-group work for pairs like avg(x)/sum(x).

use std::sync::Arc;

use foldexec_datum::datatype::DataType;
use foldexec_datum::datum::Datum;
use foldexec_datum::sort::{SortColumn, SortSpec};
use foldexec_error::{FoldexecError, Result};
use smallvec::SmallVec;

use crate::expr::{fingerprint_opt, PhysicalExprRef};
use crate::functions::aggregate::{AccessPolicy, AggKind, AggregateCatalog, AggregateSpec};
use crate::functions::{AggFn, AggValue, FunctionFrame, InternalState};
use crate::memory::{ArenaScope, MemoryArena};
use crate::operators::aggregate::plan::{AggCallExpr, AggCallRef, AggPlan, AggSplit};
use crate::sort::{DatumSorter, TupleSorter};

/// A transition value and the scope that owns it.
///
/// By-value datums are carried inline. By-reference datums and expanded
/// states record the arena scope they were adopted into; a matching scope is
/// what permits reuse without a copy.
#[derive(Debug)]
pub enum TransValue {
    Empty,
    ByVal(Datum),
    Owned { scope: ArenaScope, datum: Datum },
    Expanded {
        scope: ArenaScope,
        state: Box<dyn InternalState>,
    },
}

impl TransValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, TransValue::Empty)
    }

    /// Move the value out for a function call, leaving Empty behind.
    pub fn take_agg_value(&mut self) -> AggValue {
        match std::mem::replace(self, TransValue::Empty) {
            TransValue::Empty => AggValue::null(),
            TransValue::ByVal(datum) => AggValue::Datum(datum),
            TransValue::Owned { datum, .. } => AggValue::Datum(datum),
            TransValue::Expanded { state, .. } => AggValue::State(state),
        }
    }

    /// Clone the value for a read-only caller such as a final function.
    pub fn clone_agg_value(&self) -> AggValue {
        match self {
            TransValue::Empty => AggValue::null(),
            TransValue::ByVal(datum) => AggValue::Datum(datum.clone()),
            TransValue::Owned { datum, .. } => AggValue::Datum(datum.clone()),
            TransValue::Expanded { state, .. } => AggValue::State(state.clone()),
        }
    }

    /// Adopt a function result under the given scope.
    pub fn adopt(value: AggValue, by_val: bool, scope: ArenaScope) -> TransValue {
        match value {
            AggValue::Datum(datum) => {
                if by_val {
                    TransValue::ByVal(datum)
                } else {
                    TransValue::Owned { scope, datum }
                }
            }
            AggValue::State(state) => TransValue::Expanded { scope, state },
        }
    }
}

/// Working state for one (group, transition) pair.
#[derive(Debug)]
pub struct PerGroup {
    pub trans_value: TransValue,
    pub trans_value_is_null: bool,
    /// True until the first input initializes the transition value. Starts
    /// equal to `trans_value_is_null`; once a strict transition function
    /// returns null, `trans_value_is_null` sticks without reviving this.
    pub no_trans_value: bool,
}

pub type PerGroupArray = SmallVec<[PerGroup; 4]>;

/// Per-grouping-set sort handle for a DISTINCT/ORDER BY transition.
#[derive(Debug)]
pub enum PerTransSorter {
    Single(DatumSorter),
    Multi(TupleSorter),
}

/// One unique transition-state identity.
#[derive(Debug)]
pub struct PerTrans {
    /// The nominal aggregate call this descriptor was derived from.
    pub aggref: AggCallRef,

    pub trans_fn: AggFn,
    pub trans_fn_strict: bool,
    pub combine_fn: Option<AggFn>,
    pub combine_fn_strict: bool,
    pub serial_fn: Option<AggFn>,
    pub serial_fn_strict: bool,
    pub deserial_fn: Option<AggFn>,
    pub deserial_fn_strict: bool,

    pub trans_type: DataType,
    pub trans_type_by_val: bool,
    pub init_value: Option<Datum>,

    pub filter: Option<PhysicalExprRef>,

    /// Width of the evaluated argument tuple, including sort-only columns.
    pub num_args: usize,
    /// Leading arguments actually passed to the transition function.
    pub num_trans_inputs: usize,
    /// Offset of this transition's arguments in the combined projection.
    pub arg_offset: usize,

    /// Sort specification over argument positions; present only for
    /// DISTINCT/ORDER BY calls.
    pub sort_spec: Option<SortSpec>,
    /// One sorter slot per grouping set, live only during sorted phases.
    pub sorters: Vec<Option<PerTransSorter>>,

    // Pre-initialized call frames, reused across invocations.
    pub trans_frame: FunctionFrame,
    pub combine_frame: FunctionFrame,
    pub serial_frame: FunctionFrame,
    pub deserial_frame: FunctionFrame,
}

impl PerTrans {
    /// Initial per-group state for this transition.
    pub fn initial_pergroup(&self, set_arena: &MemoryArena) -> PerGroup {
        match &self.init_value {
            Some(datum) => PerGroup {
                trans_value: TransValue::adopt(
                    AggValue::Datum(datum.clone()),
                    self.trans_type_by_val,
                    set_arena.scope(),
                ),
                trans_value_is_null: false,
                no_trans_value: false,
            },
            None => PerGroup {
                trans_value: TransValue::Empty,
                trans_value_is_null: true,
                no_trans_value: true,
            },
        }
    }

    pub fn num_distinct(&self) -> usize {
        self.sort_spec.as_ref().map(|s| s.num_distinct).unwrap_or(0)
    }
}

/// One unique aggregate call identity.
#[derive(Debug)]
pub struct PerAgg {
    /// Index into the operator's transition descriptors.
    pub transno: usize,

    pub final_fn: Option<AggFn>,
    pub final_fn_strict: bool,
    /// Total arguments the final function receives.
    pub num_final_args: usize,

    pub result_type: DataType,
    pub direct_args: Vec<PhysicalExprRef>,

    pub aggref: AggCallRef,
    pub final_frame: FunctionFrame,
}

/// Result of walking the plan's aggregate call sites.
#[derive(Debug)]
pub struct BuiltAggregates {
    pub pertrans: Vec<PerTrans>,
    pub peraggs: Vec<PerAgg>,
    /// Maps each plan call site to its (possibly shared) aggregate.
    pub call_to_aggno: Vec<usize>,
    /// All transition argument expressions concatenated in transition order;
    /// evaluated exactly once per input tuple.
    pub combined_exprs: Vec<PhysicalExprRef>,
}

/// Build per-aggregate and per-transition descriptors from the plan.
pub fn build_aggregates(
    plan: &AggPlan,
    catalog: &AggregateCatalog,
    policy: &AccessPolicy,
    num_sets: usize,
) -> Result<BuiltAggregates> {
    let split = plan.split;

    let mut pertrans: Vec<PerTrans> = Vec::new();
    let mut peraggs: Vec<PerAgg> = Vec::new();
    let mut call_to_aggno = Vec::with_capacity(plan.aggregates.len());
    // Identity of each built PerAgg / PerTrans, parallel to the vecs above.
    let mut peragg_identities: Vec<String> = Vec::new();
    let mut pertrans_identities: Vec<String> = Vec::new();

    for call in &plan.aggregates {
        let spec = catalog.lookup(&call.func)?;
        policy.check_may_execute(&call.func)?;
        check_for_nested_aggregates(call)?;
        check_call_shape(call, &spec)?;
        check_split_requirements(&spec, split)?;

        let call: AggCallRef = Arc::new(call.clone());

        // An exact match on the full call identity shares the whole
        // aggregate, state included. Volatile inputs disqualify sharing.
        let call_identity = call.call_identity();
        if !call.is_volatile() {
            if let Some(aggno) = peragg_identities.iter().position(|id| *id == call_identity) {
                call_to_aggno.push(aggno);
                continue;
            }
        }

        let transno = find_or_build_pertrans(
            &mut pertrans,
            &mut pertrans_identities,
            &call,
            &spec,
            split,
            num_sets,
        )?;

        let aggno = peraggs.len();
        peraggs.push(PerAgg {
            transno,
            final_fn: spec.final_fn,
            final_fn_strict: spec.final_fn_strict,
            num_final_args: spec.num_final_args(),
            result_type: spec.result_type,
            direct_args: call.direct_args.clone(),
            aggref: call,
            final_frame: FunctionFrame::new(spec.num_final_args()),
        });
        peragg_identities.push(call_identity);
        call_to_aggno.push(aggno);
    }

    // Assign combined-projection offsets in transition order. Each
    // transition contributes exactly the slots it will read back.
    let mut combined_exprs = Vec::new();
    for pt in pertrans.iter_mut() {
        pt.arg_offset = combined_exprs.len();
        combined_exprs.extend(pt.aggref.args.iter().take(pt.num_args).cloned());
    }

    Ok(BuiltAggregates {
        pertrans,
        peraggs,
        call_to_aggno,
        combined_exprs,
    })
}

fn check_for_nested_aggregates(call: &AggCallExpr) -> Result<()> {
    let nested = call.args.iter().any(|e| e.contains_aggregate())
        || call.direct_args.iter().any(|e| e.contains_aggregate())
        || call
            .filter
            .as_ref()
            .map(|e| e.contains_aggregate())
            .unwrap_or(false);
    if nested {
        return Err(FoldexecError::new(
            "aggregate function calls cannot be nested",
        ));
    }
    Ok(())
}

fn check_call_shape(call: &AggCallExpr, spec: &AggregateSpec) -> Result<()> {
    if call.args.len() < spec.num_args {
        return Err(FoldexecError::new(format!(
            "aggregate {} expects {} arguments, got {}",
            spec.name,
            spec.num_args,
            call.args.len()
        )));
    }
    if call.direct_args.len() != spec.num_direct_args {
        return Err(FoldexecError::new(format!(
            "aggregate {} expects {} direct arguments, got {}",
            spec.name,
            spec.num_direct_args,
            call.direct_args.len()
        )));
    }
    if spec.kind == AggKind::OrderedSet && call.order_by.is_empty() {
        return Err(FoldexecError::new(format!(
            "ordered-set aggregate {} requires a WITHIN GROUP ordering",
            spec.name
        )));
    }
    for col in &call.order_by {
        if col.column >= call.args.len() {
            return Err(FoldexecError::new(format!(
                "aggregate {} orders by argument {} but only has {} arguments",
                spec.name,
                col.column,
                call.args.len()
            )));
        }
    }
    Ok(())
}

fn check_split_requirements(spec: &AggregateSpec, split: AggSplit) -> Result<()> {
    if (split.combine || split.skip_final) && spec.combine_fn.is_none() {
        return Err(FoldexecError::new(format!(
            "invalid function definition: aggregate {} cannot be split without a combine function",
            spec.name
        )));
    }
    if spec.trans_type == DataType::Internal {
        if (split.serialize || split.skip_final) && spec.serial_fn.is_none() {
            return Err(FoldexecError::new(format!(
                "invalid function definition: aggregate {} has no serialization function",
                spec.name
            )));
        }
        if (split.deserialize || split.combine) && spec.deserial_fn.is_none() {
            return Err(FoldexecError::new(format!(
                "invalid function definition: aggregate {} has no deserialization function",
                spec.name
            )));
        }
    }
    Ok(())
}

fn find_or_build_pertrans(
    pertrans: &mut Vec<PerTrans>,
    identities: &mut Vec<String>,
    call: &AggCallRef,
    spec: &AggregateSpec,
    split: AggSplit,
    num_sets: usize,
) -> Result<usize> {
    // Transition identity: same inputs feeding the same transition machinery
    // with the same starting value. Final functions are deliberately absent
    // here; calls that differ only there share the state.
    let args: Vec<_> = call.args.iter().map(|e| e.fingerprint()).collect();
    let identity = format!(
        "trans={:p} type={} serial={:?} deserial={:?} init={:?} args[{}] filter[{}] distinct={} order_by={:?}",
        spec.trans_fn as *const (),
        spec.trans_type,
        spec.serial_fn.map(|f| f as *const ()),
        spec.deserial_fn.map(|f| f as *const ()),
        spec.init_value,
        args.join(","),
        fingerprint_opt(&call.filter),
        call.distinct,
        call.order_by,
    );

    if !call.is_volatile() {
        if let Some(transno) = identities.iter().position(|id| *id == identity) {
            return Ok(transno);
        }
    }

    if spec.trans_fn_strict && spec.init_value.is_none() && spec.trans_type == DataType::Internal {
        // The first-input shortcut adopts a raw input datum as the transition
        // value, which requires the input to be usable as the transition
        // type. An opaque internal state never is.
        return Err(FoldexecError::new(format!(
            "invalid function definition: aggregate {} is strict with a null initial value over an internal transition type",
            spec.name
        )));
    }

    let num_trans_inputs = if split.combine { 1 } else { spec.num_args };
    let num_args = if split.combine { 1 } else { call.args.len() };

    let sort_spec = if call.needs_sort() && !split.combine {
        let columns = if call.order_by.is_empty() {
            (0..call.args.len()).map(SortColumn::asc).collect()
        } else {
            call.order_by.clone()
        };
        let mut spec = SortSpec::new(columns);
        if call.distinct {
            spec.num_distinct = spec.columns.len();
        }
        spec.validate()?;
        Some(spec)
    } else {
        None
    };

    let transno = pertrans.len();
    pertrans.push(PerTrans {
        aggref: call.clone(),
        trans_fn: spec.trans_fn,
        trans_fn_strict: spec.trans_fn_strict,
        combine_fn: spec.combine_fn,
        combine_fn_strict: spec.combine_fn_strict,
        serial_fn: spec.serial_fn,
        serial_fn_strict: spec.serial_fn_strict,
        deserial_fn: spec.deserial_fn,
        deserial_fn_strict: spec.deserial_fn_strict,
        trans_type: spec.trans_type,
        trans_type_by_val: spec.trans_type.is_by_val(),
        init_value: spec.init_value.clone(),
        filter: call.filter.clone(),
        num_args,
        num_trans_inputs,
        arg_offset: 0,
        sort_spec,
        sorters: (0..num_sets).map(|_| None).collect(),
        trans_frame: FunctionFrame::new(1 + num_trans_inputs),
        combine_frame: FunctionFrame::new(2),
        serial_frame: FunctionFrame::new(1),
        deserial_frame: FunctionFrame::new(1),
    });
    identities.push(identity);
    Ok(transno)
}

/// Initial per-group states for every transition, in transition order.
pub fn initial_pergroup_array(pertrans: &[PerTrans], set_arena: &MemoryArena) -> PerGroupArray {
    pertrans
        .iter()
        .map(|pt| pt.initial_pergroup(set_arena))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::PhysicalColumnExpr;
    use crate::functions::aggregate::BUILTIN_AGGREGATES;
    use crate::operators::aggregate::plan::{AggCallExpr, OutputColumn};

    fn call(func: &str, col: usize) -> AggCallExpr {
        AggCallExpr::new(func, vec![Arc::new(PhysicalColumnExpr::new(col))])
    }

    fn build(calls: Vec<AggCallExpr>) -> Result<BuiltAggregates> {
        let output = (0..calls.len()).map(OutputColumn::AggregateResult).collect();
        let plan = AggPlan::plain(calls, output);
        build_aggregates(&plan, &BUILTIN_AGGREGATES, &AccessPolicy::allow_all(), 1)
    }

    #[test]
    fn identical_calls_share_everything() {
        let built = build(vec![call("sum_i64", 0), call("sum_i64", 0)]).unwrap();
        assert_eq!(1, built.peraggs.len());
        assert_eq!(1, built.pertrans.len());
        assert_eq!(vec![0, 0], built.call_to_aggno);
    }

    #[test]
    fn different_columns_do_not_share() {
        let built = build(vec![call("sum_i64", 0), call("sum_i64", 1)]).unwrap();
        assert_eq!(2, built.peraggs.len());
        assert_eq!(2, built.pertrans.len());
    }

    #[test]
    fn combined_projection_concatenates_in_transition_order() {
        let built = build(vec![call("sum_i64", 0), call("min_i64", 1)]).unwrap();
        assert_eq!(2, built.combined_exprs.len());
        assert_eq!(0, built.pertrans[0].arg_offset);
        assert_eq!(1, built.pertrans[1].arg_offset);
    }

    #[test]
    fn permission_denial_surfaces_at_construction() {
        let plan = AggPlan::plain(
            vec![call("sum_i64", 0)],
            vec![OutputColumn::AggregateResult(0)],
        );
        let policy = AccessPolicy::allow_all().deny("sum_i64");
        let err =
            build_aggregates(&plan, &BUILTIN_AGGREGATES, &policy, 1).unwrap_err();
        assert!(err.message().contains("permission denied"));
    }

    #[test]
    fn nested_aggregate_is_rejected() {
        use crate::expr::PhysicalAggregateRefExpr;
        let nested = AggCallExpr::new("sum_i64", vec![Arc::new(PhysicalAggregateRefExpr)]);
        let err = build(vec![nested]).unwrap_err();
        assert!(err.message().contains("cannot be nested"));
    }

    #[test]
    fn catalog_miss_is_fatal() {
        let err = build(vec![call("no_such", 0)]).unwrap_err();
        assert!(err.message().contains("does not exist"));
    }

    #[test]
    fn initial_pergroup_reflects_init_value() {
        let built = build(vec![call("count", 0), call("sum_i64", 0)]).unwrap();
        let arena = MemoryArena::new_root("test");

        let count_group = built.pertrans[0].initial_pergroup(&arena);
        assert!(!count_group.trans_value_is_null);
        assert!(!count_group.no_trans_value);

        let sum_group = built.pertrans[1].initial_pergroup(&arena);
        assert!(sum_group.trans_value_is_null);
        assert!(sum_group.no_trans_value);
    }
}
