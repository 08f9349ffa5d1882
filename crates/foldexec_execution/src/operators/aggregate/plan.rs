//! Plan node contract for the aggregate operator.
//!
//! The planner hands the operator a fully decided plan: execution strategy,
//! partial-aggregation split, aggregate call sites, phase layout with
//! grouping-set prefixes, and the output projection. The operator checks the
//! invariants the planner must satisfy and otherwise trusts the plan.

use std::fmt;
use std::sync::Arc;

use foldexec_datum::sort::{SortColumn, SortSpec};
use foldexec_error::{FoldexecError, Result};

use crate::expr::{fingerprint_opt, PhysicalExprRef};

/// Execution strategy for the aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggStrategy {
    /// Single group, no grouping columns.
    Plain,
    /// Input arrives ordered on the grouping columns.
    Sorted,
    /// Group lookup through hash tables, unordered input.
    Hashed,
    /// Hashed grouping sets populated while sorted phases run.
    Mixed,
}

impl fmt::Display for AggStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggStrategy::Plain => write!(f, "plain"),
            AggStrategy::Sorted => write!(f, "sorted"),
            AggStrategy::Hashed => write!(f, "hashed"),
            AggStrategy::Mixed => write!(f, "mixed"),
        }
    }
}

/// Partial-aggregation mode, encoded as independent capability bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggSplit {
    /// Skip final functions and emit transition state.
    pub skip_final: bool,
    /// Input rows are partial transition states to be combined.
    pub combine: bool,
    /// Serialize emitted transition state.
    pub serialize: bool,
    /// Deserialize incoming transition state.
    pub deserialize: bool,
}

impl AggSplit {
    /// Ordinary aggregation: raw rows in, final values out.
    pub const NONE: AggSplit = AggSplit {
        skip_final: false,
        combine: false,
        serialize: false,
        deserialize: false,
    };

    /// Producing partials for another worker: raw rows in, serialized
    /// transition state out.
    pub const INITIAL_SERIAL: AggSplit = AggSplit {
        skip_final: true,
        combine: false,
        serialize: true,
        deserialize: false,
    };

    /// Consuming partials from other workers: serialized transition state
    /// in, final values out.
    pub const COMBINE_DESERIAL: AggSplit = AggSplit {
        skip_final: false,
        combine: true,
        serialize: false,
        deserialize: true,
    };

    pub const fn is_partial_input(&self) -> bool {
        self.combine
    }

    pub const fn is_partial_output(&self) -> bool {
        self.skip_final
    }
}

impl fmt::Display for AggSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bits = Vec::new();
        if self.skip_final {
            bits.push("skip_final");
        }
        if self.combine {
            bits.push("combine");
        }
        if self.serialize {
            bits.push("serialize");
        }
        if self.deserialize {
            bits.push("deserialize");
        }
        if bits.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", bits.join("+"))
        }
    }
}

/// One aggregate call site in the query.
#[derive(Debug, Clone)]
pub struct AggCallExpr {
    /// Aggregate function identity, resolved through the catalog.
    pub func: String,

    /// Aggregated argument expressions. When an ORDER BY names columns that
    /// are not transition inputs, they trail the transition inputs here.
    pub args: Vec<PhysicalExprRef>,

    /// Direct arguments for ordered-set aggregates.
    pub direct_args: Vec<PhysicalExprRef>,

    /// Optional FILTER clause.
    pub filter: Option<PhysicalExprRef>,

    pub distinct: bool,

    /// Sort specification over positions in `args`.
    pub order_by: Vec<SortColumn>,
}

impl AggCallExpr {
    pub fn new(func: impl Into<String>, args: Vec<PhysicalExprRef>) -> Self {
        AggCallExpr {
            func: func.into(),
            args,
            direct_args: Vec::new(),
            filter: None,
            distinct: false,
            order_by: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: PhysicalExprRef) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn with_order_by(mut self, order_by: Vec<SortColumn>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn with_direct_args(mut self, direct_args: Vec<PhysicalExprRef>) -> Self {
        self.direct_args = direct_args;
        self
    }

    /// Whether sorting is required before this call's inputs are aggregated.
    pub fn needs_sort(&self) -> bool {
        self.distinct || !self.order_by.is_empty()
    }

    /// Whether any input expression may evaluate non-deterministically.
    pub fn is_volatile(&self) -> bool {
        self.args.iter().any(|e| e.is_volatile())
            || self.direct_args.iter().any(|e| e.is_volatile())
            || self.filter.as_ref().map(|e| e.is_volatile()).unwrap_or(false)
    }

    /// Full call identity. Two calls with equal identities (and no volatile
    /// inputs) compute the same value for every group and may share state.
    pub fn call_identity(&self) -> String {
        let args: Vec<_> = self.args.iter().map(|e| e.fingerprint()).collect();
        let direct: Vec<_> = self.direct_args.iter().map(|e| e.fingerprint()).collect();
        format!(
            "{}({}) direct[{}] filter[{}] distinct={} order_by={:?}",
            self.func,
            args.join(","),
            direct.join(","),
            fingerprint_opt(&self.filter),
            self.distinct,
            self.order_by,
        )
    }
}

/// One sorted phase: a pass over the input in a fixed column order computing
/// one or more grouping sets expressed as prefixes of that order.
#[derive(Debug, Clone)]
pub struct SortedPhasePlan {
    /// Input column indices, in this phase's sort order.
    pub group_cols: Vec<usize>,

    /// Grouping-set prefix lengths over `group_cols`. Stored most specific
    /// first.
    pub set_prefixes: Vec<usize>,

    /// Re-sort needed before this phase runs. The first sorted phase consumes
    /// input in the order the child provides and carries no sort here.
    pub input_sort: Option<SortSpec>,
}

/// One hashed grouping set.
#[derive(Debug, Clone)]
pub struct HashedSetPlan {
    /// Input column indices forming the set's key.
    pub key_cols: Vec<usize>,
}

/// How one output column is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputColumn {
    /// A grouping column, by position in the plan's global grouping column
    /// list. Null when the column is absent from the current grouping set.
    GroupingColumn(usize),

    /// A computed aggregate result, by call-site position.
    AggregateResult(usize),

    /// Bitmask over the global grouping columns with ones for columns absent
    /// from the current grouping set.
    GroupingId,
}

impl fmt::Display for OutputColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputColumn::GroupingColumn(idx) => write!(f, "grouping_column({idx})"),
            OutputColumn::AggregateResult(idx) => write!(f, "result_column({idx})"),
            OutputColumn::GroupingId => write!(f, "grouping_id"),
        }
    }
}

/// The aggregate plan node.
#[derive(Debug)]
pub struct AggPlan {
    pub strategy: AggStrategy,
    pub split: AggSplit,

    /// All distinct grouping columns (input indices). Output references and
    /// grouping-id bits use positions in this list.
    pub group_cols: Vec<usize>,

    /// Sorted phases, executed in order.
    pub sorted_phases: Vec<SortedPhasePlan>,

    /// Hashed grouping sets, all computed in the single hash phase.
    pub hashed_sets: Vec<HashedSetPlan>,

    pub aggregates: Vec<AggCallExpr>,

    /// HAVING qual applied to finalized rows.
    pub having: Option<PhysicalExprRef>,

    pub output: Vec<OutputColumn>,

    /// Planner marked the hash tables as allowed to spill.
    pub hybrid_capable: bool,
}

impl AggPlan {
    /// A plain single-group aggregation.
    pub fn plain(aggregates: Vec<AggCallExpr>, output: Vec<OutputColumn>) -> Self {
        AggPlan {
            strategy: AggStrategy::Plain,
            split: AggSplit::NONE,
            group_cols: Vec::new(),
            sorted_phases: vec![SortedPhasePlan {
                group_cols: Vec::new(),
                set_prefixes: vec![0],
                input_sort: None,
            }],
            hashed_sets: Vec::new(),
            aggregates,
            having: None,
            output,
            hybrid_capable: false,
        }
    }

    /// Check the invariants the planner must satisfy.
    pub fn validate(&self) -> Result<()> {
        match self.strategy {
            AggStrategy::Plain => {
                if !self.group_cols.is_empty() || !self.hashed_sets.is_empty() {
                    return Err(FoldexecError::new(
                        "plain aggregation cannot carry grouping columns or hashed sets",
                    ));
                }
                if self.sorted_phases.len() != 1 {
                    return Err(FoldexecError::new(
                        "plain aggregation must have exactly one phase and no chain",
                    ));
                }
            }
            AggStrategy::Sorted => {
                if self.sorted_phases.is_empty() || !self.hashed_sets.is_empty() {
                    return Err(FoldexecError::new(
                        "sorted aggregation requires sorted phases and no hashed sets",
                    ));
                }
            }
            AggStrategy::Hashed => {
                if self.hashed_sets.is_empty() || !self.sorted_phases.is_empty() {
                    return Err(FoldexecError::new(
                        "hashed aggregation requires hashed sets and no sorted phases",
                    ));
                }
            }
            AggStrategy::Mixed => {
                if self.hashed_sets.is_empty() || self.sorted_phases.is_empty() {
                    return Err(FoldexecError::new(
                        "mixed aggregation requires both hashed and sorted groupings",
                    ));
                }
            }
        }

        for phase in &self.sorted_phases {
            let mut prev = usize::MAX;
            for &prefix in &phase.set_prefixes {
                if prefix > phase.group_cols.len() {
                    return Err(FoldexecError::new(
                        "grouping-set prefix exceeds phase column count",
                    ));
                }
                if prefix > prev {
                    return Err(FoldexecError::new(
                        "grouping sets must be listed most specific first",
                    ));
                }
                prev = prefix;
            }
            if phase.set_prefixes.is_empty() {
                return Err(FoldexecError::new("phase carries no grouping sets"));
            }
        }

        let uses_hashing = !self.hashed_sets.is_empty();
        for call in &self.aggregates {
            if call.needs_sort() && (self.split.combine || self.split.skip_final) {
                return Err(FoldexecError::new(
                    "partial aggregation cannot aggregate DISTINCT or ORDER BY calls",
                ));
            }
            if call.needs_sort() && uses_hashing {
                return Err(FoldexecError::new(
                    "DISTINCT and ORDER BY aggregates are not supported with hashed grouping",
                ));
            }
        }

        if self.split.combine && self.split.serialize {
            return Err(FoldexecError::new(
                "combine-side aggregation does not serialize its own input",
            ));
        }

        Ok(())
    }

    /// Position of an input column in the global grouping column list.
    pub fn grouping_col_position(&self, input_col: usize) -> Option<usize> {
        self.group_cols.iter().position(|&c| c == input_col)
    }
}

/// Shared plan reference handed to call frames so support functions can
/// inspect the call they serve.
pub type AggCallRef = Arc<AggCallExpr>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::PhysicalColumnExpr;

    fn count_call() -> AggCallExpr {
        AggCallExpr::new("count", vec![Arc::new(PhysicalColumnExpr::new(0))])
    }

    #[test]
    fn plain_plan_validates() {
        let plan = AggPlan::plain(vec![count_call()], vec![OutputColumn::AggregateResult(0)]);
        plan.validate().unwrap();
    }

    #[test]
    fn combine_rejects_distinct() {
        let mut plan = AggPlan::plain(
            vec![count_call().with_distinct()],
            vec![OutputColumn::AggregateResult(0)],
        );
        plan.split = AggSplit::COMBINE_DESERIAL;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn prefixes_must_descend() {
        let mut plan = AggPlan::plain(vec![count_call()], vec![OutputColumn::AggregateResult(0)]);
        plan.strategy = AggStrategy::Sorted;
        plan.group_cols = vec![0, 1];
        plan.sorted_phases = vec![SortedPhasePlan {
            group_cols: vec![0, 1],
            set_prefixes: vec![1, 2],
            input_sort: None,
        }];
        assert!(plan.validate().is_err());
    }

    #[test]
    fn shared_identity_for_equal_calls() {
        let a = count_call();
        let b = count_call();
        assert_eq!(a.call_identity(), b.call_identity());

        let c = count_call().with_distinct();
        assert_ne!(a.call_identity(), c.call_identity());
    }
}
