//! Aggregate function catalog.
//!
//! Each catalog row describes one aggregate: its transition function,
//! optional final/combine/serialize/deserialize functions, strictness flags,
//! transition state type, and initial value. The execution operator consumes
//! these rows; it never calls an aggregate implementation directly.

pub mod builtins;

use std::sync::Arc;

use foldexec_datum::datatype::DataType;
use foldexec_datum::datum::Datum;
use foldexec_error::{FoldexecError, Result};
use hashbrown::HashMap;
use once_cell::sync::Lazy;

use super::AggFn;

/// Kind of aggregate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    Normal,
    /// Ordered-set aggregate: direct arguments plus WITHIN GROUP ordering.
    OrderedSet,
}

/// One catalog row.
#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub name: &'static str,
    pub kind: AggKind,

    pub trans_fn: AggFn,
    pub trans_fn_strict: bool,

    pub final_fn: Option<AggFn>,
    pub final_fn_strict: bool,

    pub combine_fn: Option<AggFn>,
    pub combine_fn_strict: bool,

    pub serial_fn: Option<AggFn>,
    pub serial_fn_strict: bool,

    pub deserial_fn: Option<AggFn>,
    pub deserial_fn_strict: bool,

    /// Declared transition state type.
    pub trans_type: DataType,
    pub result_type: DataType,

    /// Textual initial value resolved to a datum; None means the initial
    /// transition value is null.
    pub init_value: Option<Datum>,

    /// Number of aggregated arguments.
    pub num_args: usize,

    /// Number of direct (non-aggregated) arguments for ordered-set
    /// aggregates.
    pub num_direct_args: usize,

    /// Whether the final function receives null placeholders for the
    /// aggregated arguments after the transition value and direct arguments.
    pub final_extra_args: bool,
}

impl AggregateSpec {
    /// Catalog-level sanity checks, applied at lookup.
    pub fn validate(&self) -> Result<()> {
        if self.trans_type == DataType::Internal && self.combine_fn.is_some() && self.combine_fn_strict
        {
            // A combine over opaque internal state cannot rely on strictness:
            // the incoming state is a pointer-like value the machinery cannot
            // substitute for.
            return Err(FoldexecError::new(format!(
                "invalid function definition: combine function for {} over internal state must not be strict",
                self.name
            )));
        }
        if self.serial_fn.is_some() != self.deserial_fn.is_some() {
            return Err(FoldexecError::new(format!(
                "invalid function definition: {} declares only one of serialize/deserialize",
                self.name
            )));
        }
        Ok(())
    }

    /// Total argument count the final function is invoked with.
    pub fn num_final_args(&self) -> usize {
        let extra = if self.final_extra_args { self.num_args } else { 0 };
        1 + self.num_direct_args + extra
    }
}

/// Lookup table of aggregate specs.
#[derive(Debug, Default)]
pub struct AggregateCatalog {
    entries: HashMap<&'static str, Arc<AggregateSpec>>,
}

impl AggregateCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut catalog = Self::default();
        for spec in builtins::builtin_aggregates() {
            catalog.register(spec);
        }
        catalog
    }

    pub fn register(&mut self, spec: AggregateSpec) {
        self.entries.insert(spec.name, Arc::new(spec));
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<AggregateSpec>> {
        let spec = self
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| FoldexecError::new(format!("aggregate function {name} does not exist")))?;
        spec.validate()?;
        Ok(spec)
    }
}

/// Execute permission on aggregate support functions.
///
/// Denials surface at operator construction, before any input is consumed.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    denied: Vec<String>,
}

impl AccessPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn deny(mut self, name: impl Into<String>) -> Self {
        self.denied.push(name.into());
        self
    }

    pub fn check_may_execute(&self, name: &str) -> Result<()> {
        if self.denied.iter().any(|denied| denied == name) {
            return Err(FoldexecError::new(format!(
                "permission denied for aggregate function {name}"
            )));
        }
        Ok(())
    }
}

/// Built-in aggregates, constructed once.
pub static BUILTIN_AGGREGATES: Lazy<AggregateCatalog> = Lazy::new(AggregateCatalog::with_builtins);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_miss_is_fatal() {
        let err = BUILTIN_AGGREGATES.lookup("no_such_aggregate").unwrap_err();
        assert!(err.message().contains("does not exist"));
    }

    #[test]
    fn strict_internal_combine_is_rejected() {
        let mut spec = BUILTIN_AGGREGATES.lookup("avg_f64").unwrap().as_ref().clone();
        spec.name = "broken_avg";
        spec.combine_fn_strict = true;

        let mut catalog = AggregateCatalog::empty();
        catalog.register(spec);
        let err = catalog.lookup("broken_avg").unwrap_err();
        assert!(err.message().contains("invalid function definition"));
    }

    #[test]
    fn policy_denies_by_name() {
        let policy = AccessPolicy::allow_all().deny("sum_i64");
        assert!(policy.check_may_execute("count").is_ok());
        assert!(policy.check_may_execute("sum_i64").is_err());
    }
}
