//! Function call machinery for aggregate transition, combine, serialize,
//! deserialize, and final functions.

pub mod aggregate;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dyn_clone::DynClone;
use foldexec_datum::datum::Datum;
use foldexec_error::{FoldexecError, Result};

use crate::memory::MemoryArena;
use crate::operators::aggregate::plan::AggCallExpr;

/// Opaque in-memory transition state.
///
/// Values of the `Internal` transition type live behind this trait. Crossing
/// a disk or worker boundary requires the owning aggregate's serialize and
/// deserialize functions.
pub trait InternalState: fmt::Debug + DynClone + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

dyn_clone::clone_trait_object!(InternalState);

/// A value flowing through an aggregate support function: either an ordinary
/// datum or an opaque internal state.
#[derive(Debug, Clone)]
pub enum AggValue {
    Datum(Datum),
    State(Box<dyn InternalState>),
}

impl AggValue {
    pub fn null() -> Self {
        AggValue::Datum(Datum::Null)
    }

    pub fn as_datum(&self) -> Result<&Datum> {
        match self {
            AggValue::Datum(d) => Ok(d),
            AggValue::State(_) => Err(FoldexecError::new(
                "expected a datum, found an internal transition state",
            )),
        }
    }

    pub fn into_datum(self) -> Result<Datum> {
        match self {
            AggValue::Datum(d) => Ok(d),
            AggValue::State(_) => Err(FoldexecError::new(
                "expected a datum, found an internal transition state",
            )),
        }
    }

    pub fn into_state(self) -> Result<Box<dyn InternalState>> {
        match self {
            AggValue::State(s) => Ok(s),
            AggValue::Datum(d) => Err(FoldexecError::new(format!(
                "expected an internal transition state, found datum {d}"
            ))),
        }
    }
}

/// Downcast an internal state box to a concrete type.
pub fn downcast_state<T: InternalState + 'static>(
    state: Box<dyn InternalState>,
) -> Result<Box<T>> {
    state.into_any().downcast::<T>().map_err(|_| {
        FoldexecError::new("internal transition state has unexpected concrete type")
    })
}

/// Function pointer for an aggregate support function.
///
/// Functions read arguments from the frame and store their result back into
/// it. Position 0 carries the transition value for transition, combine,
/// serialize, and final calls.
pub type AggFn = fn(&mut FunctionFrame) -> Result<()>;

/// What kind of caller invoked a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallContextKind {
    /// Called as a plain function, outside any aggregation.
    None,
    /// Called by the aggregate operator.
    Aggregate,
}

/// Aggregate-side call context made visible to support functions.
#[derive(Debug, Clone)]
pub struct AggCallContext {
    /// Arena scoped to the current grouping set; working state that should
    /// persist across rows of the same group belongs here.
    pub set_arena: MemoryArena,
    /// Short-lived arena safe for final functions to reset.
    pub tmp_arena: MemoryArena,
    /// The aggregate call expression being computed, when known.
    pub aggref: Option<Arc<AggCallExpr>>,
}

/// A pre-initialized call frame for one support function.
///
/// Frames are built once per transition descriptor and reused for every
/// invocation; only argument slots and the result change per call.
#[derive(Debug)]
pub struct FunctionFrame {
    args: Vec<AggValue>,
    arg_nulls: Vec<bool>,
    result: Option<(AggValue, bool)>,
    context: Option<AggCallContext>,
}

impl FunctionFrame {
    pub fn new(num_args: usize) -> Self {
        FunctionFrame {
            args: (0..num_args).map(|_| AggValue::null()).collect(),
            arg_nulls: vec![true; num_args],
            result: None,
            context: None,
        }
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Reset all argument slots to null and clear any prior result.
    pub fn clear(&mut self) {
        for (arg, is_null) in self.args.iter_mut().zip(self.arg_nulls.iter_mut()) {
            *arg = AggValue::null();
            *is_null = true;
        }
        self.result = None;
    }

    pub fn set_context(&mut self, context: AggCallContext) {
        self.context = Some(context);
    }

    pub fn set_arg(&mut self, idx: usize, value: AggValue, is_null: bool) {
        self.args[idx] = value;
        self.arg_nulls[idx] = is_null;
    }

    pub fn set_arg_datum(&mut self, idx: usize, datum: Datum) {
        self.arg_nulls[idx] = datum.is_null();
        self.args[idx] = AggValue::Datum(datum);
    }

    pub fn arg(&self, idx: usize) -> &AggValue {
        &self.args[idx]
    }

    pub fn arg_is_null(&self, idx: usize) -> bool {
        self.arg_nulls[idx]
    }

    pub fn arg_datum(&self, idx: usize) -> Result<&Datum> {
        self.args[idx].as_datum()
    }

    /// Move an argument out of the frame, leaving null behind.
    ///
    /// Transition functions use this to take ownership of the current
    /// transition value so it can be updated without copying.
    pub fn take_arg(&mut self, idx: usize) -> (AggValue, bool) {
        let is_null = self.arg_nulls[idx];
        self.arg_nulls[idx] = true;
        (std::mem::replace(&mut self.args[idx], AggValue::null()), is_null)
    }

    pub fn set_result(&mut self, value: AggValue, is_null: bool) {
        self.result = Some((value, is_null));
    }

    pub fn set_result_datum(&mut self, datum: Datum) {
        let is_null = datum.is_null();
        self.result = Some((AggValue::Datum(datum), is_null));
    }

    pub fn set_result_state(&mut self, state: Box<dyn InternalState>) {
        self.result = Some((AggValue::State(state), false));
    }

    pub fn set_result_null(&mut self) {
        self.result = Some((AggValue::null(), true));
    }

    pub fn take_result(&mut self) -> Result<(AggValue, bool)> {
        self.result
            .take()
            .ok_or_else(|| FoldexecError::new("function returned without setting a result"))
    }

    // Support API exposed to transition and final functions.

    /// Distinguish being invoked by the aggregate operator from being called
    /// as a plain function.
    pub fn check_call_context(&self) -> CallContextKind {
        match self.context {
            Some(_) => CallContextKind::Aggregate,
            None => CallContextKind::None,
        }
    }

    /// Arena in which to allocate working state that should persist across
    /// rows of the same group. None outside aggregation.
    pub fn aggregate_arena(&self) -> Option<&MemoryArena> {
        self.context.as_ref().map(|ctx| &ctx.set_arena)
    }

    /// The current aggregate call expression, if invoked by the aggregate
    /// operator with a known call site.
    pub fn get_aggref(&self) -> Option<&Arc<AggCallExpr>> {
        self.context.as_ref().and_then(|ctx| ctx.aggref.as_ref())
    }

    /// Short-lived arena safe for final functions to reset.
    pub fn get_temp_memory_context(&self) -> Option<&MemoryArena> {
        self.context.as_ref().map(|ctx| &ctx.tmp_arena)
    }

    /// Register a shutdown hook on the current grouping-set arena. It runs
    /// when that arena is rescanned (group boundary or operator rescan), not
    /// on error paths.
    pub fn register_callback(&self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        match &self.context {
            Some(ctx) => {
                ctx.set_arena.register_callback(callback);
                Ok(())
            }
            None => Err(FoldexecError::new(
                "callback registration requires an aggregate call context",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_arg_leaves_null() {
        let mut frame = FunctionFrame::new(2);
        frame.set_arg_datum(1, Datum::Int64(5));
        assert!(!frame.arg_is_null(1));

        let (value, is_null) = frame.take_arg(1);
        assert!(!is_null);
        assert_eq!(&Datum::Int64(5), value.as_datum().unwrap());
        assert!(frame.arg_is_null(1));
    }

    #[test]
    fn call_context_outside_aggregation() {
        let frame = FunctionFrame::new(1);
        assert_eq!(CallContextKind::None, frame.check_call_context());
        assert!(frame.aggregate_arena().is_none());
        assert!(frame.register_callback(|| {}).is_err());
    }

    #[test]
    fn missing_result_is_an_error() {
        let mut frame = FunctionFrame::new(1);
        assert!(frame.take_result().is_err());
    }
}
