//! Built-in aggregate implementations.
//!
//! Each aggregate is a set of plain functions over [`FunctionFrame`]s plus a
//! catalog row tying them together. Transition functions see the current
//! transition value at argument 0 and the aggregated inputs at 1..; combine
//! functions see the incoming partial state at argument 1.

use std::any::Any;

use foldexec_datum::codec;
use foldexec_datum::datatype::DataType;
use foldexec_datum::datum::{cmp_datums, Datum};
use foldexec_error::{FoldexecError, Result};

use super::{AggKind, AggregateSpec};
use crate::functions::{downcast_state, FunctionFrame, InternalState};

fn datum_i64(datum: &Datum) -> Result<i64> {
    datum
        .try_as_i64()
        .ok_or_else(|| FoldexecError::new(format!("expected integer datum, got {datum}")))
}

fn datum_f64(datum: &Datum) -> Result<f64> {
    datum
        .try_as_f64()
        .ok_or_else(|| FoldexecError::new(format!("expected float datum, got {datum}")))
}

// sum(bigint)

fn sum_i64_trans(frame: &mut FunctionFrame) -> Result<()> {
    let state = datum_i64(frame.arg_datum(0)?)?;
    let arg = datum_i64(frame.arg_datum(1)?)?;
    frame.set_result_datum(Datum::Int64(state.wrapping_add(arg)));
    Ok(())
}

// count(any) / count(*)

fn count_trans(frame: &mut FunctionFrame) -> Result<()> {
    let state = datum_i64(frame.arg_datum(0)?)?;
    frame.set_result_datum(Datum::Int64(state + 1));
    Ok(())
}

fn count_combine(frame: &mut FunctionFrame) -> Result<()> {
    let state = datum_i64(frame.arg_datum(0)?)?;
    let incoming = datum_i64(frame.arg_datum(1)?)?;
    frame.set_result_datum(Datum::Int64(state + incoming));
    Ok(())
}

// min(bigint) / max(bigint)

fn min_i64_trans(frame: &mut FunctionFrame) -> Result<()> {
    let state = frame.arg_datum(0)?.clone();
    let arg = frame.arg_datum(1)?.clone();
    let keep = if cmp_datums(&arg, &state) == std::cmp::Ordering::Less {
        arg
    } else {
        state
    };
    frame.set_result_datum(keep);
    Ok(())
}

fn max_i64_trans(frame: &mut FunctionFrame) -> Result<()> {
    let state = frame.arg_datum(0)?.clone();
    let arg = frame.arg_datum(1)?.clone();
    let keep = if cmp_datums(&arg, &state) == std::cmp::Ordering::Greater {
        arg
    } else {
        state
    };
    frame.set_result_datum(keep);
    Ok(())
}

// avg(double precision)
//
// Internal transition state; serialize/deserialize make it eligible for
// partial aggregation across workers and for hybrid hash spilling.

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AvgState {
    pub sum: f64,
    pub count: i64,
}

impl InternalState for AvgState {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

fn take_avg_state(frame: &mut FunctionFrame, idx: usize) -> Result<Option<Box<AvgState>>> {
    let (value, is_null) = frame.take_arg(idx);
    if is_null {
        return Ok(None);
    }
    Ok(Some(downcast_state::<AvgState>(value.into_state()?)?))
}

fn avg_f64_trans(frame: &mut FunctionFrame) -> Result<()> {
    let mut state = take_avg_state(frame, 0)?.unwrap_or_default();
    if !frame.arg_is_null(1) {
        let v = datum_f64(frame.arg_datum(1)?)?;
        state.sum += v;
        state.count += 1;
    }
    frame.set_result_state(state);
    Ok(())
}

fn avg_f64_combine(frame: &mut FunctionFrame) -> Result<()> {
    let state = take_avg_state(frame, 0)?;
    let incoming = take_avg_state(frame, 1)?;
    match (state, incoming) {
        (Some(mut state), Some(incoming)) => {
            state.sum += incoming.sum;
            state.count += incoming.count;
            frame.set_result_state(state);
        }
        (Some(state), None) => frame.set_result_state(state),
        (None, Some(incoming)) => frame.set_result_state(incoming),
        (None, None) => frame.set_result_null(),
    }
    Ok(())
}

fn avg_f64_serial(frame: &mut FunctionFrame) -> Result<()> {
    let state = take_avg_state(frame, 0)?
        .ok_or_else(|| FoldexecError::new("avg serialize called with null state"))?;
    let mut bytes = Vec::with_capacity(16);
    bytes.extend_from_slice(&state.sum.to_le_bytes());
    bytes.extend_from_slice(&state.count.to_le_bytes());
    frame.set_result_datum(Datum::Binary(bytes));
    Ok(())
}

fn avg_f64_deserial(frame: &mut FunctionFrame) -> Result<()> {
    let bytes = match frame.arg_datum(0)? {
        Datum::Binary(bytes) => bytes,
        other => {
            return Err(FoldexecError::new(format!(
                "avg deserialize expected binary datum, got {other}"
            )))
        }
    };
    if bytes.len() != 16 {
        return Err(FoldexecError::new("malformed serialized avg state"));
    }
    let mut sum = [0u8; 8];
    let mut count = [0u8; 8];
    sum.copy_from_slice(&bytes[..8]);
    count.copy_from_slice(&bytes[8..]);
    frame.set_result_state(Box::new(AvgState {
        sum: f64::from_le_bytes(sum),
        count: i64::from_le_bytes(count),
    }));
    Ok(())
}

fn avg_f64_final(frame: &mut FunctionFrame) -> Result<()> {
    let state = match take_avg_state(frame, 0)? {
        Some(state) => state,
        None => {
            frame.set_result_null();
            return Ok(());
        }
    };
    if state.count == 0 {
        frame.set_result_null();
        return Ok(());
    }
    frame.set_result_datum(Datum::Float64(state.sum / state.count as f64));
    Ok(())
}

// array_agg(any)
//
// Expanded transition state grown in place across rows of a group.

#[derive(Debug, Clone, Default)]
pub struct ArrayBuildState {
    pub elements: Vec<Datum>,
}

impl InternalState for ArrayBuildState {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

fn take_array_state(
    frame: &mut FunctionFrame,
    idx: usize,
) -> Result<Option<Box<ArrayBuildState>>> {
    let (value, is_null) = frame.take_arg(idx);
    if is_null {
        return Ok(None);
    }
    Ok(Some(downcast_state::<ArrayBuildState>(value.into_state()?)?))
}

fn array_agg_trans(frame: &mut FunctionFrame) -> Result<()> {
    let mut state = take_array_state(frame, 0)?.unwrap_or_default();
    let elem = frame.arg_datum(1)?.clone();
    state.elements.push(elem);
    frame.set_result_state(state);
    Ok(())
}

fn array_agg_combine(frame: &mut FunctionFrame) -> Result<()> {
    let state = take_array_state(frame, 0)?;
    let incoming = take_array_state(frame, 1)?;
    match (state, incoming) {
        (Some(mut state), Some(mut incoming)) => {
            state.elements.append(&mut incoming.elements);
            frame.set_result_state(state);
        }
        (Some(state), None) => frame.set_result_state(state),
        (None, Some(incoming)) => frame.set_result_state(incoming),
        (None, None) => frame.set_result_null(),
    }
    Ok(())
}

fn array_agg_serial(frame: &mut FunctionFrame) -> Result<()> {
    let state = take_array_state(frame, 0)?
        .ok_or_else(|| FoldexecError::new("array_agg serialize called with null state"))?;
    let mut bytes = Vec::new();
    codec::encode_datum(&Datum::List(state.elements), &mut bytes);
    frame.set_result_datum(Datum::Binary(bytes));
    Ok(())
}

fn array_agg_deserial(frame: &mut FunctionFrame) -> Result<()> {
    let bytes = match frame.arg_datum(0)? {
        Datum::Binary(bytes) => bytes.clone(),
        other => {
            return Err(FoldexecError::new(format!(
                "array_agg deserialize expected binary datum, got {other}"
            )))
        }
    };
    let mut input = bytes.as_slice();
    let elements = match codec::decode_datum(&mut input)? {
        Datum::List(elements) => elements,
        other => {
            return Err(FoldexecError::new(format!(
                "malformed serialized array state: {other}"
            )))
        }
    };
    frame.set_result_state(Box::new(ArrayBuildState { elements }));
    Ok(())
}

fn array_agg_final(frame: &mut FunctionFrame) -> Result<()> {
    match take_array_state(frame, 0)? {
        Some(state) => frame.set_result_datum(Datum::List(state.elements)),
        None => frame.set_result_null(),
    }
    Ok(())
}

// percentile_disc(fraction) WITHIN GROUP (ORDER BY value)
//
// Ordered-set aggregate. Rows reach the transition function in sort order,
// so the collected element list is already ordered at finalize time.

fn percentile_disc_trans(frame: &mut FunctionFrame) -> Result<()> {
    let mut state = take_array_state(frame, 0)?.unwrap_or_default();
    if !frame.arg_is_null(1) {
        let elem = frame.arg_datum(1)?.clone();
        state.elements.push(elem);
    }
    frame.set_result_state(state);
    Ok(())
}

fn percentile_disc_final(frame: &mut FunctionFrame) -> Result<()> {
    let state = match take_array_state(frame, 0)? {
        Some(state) => state,
        None => {
            frame.set_result_null();
            return Ok(());
        }
    };
    if state.elements.is_empty() || frame.arg_is_null(1) {
        frame.set_result_null();
        return Ok(());
    }
    let fraction = datum_f64(frame.arg_datum(1)?)?;
    if !(0.0..=1.0).contains(&fraction) {
        return Err(FoldexecError::new(format!(
            "percentile fraction must be between 0 and 1, got {fraction}"
        )));
    }

    let n = state.elements.len();
    let rank = (fraction * n as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(n - 1);
    frame.set_result_datum(state.elements[idx].clone());
    Ok(())
}

/// All built-in aggregates.
pub fn builtin_aggregates() -> Vec<AggregateSpec> {
    vec![
        AggregateSpec {
            name: "sum_i64",
            kind: AggKind::Normal,
            trans_fn: sum_i64_trans,
            trans_fn_strict: true,
            final_fn: None,
            final_fn_strict: false,
            combine_fn: Some(sum_i64_trans),
            combine_fn_strict: true,
            serial_fn: None,
            serial_fn_strict: false,
            deserial_fn: None,
            deserial_fn_strict: false,
            trans_type: DataType::Int64,
            result_type: DataType::Int64,
            init_value: None,
            num_args: 1,
            num_direct_args: 0,
            final_extra_args: false,
        },
        AggregateSpec {
            name: "count",
            kind: AggKind::Normal,
            trans_fn: count_trans,
            trans_fn_strict: true,
            final_fn: None,
            final_fn_strict: false,
            combine_fn: Some(count_combine),
            combine_fn_strict: true,
            serial_fn: None,
            serial_fn_strict: false,
            deserial_fn: None,
            deserial_fn_strict: false,
            trans_type: DataType::Int64,
            result_type: DataType::Int64,
            init_value: Some(Datum::Int64(0)),
            num_args: 1,
            num_direct_args: 0,
            final_extra_args: false,
        },
        AggregateSpec {
            name: "count_star",
            kind: AggKind::Normal,
            trans_fn: count_trans,
            trans_fn_strict: false,
            final_fn: None,
            final_fn_strict: false,
            combine_fn: Some(count_combine),
            combine_fn_strict: true,
            serial_fn: None,
            serial_fn_strict: false,
            deserial_fn: None,
            deserial_fn_strict: false,
            trans_type: DataType::Int64,
            result_type: DataType::Int64,
            init_value: Some(Datum::Int64(0)),
            num_args: 0,
            num_direct_args: 0,
            final_extra_args: false,
        },
        AggregateSpec {
            name: "min_i64",
            kind: AggKind::Normal,
            trans_fn: min_i64_trans,
            trans_fn_strict: true,
            final_fn: None,
            final_fn_strict: false,
            combine_fn: Some(min_i64_trans),
            combine_fn_strict: true,
            serial_fn: None,
            serial_fn_strict: false,
            deserial_fn: None,
            deserial_fn_strict: false,
            trans_type: DataType::Int64,
            result_type: DataType::Int64,
            init_value: None,
            num_args: 1,
            num_direct_args: 0,
            final_extra_args: false,
        },
        AggregateSpec {
            name: "max_i64",
            kind: AggKind::Normal,
            trans_fn: max_i64_trans,
            trans_fn_strict: true,
            final_fn: None,
            final_fn_strict: false,
            combine_fn: Some(max_i64_trans),
            combine_fn_strict: true,
            serial_fn: None,
            serial_fn_strict: false,
            deserial_fn: None,
            deserial_fn_strict: false,
            trans_type: DataType::Int64,
            result_type: DataType::Int64,
            init_value: None,
            num_args: 1,
            num_direct_args: 0,
            final_extra_args: false,
        },
        AggregateSpec {
            name: "avg_f64",
            kind: AggKind::Normal,
            trans_fn: avg_f64_trans,
            trans_fn_strict: false,
            final_fn: Some(avg_f64_final),
            final_fn_strict: false,
            combine_fn: Some(avg_f64_combine),
            combine_fn_strict: false,
            serial_fn: Some(avg_f64_serial),
            serial_fn_strict: true,
            deserial_fn: Some(avg_f64_deserial),
            deserial_fn_strict: true,
            trans_type: DataType::Internal,
            result_type: DataType::Float64,
            init_value: None,
            num_args: 1,
            num_direct_args: 0,
            final_extra_args: false,
        },
        AggregateSpec {
            name: "array_agg",
            kind: AggKind::Normal,
            trans_fn: array_agg_trans,
            trans_fn_strict: false,
            final_fn: Some(array_agg_final),
            final_fn_strict: false,
            combine_fn: Some(array_agg_combine),
            combine_fn_strict: false,
            serial_fn: Some(array_agg_serial),
            serial_fn_strict: true,
            deserial_fn: Some(array_agg_deserial),
            deserial_fn_strict: true,
            trans_type: DataType::Internal,
            result_type: DataType::List,
            init_value: None,
            num_args: 1,
            num_direct_args: 0,
            final_extra_args: false,
        },
        AggregateSpec {
            name: "percentile_disc",
            kind: AggKind::OrderedSet,
            trans_fn: percentile_disc_trans,
            trans_fn_strict: false,
            final_fn: Some(percentile_disc_final),
            final_fn_strict: false,
            combine_fn: None,
            combine_fn_strict: false,
            serial_fn: None,
            serial_fn_strict: false,
            deserial_fn: None,
            deserial_fn_strict: false,
            trans_type: DataType::Internal,
            result_type: DataType::Float64,
            init_value: None,
            num_args: 1,
            num_direct_args: 1,
            final_extra_args: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::AggValue;

    fn frame_with_state(state: Option<AvgState>) -> FunctionFrame {
        let mut frame = FunctionFrame::new(2);
        if let Some(state) = state {
            frame.set_arg(0, AggValue::State(Box::new(state)), false);
        }
        frame
    }

    #[test]
    fn avg_accumulates_and_ignores_nulls() {
        let mut frame = frame_with_state(None);
        frame.set_arg_datum(1, Datum::Float64(10.0));
        avg_f64_trans(&mut frame).unwrap();
        let (value, is_null) = frame.take_result().unwrap();
        assert!(!is_null);

        let mut frame = FunctionFrame::new(2);
        frame.set_arg(0, value, false);
        frame.set_arg_datum(1, Datum::Null);
        avg_f64_trans(&mut frame).unwrap();
        let (value, _) = frame.take_result().unwrap();

        let state = downcast_state::<AvgState>(value.into_state().unwrap()).unwrap();
        assert_eq!(AvgState { sum: 10.0, count: 1 }, *state);
    }

    #[test]
    fn avg_state_serialization_round_trips() {
        let state = AvgState {
            sum: 12.5,
            count: 3,
        };

        let mut frame = frame_with_state(Some(state));
        avg_f64_serial(&mut frame).unwrap();
        let (serialized, is_null) = frame.take_result().unwrap();
        assert!(!is_null);

        let mut frame = FunctionFrame::new(1);
        frame.set_arg(0, serialized, false);
        avg_f64_deserial(&mut frame).unwrap();
        let (value, _) = frame.take_result().unwrap();

        let decoded = downcast_state::<AvgState>(value.into_state().unwrap()).unwrap();
        assert_eq!(state, *decoded);
    }

    #[test]
    fn avg_final_of_empty_state_is_null() {
        let mut frame = frame_with_state(Some(AvgState::default()));
        avg_f64_final(&mut frame).unwrap();
        let (_, is_null) = frame.take_result().unwrap();
        assert!(is_null);
    }

    #[test]
    fn array_agg_combines_in_order() {
        let left = ArrayBuildState {
            elements: vec![Datum::Int64(1), Datum::Int64(2)],
        };
        let right = ArrayBuildState {
            elements: vec![Datum::Int64(3)],
        };

        let mut frame = FunctionFrame::new(2);
        frame.set_arg(0, AggValue::State(Box::new(left)), false);
        frame.set_arg(1, AggValue::State(Box::new(right)), false);
        array_agg_combine(&mut frame).unwrap();

        let (value, _) = frame.take_result().unwrap();
        let state = downcast_state::<ArrayBuildState>(value.into_state().unwrap()).unwrap();
        assert_eq!(
            vec![Datum::Int64(1), Datum::Int64(2), Datum::Int64(3)],
            state.elements
        );
    }

    #[test]
    fn percentile_picks_discrete_value() {
        let state = ArrayBuildState {
            elements: vec![Datum::Int64(10), Datum::Int64(20), Datum::Int64(30)],
        };

        let mut frame = FunctionFrame::new(3);
        frame.set_arg(0, AggValue::State(Box::new(state)), false);
        frame.set_arg_datum(1, Datum::Float64(0.5));
        percentile_disc_final(&mut frame).unwrap();

        let (value, is_null) = frame.take_result().unwrap();
        assert!(!is_null);
        assert_eq!(&Datum::Int64(20), value.as_datum().unwrap());
    }
}
