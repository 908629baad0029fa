// src/expr/calculator.rs
//! Pure evaluation functions over per-period aggregates.
//!
//! An aggregate of `None` marks a period with no usable data (UNDEFINED).
//! `compare_thresh` turns a vector of per-period aggregates into a
//! three-valued state: ALARM only when every period is defined and
//! satisfies the operator, OK as soon as one defined period fails it, and
//! UNDETERMINED otherwise.

use super::parser::{AggFunc, CompareOp, LogicOp};
use crate::types::AlarmState;

/// Aggregate a window of sample values.
///
/// `COUNT` of an empty window is 0; every other function is undefined over
/// an empty window.
pub fn aggregate(func: AggFunc, values: &[f64]) -> Option<f64> {
    if values.is_empty() && func != AggFunc::Count {
        return None;
    }
    let result = match func {
        AggFunc::Sum => values.iter().sum(),
        AggFunc::Avg => values.iter().sum::<f64>() / values.len() as f64,
        AggFunc::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        AggFunc::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
        AggFunc::Count => values.len() as f64,
    };
    Some(result)
}

/// State of one sub-alarm given its per-period aggregates.
pub fn compare_thresh(values: &[Option<f64>], op: CompareOp, threshold: f64) -> AlarmState {
    for value in values.iter().flatten() {
        if !op.satisfied_by(*value, threshold) {
            return AlarmState::Ok;
        }
    }
    if values.iter().any(Option::is_none) {
        AlarmState::Undetermined
    } else {
        AlarmState::Alarm
    }
}

/// Three-valued boolean combination of child states.
pub fn combine(op: LogicOp, states: &[AlarmState]) -> AlarmState {
    match op {
        LogicOp::And => {
            let mut state = AlarmState::Alarm;
            for s in states {
                match s {
                    AlarmState::Ok => return AlarmState::Ok,
                    AlarmState::Undetermined => state = AlarmState::Undetermined,
                    AlarmState::Alarm => {}
                }
            }
            state
        }
        LogicOp::Or => {
            let mut state = AlarmState::Ok;
            for s in states {
                match s {
                    AlarmState::Alarm => return AlarmState::Alarm,
                    AlarmState::Undetermined => state = AlarmState::Undetermined,
                    AlarmState::Ok => {}
                }
            }
            state
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AlarmState::*;

    #[test]
    fn aggregate_functions() {
        let data = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(aggregate(AggFunc::Sum, &data), Some(10.0));
        assert_eq!(aggregate(AggFunc::Avg, &data), Some(2.5));
        assert_eq!(aggregate(AggFunc::Max, &data), Some(4.0));
        assert_eq!(aggregate(AggFunc::Min, &data), Some(1.0));
        assert_eq!(aggregate(AggFunc::Count, &data), Some(4.0));
    }

    #[test]
    fn aggregate_empty_window() {
        assert_eq!(aggregate(AggFunc::Count, &[]), Some(0.0));
        for func in [AggFunc::Sum, AggFunc::Avg, AggFunc::Max, AggFunc::Min] {
            assert_eq!(aggregate(func, &[]), None);
        }
    }

    #[test]
    fn compare_alarm_requires_every_period() {
        let v = [Some(20.0), Some(30.0), Some(11.0)];
        assert_eq!(compare_thresh(&v, CompareOp::Gt, 10.0), Alarm);

        let v = [Some(20.0), Some(5.0), Some(30.0)];
        assert_eq!(compare_thresh(&v, CompareOp::Gt, 10.0), Ok);
    }

    #[test]
    fn compare_undefined_period_is_undetermined() {
        let v = [Some(20.0), None, Some(30.0)];
        assert_eq!(compare_thresh(&v, CompareOp::Gt, 10.0), Undetermined);
        // but a failing defined period wins over the undefined one
        let v = [Some(2.0), None];
        assert_eq!(compare_thresh(&v, CompareOp::Gt, 10.0), Ok);
        let v = [None];
        assert_eq!(compare_thresh(&v, CompareOp::Gt, 10.0), Undetermined);
    }

    #[test]
    fn compare_boundary_both_directions() {
        // value equal to the threshold: strict operators fail, inclusive pass
        assert_eq!(compare_thresh(&[Some(10.0)], CompareOp::Gt, 10.0), Ok);
        assert_eq!(compare_thresh(&[Some(10.0)], CompareOp::Gte, 10.0), Alarm);
        assert_eq!(compare_thresh(&[Some(10.0)], CompareOp::Lt, 10.0), Ok);
        assert_eq!(compare_thresh(&[Some(10.0)], CompareOp::Lte, 10.0), Alarm);
    }

    #[test]
    fn combine_identities() {
        for x in [Ok, Alarm, Undetermined] {
            assert_eq!(combine(LogicOp::And, &[x]), x);
            assert_eq!(combine(LogicOp::Or, &[x]), x);
        }
    }

    #[test]
    fn combine_dominators() {
        assert_eq!(combine(LogicOp::And, &[Ok, Alarm, Undetermined]), Ok);
        assert_eq!(combine(LogicOp::Or, &[Ok, Alarm, Undetermined]), Alarm);
    }

    #[test]
    fn combine_undetermined_propagates() {
        assert_eq!(combine(LogicOp::And, &[Alarm, Undetermined]), Undetermined);
        assert_eq!(combine(LogicOp::Or, &[Ok, Undetermined]), Undetermined);
    }

    #[test]
    fn combine_all_agree() {
        assert_eq!(combine(LogicOp::And, &[Alarm, Alarm]), Alarm);
        assert_eq!(combine(LogicOp::Or, &[Ok, Ok]), Ok);
    }
}
