//! The shared condition-tree type and its evaluator.
//!
//! Evolves the teacher's `signals/registry.rs` tagged-enum idiom
//! (`#[serde(tag = "type")]` over a fixed list of signal structs) from a
//! catalog of fixed OHLCV predicates into the validator's eight-constructor
//! condition tree, each variant carrying its own operands instead of
//! dispatching to a `Box<dyn SignalFn>`.

pub mod indicators;
pub mod registry;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use self::indicators::IndicatorFrame;

/// Indicator parameters, keyed by name (`period`, `length`, `std`, ...).
/// A `BTreeMap` gives a canonical iteration order for free, which the
/// validator's contradiction pass (spec.md §4.2 step 7) relies on to
/// fingerprint `(field, params)` groups.
pub type Params = BTreeMap<String, OrderedFloat<f64>>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
}

impl Operator {
    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Gt => lhs > rhs,
            Self::Lt => lhs < rhs,
            Self::Ge => lhs >= rhs,
            Self::Le => lhs <= rhs,
        }
    }

    /// Flips direction, used when auto-swapping the two sides of a
    /// `Field` comparison (spec.md §4.2 step 4).
    pub fn invert(self) -> Self {
        match self {
            Self::Gt => Self::Lt,
            Self::Lt => Self::Gt,
            Self::Ge => Self::Le,
            Self::Le => Self::Ge,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsecutiveDirection {
    Rising,
    Falling,
}

/// One leaf predicate in a strategy's condition tree. `buy_conditions` are
/// joined with AND semantics, `sell_conditions` with OR — that join is the
/// caller's responsibility, not this type's.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "compare_type", rename_all = "snake_case")]
pub enum Condition {
    Value {
        field: String,
        #[serde(default)]
        params: Params,
        operator: Operator,
        compare_value: f64,
    },
    Field {
        field: String,
        #[serde(default)]
        params: Params,
        operator: Operator,
        compare_field: String,
        #[serde(default)]
        compare_params: Params,
    },
    LookbackMin {
        field: String,
        #[serde(default)]
        params: Params,
        operator: Operator,
        lookback_field: String,
        lookback_n: usize,
    },
    LookbackMax {
        field: String,
        #[serde(default)]
        params: Params,
        operator: Operator,
        lookback_field: String,
        lookback_n: usize,
    },
    LookbackValue {
        field: String,
        #[serde(default)]
        params: Params,
        operator: Operator,
        lookback_field: String,
        lookback_n: usize,
        compare_value: f64,
    },
    Consecutive {
        field: String,
        #[serde(default)]
        params: Params,
        consecutive_type: ConsecutiveDirection,
        lookback_n: usize,
    },
    PctDiff {
        field: String,
        #[serde(default)]
        params: Params,
        operator: Operator,
        compare_field: String,
        #[serde(default)]
        compare_params: Params,
        compare_value: f64,
    },
    PctChange {
        field: String,
        #[serde(default)]
        params: Params,
        operator: Operator,
        lookback_n: usize,
        compare_value: f64,
    },
}

impl Condition {
    pub fn field(&self) -> &str {
        match self {
            Self::Value { field, .. }
            | Self::Field { field, .. }
            | Self::LookbackMin { field, .. }
            | Self::LookbackMax { field, .. }
            | Self::LookbackValue { field, .. }
            | Self::Consecutive { field, .. }
            | Self::PctDiff { field, .. }
            | Self::PctChange { field, .. } => field,
        }
    }

    pub fn params(&self) -> &Params {
        match self {
            Self::Value { params, .. }
            | Self::Field { params, .. }
            | Self::LookbackMin { params, .. }
            | Self::LookbackMax { params, .. }
            | Self::LookbackValue { params, .. }
            | Self::Consecutive { params, .. }
            | Self::PctDiff { params, .. }
            | Self::PctChange { params, .. } => params,
        }
    }

    /// The second field this condition references, if any — `compare_field`
    /// for `Field`/`PctDiff`, `lookback_field` for the lookback variants.
    pub fn secondary_field(&self) -> Option<&str> {
        match self {
            Self::Field { compare_field, .. } | Self::PctDiff { compare_field, .. } => {
                Some(compare_field)
            }
            Self::LookbackMin { lookback_field, .. }
            | Self::LookbackMax { lookback_field, .. }
            | Self::LookbackValue { lookback_field, .. } => Some(lookback_field),
            Self::Value { .. } | Self::Consecutive { .. } | Self::PctChange { .. } => None,
        }
    }

    pub fn operator(&self) -> Option<Operator> {
        match self {
            Self::Value { operator, .. }
            | Self::Field { operator, .. }
            | Self::LookbackMin { operator, .. }
            | Self::LookbackMax { operator, .. }
            | Self::LookbackValue { operator, .. }
            | Self::PctDiff { operator, .. }
            | Self::PctChange { operator, .. } => Some(*operator),
            Self::Consecutive { .. } => None,
        }
    }

    pub fn compare_value(&self) -> Option<f64> {
        match self {
            Self::Value { compare_value, .. }
            | Self::LookbackValue { compare_value, .. }
            | Self::PctDiff { compare_value, .. }
            | Self::PctChange { compare_value, .. } => Some(*compare_value),
            Self::Field { .. } | Self::Consecutive { .. } => None,
        }
    }

    /// Every `(field, params)` pair this condition needs materialized,
    /// used to build the union indicator-config the Backtest Engine and
    /// Signal Engine both compute once per day/window (spec.md §4.3 step 1,
    /// §4.4).
    pub fn required_fields(&self) -> Vec<(&str, &Params)> {
        let mut out = vec![(self.field(), self.params())];
        match self {
            Self::Field {
                compare_field,
                compare_params,
                ..
            }
            | Self::PctDiff {
                compare_field,
                compare_params,
                ..
            } => out.push((compare_field, compare_params)),
            Self::LookbackMin {
                lookback_field,
                params,
                ..
            }
            | Self::LookbackMax {
                lookback_field,
                params,
                ..
            }
            | Self::LookbackValue {
                lookback_field,
                params,
                ..
            } => out.push((lookback_field, params)),
            Self::Value { .. } | Self::Consecutive { .. } | Self::PctChange { .. } => {}
        }
        out
    }

    /// Evaluate this leaf against bar index `idx` (0-based, the latest bar
    /// being `frame.len() - 1`) of an already-materialized indicator frame.
    /// Returns `false` when a required series is too short to have a value
    /// at `idx` (spec.md treats "not enough history" as simply untriggered,
    /// never an error).
    pub fn evaluate(&self, frame: &IndicatorFrame, idx: usize) -> bool {
        match self {
            Self::Value {
                field,
                params,
                operator,
                compare_value,
            } => frame
                .value_at(field, params, idx)
                .is_some_and(|v| operator.apply(v, *compare_value)),
            Self::Field {
                field,
                params,
                operator,
                compare_field,
                compare_params,
            } => {
                let lhs = frame.value_at(field, params, idx);
                let rhs = frame.value_at(compare_field, compare_params, idx);
                matches!((lhs, rhs), (Some(l), Some(r)) if operator.apply(l, r))
            }
            Self::LookbackMin {
                field,
                params,
                operator,
                lookback_field,
                lookback_n,
            } => {
                let lhs = frame.value_at(field, params, idx);
                let window_min = frame.window_min(lookback_field, params, idx, *lookback_n);
                matches!((lhs, window_min), (Some(l), Some(m)) if operator.apply(l, m))
            }
            Self::LookbackMax {
                field,
                params,
                operator,
                lookback_field,
                lookback_n,
            } => {
                let lhs = frame.value_at(field, params, idx);
                let window_max = frame.window_max(lookback_field, params, idx, *lookback_n);
                matches!((lhs, window_max), (Some(l), Some(m)) if operator.apply(l, m))
            }
            Self::LookbackValue {
                field,
                params,
                operator,
                lookback_field,
                lookback_n,
                compare_value,
            } => {
                let Some(back_idx) = idx.checked_sub(*lookback_n) else {
                    return false;
                };
                let _ = field; // `field` unused: lookback_value compares the lookback field to a constant
                frame
                    .value_at(lookback_field, params, back_idx)
                    .is_some_and(|v| operator.apply(v, *compare_value))
            }
            Self::Consecutive {
                field,
                params,
                consecutive_type,
                lookback_n,
            } => frame.is_consecutive(field, params, idx, *lookback_n, *consecutive_type),
            Self::PctDiff {
                field,
                params,
                operator,
                compare_field,
                compare_params,
                compare_value,
            } => {
                let lhs = frame.value_at(field, params, idx);
                let rhs = frame.value_at(compare_field, compare_params, idx);
                matches!((lhs, rhs), (Some(l), Some(r)) if r != 0.0
                    && operator.apply((l - r) / r * 100.0, *compare_value))
            }
            Self::PctChange {
                field,
                params,
                operator,
                lookback_n,
                compare_value,
            } => {
                let Some(back_idx) = idx.checked_sub(*lookback_n) else {
                    return false;
                };
                let now = frame.value_at(field, params, idx);
                let then = frame.value_at(field, params, back_idx);
                matches!((now, then), (Some(n), Some(p)) if p != 0.0
                    && operator.apply((n - p) / p * 100.0, *compare_value))
            }
        }
    }
}

/// Evaluate a set of conditions with AND semantics (buy side).
pub fn all_true(conditions: &[Condition], frame: &IndicatorFrame, idx: usize) -> bool {
    !conditions.is_empty() && conditions.iter().all(|c| c.evaluate(frame, idx))
}

/// Evaluate a set of conditions with OR semantics (sell side).
pub fn any_true(conditions: &[Condition], frame: &IndicatorFrame, idx: usize) -> bool {
    conditions.iter().any(|c| c.evaluate(frame, idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::DailyBar;
    use chrono::NaiveDate;

    fn bars(closes: &[f64]) -> Vec<DailyBar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| DailyBar {
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i as i64),
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 1000.0,
                amount: c * 1000.0,
            })
            .collect()
    }

    #[test]
    fn value_condition_true_and_false() {
        let bars = bars(&[10.0, 20.0, 30.0]);
        let frame = IndicatorFrame::new(&bars);
        let cond = Condition::Value {
            field: "close".into(),
            params: Params::new(),
            operator: Operator::Gt,
            compare_value: 25.0,
        };
        assert!(cond.evaluate(&frame, 2));
        assert!(!cond.evaluate(&frame, 0));
    }

    #[test]
    fn lookback_value_out_of_range_is_false_not_panic() {
        let bars = bars(&[10.0, 20.0]);
        let frame = IndicatorFrame::new(&bars);
        let cond = Condition::LookbackValue {
            field: "close".into(),
            params: Params::new(),
            operator: Operator::Gt,
            lookback_field: "close".into(),
            lookback_n: 5,
            compare_value: 0.0,
        };
        assert!(!cond.evaluate(&frame, 1));
    }

    #[test]
    fn and_semantics_requires_every_condition() {
        let bars = bars(&[10.0, 20.0, 30.0]);
        let frame = IndicatorFrame::new(&bars);
        let conds = vec![
            Condition::Value {
                field: "close".into(),
                params: Params::new(),
                operator: Operator::Gt,
                compare_value: 5.0,
            },
            Condition::Value {
                field: "close".into(),
                params: Params::new(),
                operator: Operator::Gt,
                compare_value: 25.0,
            },
        ];
        assert!(all_true(&conds, &frame, 2));
        assert!(!all_true(&conds, &frame, 1));
    }

    #[test]
    fn empty_conditions_never_trigger_and() {
        let bars = bars(&[10.0]);
        let frame = IndicatorFrame::new(&bars);
        assert!(!all_true(&[], &frame, 0));
    }
}
