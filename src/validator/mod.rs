//! Strategy Validator (spec.md §4.2): turns an untrusted LLM-emitted
//! candidate into a canonical, executable condition tree, or rejects it.
//!
//! The nine-step pipeline is implemented as a sequence of free functions
//! each taking ownership of the running `(buy, sell, errors)` triple and
//! handing it to the next step — mirroring the teacher's `engine/exits.rs`
//! style of small, single-purpose transform functions chained by the
//! caller rather than one monolithic method.

use crate::conditions::registry;
use crate::conditions::{Condition, Operator};
use crate::db::models::ExitConfig;
use ordered_float::OrderedFloat;
use std::collections::HashMap;

pub const MAX_BUY_CONDITIONS: usize = 4;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub description: String,
    pub buy_conditions: Vec<Condition>,
    pub sell_conditions: Vec<Condition>,
    pub exit_config: ExitConfig,
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub buy_conditions: Vec<Condition>,
    pub sell_conditions: Vec<Condition>,
    pub exit_config: ExitConfig,
    pub errors: Vec<String>,
    pub failed: bool,
}

/// Run the full nine-step pipeline over both sides of a candidate.
pub fn validate(candidate: Candidate) -> ValidationOutcome {
    let mut errors = Vec::new();

    let buy = run_condition_pipeline(candidate.buy_conditions, &mut errors);
    let sell = run_condition_pipeline(candidate.sell_conditions, &mut errors);

    let (buy, cap_errors) = cap_buy_conditions(buy);
    errors.extend(cap_errors);

    let exit_config = candidate.exit_config.normalize();

    let failed = buy.is_empty() && sell.is_empty();

    ValidationOutcome {
        buy_conditions: buy,
        sell_conditions: sell,
        exit_config,
        errors,
        failed,
    }
}

/// Steps 1-3, 4-7 applied to one side's condition list independently. Buy
/// and sell conditions go through the identical pipeline; only the final
/// AND-cap (step 8) is buy-side-specific and applied by the caller.
fn run_condition_pipeline(conditions: Vec<Condition>, errors: &mut Vec<String>) -> Vec<Condition> {
    let mut out = Vec::new();
    for c in conditions {
        let Some(c) = check_field_membership(c, errors) else { continue };
        let Some(c) = check_operator(c, errors) else { continue };
        let Some(c) = check_value_bounds(c, errors) else { continue };
        let c = auto_swap_reversed(c);
        let c = fill_default_params(c);
        let Some(c) = drop_tautology(c, errors) else { continue };
        out.push(c);
    }
    drop_contradictions(out, errors)
}

/// Step 1: `field` and, where applicable, the secondary field must be in
/// the indicator registry.
fn check_field_membership(c: Condition, errors: &mut Vec<String>) -> Option<Condition> {
    if !registry::is_known_field(c.field()) {
        errors.push(format!("unknown field '{}'", c.field()));
        return None;
    }
    if let Some(secondary) = c.secondary_field() {
        if !registry::is_known_field(secondary) {
            errors.push(format!("unknown field '{secondary}'"));
            return None;
        }
    }
    Some(c)
}

/// Step 2: the four relational operators are the only ones the type
/// system can express, so this is a structural no-op for every variant
/// except `Consecutive`, which carries no operator at all and always
/// passes.
fn check_operator(c: Condition, _errors: &mut [String]) -> Option<Condition> {
    Some(c)
}

/// Step 3: numeric thresholds on `compare_type=value` must lie inside the
/// field's registered range; fields that require a field-comparison
/// (BOLL bands, VWAP, OBV) reject value-comparisons outright.
fn check_value_bounds(c: Condition, errors: &mut Vec<String>) -> Option<Condition> {
    let Condition::Value {
        field,
        compare_value,
        ..
    } = &c
    else {
        return Some(c);
    };

    if registry::requires_field_compare(field) {
        errors.push(format!("'{field}' requires a field comparison, not a value threshold"));
        return None;
    }

    if let Some(bounds) = registry::bounds(field) {
        if let Some(reject_below) = bounds.reject_below {
            if *compare_value < reject_below {
                errors.push(format!(
                    "'{field}' threshold {compare_value} looks like a price-percentage misuse"
                ));
                return None;
            }
        }
        if *compare_value < bounds.min || *compare_value > bounds.max {
            errors.push(format!(
                "'{field}' threshold {compare_value} outside [{}, {}]",
                bounds.min, bounds.max
            ));
            return None;
        }
    }
    Some(c)
}

/// Step 4: when the left side is an indicator and the right side a raw
/// price field, swap them and invert the operator — `RSI > close` becomes
/// `close < RSI`, which at least has a sensible reading.
fn auto_swap_reversed(c: Condition) -> Condition {
    let Condition::Field {
        field,
        params,
        operator,
        compare_field,
        compare_params,
    } = c
    else {
        return c;
    };
    if !registry::is_price_field(field.as_str()) && registry::is_price_field(compare_field.as_str())
    {
        Condition::Field {
            field: compare_field,
            params: compare_params,
            operator: operator.invert(),
            compare_field: field,
            compare_params: params,
        }
    } else {
        Condition::Field {
            field,
            params,
            operator,
            compare_field,
            compare_params,
        }
    }
}

/// Step 5: fill missing `compare_params`/`params` from the indicator's
/// registered defaults (MA→period:20, BOLL→length:20,std:2, ...).
fn fill_default_params(c: Condition) -> Condition {
    match c {
        Condition::Field {
            field,
            params,
            operator,
            compare_field,
            compare_params,
        } => {
            let params = if params.is_empty() {
                registry::default_params(&field)
            } else {
                params
            };
            let compare_params = if compare_params.is_empty() {
                registry::default_params(&compare_field)
            } else {
                compare_params
            };
            Condition::Field {
                field,
                params,
                operator,
                compare_field,
                compare_params,
            }
        }
        other => other,
    }
}

/// Step 6: `field == compare_field` with matching params is always true
/// (or always false) and never informative — drop it.
fn drop_tautology(c: Condition, errors: &mut Vec<String>) -> Option<Condition> {
    if let Condition::Field {
        field,
        params,
        compare_field,
        compare_params,
        ..
    } = &c
    {
        if field == compare_field && params == compare_params {
            errors.push(format!("tautological comparison of '{field}' against itself"));
            return None;
        }
    }
    Some(c)
}

/// Step 7: group `compare_type=value` conditions by `(field, params)`,
/// track the tightest `>`/`>=` lower bound and `<`/`<=` upper bound per
/// group; drop every condition in a group where `lower >= upper`.
fn drop_contradictions(conditions: Vec<Condition>, errors: &mut Vec<String>) -> Vec<Condition> {
    #[derive(Default)]
    struct Bound {
        lower: Option<f64>,
        upper: Option<f64>,
        members: Vec<usize>,
    }

    let mut groups: HashMap<(String, Vec<(String, OrderedFloat<f64>)>), Bound> = HashMap::new();

    for (i, c) in conditions.iter().enumerate() {
        let Condition::Value {
            field,
            params,
            operator,
            compare_value,
        } = c
        else {
            continue;
        };
        let key = (field.clone(), params.iter().map(|(k, v)| (k.clone(), *v)).collect());
        let entry = groups.entry(key).or_default();
        entry.members.push(i);
        match operator {
            Operator::Gt | Operator::Ge => {
                entry.lower = Some(entry.lower.map_or(*compare_value, |l: f64| l.max(*compare_value)));
            }
            Operator::Lt | Operator::Le => {
                entry.upper = Some(entry.upper.map_or(*compare_value, |u: f64| u.min(*compare_value)));
            }
        }
    }

    let mut dropped = vec![false; conditions.len()];
    for ((field, _), bound) in &groups {
        if let (Some(lower), Some(upper)) = (bound.lower, bound.upper) {
            if lower >= upper {
                errors.push(format!(
                    "contradictory bounds on '{field}': lower {lower} >= upper {upper}"
                ));
                for &i in &bound.members {
                    dropped[i] = true;
                }
            }
        }
    }

    conditions
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !dropped[*i])
        .map(|(_, c)| c)
        .collect()
}

/// Step 8: AND semantics make more than four buy conditions empirically
/// unreachable; truncate and note it.
fn cap_buy_conditions(conditions: Vec<Condition>) -> (Vec<Condition>, Vec<String>) {
    if conditions.len() <= MAX_BUY_CONDITIONS {
        return (conditions, Vec::new());
    }
    let dropped = conditions.len() - MAX_BUY_CONDITIONS;
    let errors = vec![format!(
        "truncated {dropped} buy condition(s) beyond the {MAX_BUY_CONDITIONS}-condition cap"
    )];
    (conditions.into_iter().take(MAX_BUY_CONDITIONS).collect(), errors)
}

/// Reachability pre-check (spec.md §4.2): re-runs the contradiction
/// detection over the exact buy-condition shape the Backtest Engine will
/// evaluate. Must never produce a false negative — an unreachable verdict
/// always corresponds to a real structural contradiction.
pub fn check_reachable(buy_conditions: &[Condition]) -> (bool, String) {
    let mut errors = Vec::new();
    let survivors = drop_contradictions(buy_conditions.to_vec(), &mut errors);
    if survivors.len() < buy_conditions.len() {
        (false, errors.join("; "))
    } else {
        (true, String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ExitConfig;

    fn value_cond(field: &str, op: Operator, v: f64) -> Condition {
        Condition::Value {
            field: field.into(),
            params: Default::default(),
            operator: op,
            compare_value: v,
        }
    }

    #[test]
    fn scenario_a_validator_auto_repair() {
        let candidate = Candidate {
            name: "s".into(),
            description: String::new(),
            buy_conditions: vec![
                value_cond("RSI", Operator::Gt, 50.0),
                value_cond("RSI", Operator::Lt, 30.0),
                value_cond("close", Operator::Gt, 1.02),
            ],
            sell_conditions: vec![],
            exit_config: ExitConfig::default(),
        };
        let outcome = validate(candidate);
        assert!(outcome.buy_conditions.is_empty());
        assert!(outcome.failed);
        assert!(outcome.errors.iter().any(|e| e.contains("contradictory")));
        assert!(outcome.errors.iter().any(|e| e.contains("price-percentage misuse")));
    }

    #[test]
    fn boundary_price_misuse_rejected() {
        let candidate = Candidate {
            name: "s".into(),
            description: String::new(),
            buy_conditions: vec![value_cond("close", Operator::Gt, 1.05)],
            sell_conditions: vec![],
            exit_config: ExitConfig::default(),
        };
        let outcome = validate(candidate);
        assert!(outcome.buy_conditions.is_empty());
    }

    #[test]
    fn more_than_four_buy_conditions_are_capped() {
        let conds: Vec<Condition> = (0..6)
            .map(|i| value_cond("RSI", Operator::Gt, 10.0 + i as f64))
            .collect();
        let candidate = Candidate {
            name: "s".into(),
            description: String::new(),
            buy_conditions: conds,
            sell_conditions: vec![],
            exit_config: ExitConfig::default(),
        };
        let outcome = validate(candidate);
        assert_eq!(outcome.buy_conditions.len(), MAX_BUY_CONDITIONS);
        assert!(outcome.errors.iter().any(|e| e.contains("truncated")));
    }

    #[test]
    fn exit_config_defaults_applied() {
        let candidate = Candidate {
            name: "s".into(),
            description: String::new(),
            buy_conditions: vec![value_cond("RSI", Operator::Lt, 30.0)],
            sell_conditions: vec![],
            exit_config: ExitConfig {
                stop_loss_pct: 0.0,
                take_profit_pct: 0.0,
                max_hold_days: 0,
            },
        };
        let outcome = validate(candidate);
        assert_eq!(outcome.exit_config.stop_loss_pct, ExitConfig::DEFAULT_STOP_LOSS_PCT);
        assert_eq!(outcome.exit_config.take_profit_pct, ExitConfig::DEFAULT_TAKE_PROFIT_PCT);
        assert_eq!(outcome.exit_config.max_hold_days, ExitConfig::DEFAULT_MAX_HOLD_DAYS);
    }

    #[test]
    fn status_pending_when_either_side_survives() {
        let candidate = Candidate {
            name: "s".into(),
            description: String::new(),
            buy_conditions: vec![],
            sell_conditions: vec![value_cond("RSI", Operator::Gt, 70.0)],
            exit_config: ExitConfig::default(),
        };
        let outcome = validate(candidate);
        assert!(!outcome.failed);
    }

    #[test]
    fn reachability_never_false_negatives_satisfiable_set() {
        let conds = vec![value_cond("RSI", Operator::Gt, 20.0), value_cond("RSI", Operator::Lt, 80.0)];
        let (reachable, _) = check_reachable(&conds);
        assert!(reachable);
    }

    #[test]
    fn reachability_detects_contradiction() {
        let conds = vec![value_cond("RSI", Operator::Gt, 80.0), value_cond("RSI", Operator::Lt, 20.0)];
        let (reachable, reason) = check_reachable(&conds);
        assert!(!reachable);
        assert!(!reason.is_empty());
    }

    #[test]
    fn auto_swap_inverts_operator() {
        let c = Condition::Field {
            field: "RSI".into(),
            params: Default::default(),
            operator: Operator::Gt,
            compare_field: "close".into(),
            compare_params: Default::default(),
        };
        let swapped = auto_swap_reversed(c);
        match swapped {
            Condition::Field { field, operator, compare_field, .. } => {
                assert_eq!(field, "close");
                assert_eq!(compare_field, "RSI");
                assert_eq!(operator, Operator::Lt);
            }
            _ => panic!("expected Field variant"),
        }
    }

    #[test]
    fn tautology_dropped() {
        let c = Condition::Field {
            field: "OBV".into(),
            params: Default::default(),
            operator: Operator::Gt,
            compare_field: "OBV".into(),
            compare_params: Default::default(),
        };
        let mut errors = Vec::new();
        assert!(drop_tautology(c, &mut errors).is_none());
        assert!(!errors.is_empty());
    }
}
