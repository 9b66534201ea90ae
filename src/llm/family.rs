//! Strategy family grouping for the Scheduled Pipeline's optional
//! AI family selector (spec.md §4.5 step 5). Grounded on
//! `api/services/strategy_selector.py`'s `build_family_summary`: strip an
//! `[AI...]` prefix and trailing parameter-tuning suffixes from a strategy
//! name to get its family, group variants by that name, and keep the
//! best-scoring variant as the family's representative. The original's
//! suffix list also covers a handful of Chinese free-form tuning tags
//! (`_调参`, `_紧止损`, ...); those aren't modeled here since this crate's
//! generated strategy names only carry the ASCII parameter tags.

use crate::db::models::Strategy;
use crate::llm::FamilyStats;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static AI_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[AI[^\]]*\]\s*").unwrap());
static PARAM_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"_(SL|TP|MHD)\d+|_v\d+").unwrap());

/// Strip the `[AI...]` prefix and trailing parameter-tuning suffixes, e.g.
/// `"[AI] PSAR_trend_SL10_TP14_v2"` -> `"PSAR_trend"`.
pub fn family_name(strategy_name: &str) -> String {
    let mut name = AI_PREFIX.replace(strategy_name, "").trim().to_string();
    loop {
        let stripped = PARAM_SUFFIX.replace_all(&name, "");
        if stripped == name {
            break;
        }
        name = stripped.into_owned();
    }
    name
}

/// Group `strategies` by family, scoring each by `scores` (defaulting to
/// `0.0` for a strategy with no recorded backtest score), and keep the
/// best-scoring variant as each family's representative. Sorted by score
/// descending, matching the original's "top families first" ordering.
pub fn build_family_summary(strategies: &[Strategy], scores: &HashMap<i64, f64>) -> Vec<FamilyStats> {
    let mut families: HashMap<String, Vec<&Strategy>> = HashMap::new();
    for s in strategies {
        families.entry(family_name(&s.name)).or_default().push(s);
    }

    let mut out: Vec<FamilyStats> = families
        .into_iter()
        .map(|(family, variants)| {
            let score_of = |s: &&Strategy| scores.get(&s.id).copied().unwrap_or(0.0);
            let best = variants
                .iter()
                .max_by(|a, b| score_of(a).partial_cmp(&score_of(b)).unwrap_or(std::cmp::Ordering::Equal))
                .copied()
                .expect("family group is never empty");
            FamilyStats {
                family,
                avg_score: score_of(&best),
                best_strategy_id: best.id,
                strategy_ids: variants.iter().map(|s| s.id).collect(),
            }
        })
        .collect();

    out.sort_by(|a, b| b.avg_score.partial_cmp(&a.avg_score).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// Top-`n` families' representative strategy ids, used when no family
/// selector is configured or it fails (spec.md §4.5 step 5's fallback).
pub fn fallback_top_n(summaries: &[FamilyStats], n: usize) -> Vec<i64> {
    summaries.iter().take(n).map(|f| f.best_strategy_id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ExitConfig;

    fn strategy(id: i64, name: &str) -> Strategy {
        Strategy {
            id,
            name: name.into(),
            description: String::new(),
            buy_conditions: vec![],
            sell_conditions: vec![],
            exit_config: ExitConfig::default(),
            portfolio_config: None,
            category: None,
            source_experiment_id: None,
        }
    }

    #[test]
    fn family_name_strips_ai_prefix_and_parameter_suffixes() {
        assert_eq!(family_name("[AI] PSAR_trend_SL10_TP14_v2"), "PSAR_trend");
        assert_eq!(family_name("[AI-bull] KDJ_ATR_stop"), "KDJ_ATR_stop");
        assert_eq!(family_name("KDJ_cross_v3"), "KDJ_cross");
    }

    #[test]
    fn build_family_summary_keeps_the_best_scoring_variant() {
        let strategies = vec![
            strategy(1, "[AI] PSAR_trend_SL10"),
            strategy(2, "[AI] PSAR_trend_SL20"),
            strategy(3, "[AI] KDJ_cross_v1"),
        ];
        let scores = HashMap::from([(1, 10.0), (2, 40.0), (3, 5.0)]);
        let summary = build_family_summary(&strategies, &scores);

        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].family, "PSAR_trend");
        assert_eq!(summary[0].best_strategy_id, 2);
        assert_eq!(summary[0].strategy_ids.len(), 2);
        assert_eq!(summary[1].family, "KDJ_cross");
        assert_eq!(summary[1].best_strategy_id, 3);
    }

    #[test]
    fn fallback_top_n_takes_the_best_families_first() {
        let summaries = vec![
            FamilyStats { family: "a".into(), avg_score: 90.0, best_strategy_id: 1, strategy_ids: vec![1] },
            FamilyStats { family: "b".into(), avg_score: 50.0, best_strategy_id: 2, strategy_ids: vec![2] },
            FamilyStats { family: "c".into(), avg_score: 10.0, best_strategy_id: 3, strategy_ids: vec![3] },
        ];
        assert_eq!(fallback_top_n(&summaries, 2), vec![1, 2]);
    }
}
