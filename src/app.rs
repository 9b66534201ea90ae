//! Application wiring (spec.md §6): assembles the pool, loaded
//! configuration, and the long-lived collaborators — `Collector`,
//! `Runner`, `Pipeline`, and the LLM trait objects — into one `AppState`
//! shared across the HTTP surface. Grounded on the teacher's own
//! `main.rs` construction sequence (cache, provider, server), generalized
//! from a single shared `Arc<CachedStore>` to the fuller collaborator set
//! this crate's components need.

use crate::collector::Collector;
use crate::config::AppConfig;
use crate::db::Pool;
use crate::llm::{ChatAssistant, DailyAnalyst, StrategyFamilySelector, StrategyGenerator, UnconfiguredLlm};
use crate::pipeline::{Pipeline, PipelineCollaborators};
use crate::runner::Runner;
use chrono::{Duration, NaiveDate};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const GAP_REPAIR_LOOKBACK_DAYS: i64 = 60;
const PRICE_SYNC_WINDOW_DAYS: i64 = 365 * 3;

/// Families to fall back to, best-score-first, when no family selector is
/// configured or it fails (spec.md §4.5 step 5).
const FAMILY_FALLBACK_TOP_N: usize = 5;

/// Wires the Scheduled Pipeline's collaborator seams to the real
/// `Collector`, `signals_engine`, and `DailyAnalyst`.
struct RealCollaborators {
    collector: Arc<Collector>,
    analyst: Arc<dyn DailyAnalyst>,
    family_selector: Arc<dyn StrategyFamilySelector>,
}

impl RealCollaborators {
    /// Scheduled Pipeline step 5: optionally narrow `strategies` to the
    /// family selector's chosen subset. Falls back to the top
    /// `FAMILY_FALLBACK_TOP_N` families by score when no selector is
    /// configured, it errors, or it returns an empty/unmatched selection —
    /// never to an empty strategy set, since that would silently stop
    /// signal generation entirely.
    async fn select_strategy_subset(
        &self,
        conn: &rusqlite::Connection,
        strategies: Vec<crate::db::models::Strategy>,
    ) -> anyhow::Result<Vec<crate::db::models::Strategy>> {
        if strategies.is_empty() {
            return Ok(strategies);
        }
        let scores = crate::db::repo::strategy_scores(conn)?;
        let families = crate::llm::family::build_family_summary(&strategies, &scores);

        let chosen_ids = match self.family_selector.select(&families).await {
            Ok(ids) if !ids.is_empty() => ids,
            _ => crate::llm::family::fallback_top_n(&families, FAMILY_FALLBACK_TOP_N),
        };
        let chosen_ids: std::collections::HashSet<i64> = chosen_ids.into_iter().collect();

        let narrowed: Vec<_> = strategies.iter().filter(|s| chosen_ids.contains(&s.id)).cloned().collect();
        if narrowed.is_empty() { Ok(strategies) } else { Ok(narrowed) }
    }
}

#[async_trait::async_trait]
impl PipelineCollaborators for RealCollaborators {
    async fn repair_gaps(&self, pool: &Pool, date: NaiveDate) -> anyhow::Result<usize> {
        let conn = pool.get()?;
        let start = date - Duration::days(GAP_REPAIR_LOOKBACK_DAYS);
        Ok(self.collector.repair_daily_gaps(&conn, start, date, |_, _| {}).await?)
    }

    async fn sync_prices(&self, pool: &Pool, date: NaiveDate) -> anyhow::Result<usize> {
        let conn = pool.get()?;
        let codes = crate::db::repo::all_stock_codes(&conn)?;
        let start = date - Duration::days(PRICE_SYNC_WINDOW_DAYS);
        for code in &codes {
            self.collector.daily_df(&conn, code, start, date, false).await?;
        }
        Ok(codes.len())
    }

    async fn generate_signals(&self, pool: &Pool, date: NaiveDate) -> anyhow::Result<usize> {
        let conn = pool.get()?;
        let universe = load_universe(&conn, date)?;
        let all_strategies = crate::db::repo::list_strategies(&conn)?;
        let strategies = self.select_strategy_subset(&conn, all_strategies).await?;
        let held: std::collections::HashSet<String> =
            crate::db::repo::all_positions(&conn)?.into_iter().map(|p| p.code).collect();
        let sentiment = crate::db::repo::latest_sentiment_score(&conn)?;
        let codes: Vec<String> = universe.iter().map(|(code, _)| code.clone()).collect();

        let result = crate::signals_engine::scan(date, &universe, &strategies, &held, sentiment);
        crate::signals_engine::persist(&conn, date, &codes, &result.signals)?;
        Ok(result.signals.len())
    }

    async fn run_daily_analysis(&self, pool: &Pool, date: NaiveDate) -> anyhow::Result<crate::db::models::AiReport> {
        let analysis = self.analyst.analyze(date).await?;
        let _ = pool;
        Ok(crate::db::models::AiReport {
            id: 0,
            report_date: date,
            report_type: "daily".into(),
            market_regime: analysis.market_regime,
            market_regime_confidence: analysis.market_regime_confidence,
            thinking_process: analysis.thinking_process,
            summary: analysis.summary,
            recommendations: analysis.recommendations,
            strategy_actions: analysis.strategy_actions,
        })
    }
}

/// Load every watched stock's trailing window, keeping only codes with
/// enough history for the indicator warm-up (mirrors the Runner's own
/// universe-loading step in spec.md §4.1 phase 3).
fn load_universe(
    conn: &rusqlite::Connection,
    date: NaiveDate,
) -> crate::error::CoreResult<Vec<(String, Vec<crate::db::models::DailyBar>)>> {
    let mut universe = Vec::new();
    for code in crate::db::repo::all_stock_codes(conn)? {
        let bars = crate::db::repo::trailing_window(conn, &code, date, crate::signals_engine::TRAILING_WINDOW_DAYS as usize)?;
        if bars.len() >= crate::signals_engine::MIN_BARS_REQUIRED {
            universe.push((code, bars));
        }
    }
    Ok(universe)
}

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub config: AppConfig,
    pub runner: Arc<Runner>,
    pub pipeline: Arc<Pipeline>,
    pub collector: Arc<Collector>,
    pub chat: Arc<dyn ChatAssistant>,
    pub family_selector: Arc<dyn StrategyFamilySelector>,
}

impl AppState {
    pub fn new(config: AppConfig, pool_size: usize) -> anyhow::Result<Self> {
        let pool = Arc::new(Pool::open(std::path::Path::new(&config.db_path), pool_size)?);

        let primary = crate::collector::source::select(&config.data_sources.historical_daily, config.tushare_token.clone());
        let fallback = config
            .data_sources
            .fallback_enabled
            .then(|| crate::collector::source::select("akshare", None));
        let collector = Arc::new(Collector::new(&config.data_sources, primary, fallback));

        let generator: Arc<dyn StrategyGenerator> = Arc::new(UnconfiguredLlm);
        let analyst: Arc<dyn DailyAnalyst> = Arc::new(UnconfiguredLlm);
        let chat: Arc<dyn ChatAssistant> = Arc::new(UnconfiguredLlm);
        let family_selector: Arc<dyn StrategyFamilySelector> = Arc::new(UnconfiguredLlm);

        let runner = Runner::new(pool.clone(), config.clone(), generator, collector.clone());

        let collaborators: Arc<dyn PipelineCollaborators> =
            Arc::new(RealCollaborators { collector: collector.clone(), analyst, family_selector: family_selector.clone() });
        let pipeline = Arc::new(Pipeline::new(pool.clone(), config.clone(), collaborators));

        Ok(Self { pool, config, runner, pipeline, collector, chat, family_selector })
    }

    /// Resubmit/fail orphaned experiments left by a crash, per spec.md §4.1.
    pub async fn recover_on_startup(&self) -> anyhow::Result<()> {
        self.runner.recover_on_startup().await?;
        Ok(())
    }

    /// Spawn the watchdog sweep and the daily pipeline's daemon loop as
    /// background tasks, both tied to `cancel`.
    pub fn spawn_background(&self, cancel: CancellationToken) {
        let runner = Arc::clone(&self.runner);
        let watchdog_cancel = cancel.clone();
        tokio::spawn(async move { runner.run_watchdog(watchdog_cancel).await });

        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(async move { pipeline.run(cancel).await });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ExitConfig, Strategy};
    use crate::llm::FamilyStats;

    #[test]
    fn app_state_wires_up_against_an_in_memory_like_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.db_path = dir.path().join("test.db").to_string_lossy().into_owned();
        let state = AppState::new(config, 2).unwrap();
        assert!(!state.runner.is_running(1));
    }

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

    struct FailingSelector;
    #[async_trait::async_trait]
    impl StrategyFamilySelector for FailingSelector {
        async fn select(&self, _families: &[FamilyStats]) -> anyhow::Result<Vec<i64>> {
            anyhow::bail!("no selector configured")
        }
    }

    struct PickingSelector(Vec<i64>);
    #[async_trait::async_trait]
    impl StrategyFamilySelector for PickingSelector {
        async fn select(&self, _families: &[FamilyStats]) -> anyhow::Result<Vec<i64>> {
            Ok(self.0.clone())
        }
    }

    fn collaborators(selector: Arc<dyn StrategyFamilySelector>) -> RealCollaborators {
        RealCollaborators {
            collector: Arc::new(Collector::new(
                &crate::config::DataSourcesConfig::default(),
                crate::collector::source::select("akshare", None),
                None,
            )),
            analyst: Arc::new(UnconfiguredLlm),
            family_selector: selector,
        }
    }

    #[tokio::test]
    async fn failing_family_selector_falls_back_to_top_scoring_families() {
        let pool = Pool::open_in_memory().unwrap();
        let conn = pool.get().unwrap();
        let strategies = vec![strategy(1, "[AI] PSAR_trend_SL10"), strategy(2, "[AI] KDJ_cross_v1")];
        let collab = collaborators(Arc::new(FailingSelector));
        let selected = collab.select_strategy_subset(&conn, strategies).await.unwrap();
        assert_eq!(selected.len(), 2, "with no recorded scores both lone families fall back in");
    }

    #[tokio::test]
    async fn successful_family_selector_narrows_to_its_chosen_strategies() {
        let pool = Pool::open_in_memory().unwrap();
        let conn = pool.get().unwrap();
        let strategies = vec![strategy(1, "[AI] PSAR_trend_SL10"), strategy(2, "[AI] KDJ_cross_v1")];
        let collab = collaborators(Arc::new(PickingSelector(vec![2])));
        let selected = collab.select_strategy_subset(&conn, strategies).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, 2);
    }
}
