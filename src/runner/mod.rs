//! Experiment Runner (spec.md §4.1): owns the lifecycle of long-running
//! experiments — spawns a background worker per experiment, streams
//! progress to any number of subscribers via `ProgressBus`, enforces a
//! hard end-to-end timeout via a watchdog, and recovers orphaned work left
//! behind by a crash. Grounded on the teacher's `DashMap`-backed registry
//! idiom (already a direct dependency) generalized from a cache-of-quotes
//! shape to a registry-of-running-workers shape.

pub mod progress;

use crate::backtest::{self, BacktestInputs, ScoreWeights};
use crate::collector::Collector;
use crate::config::AppConfig;
use crate::db::models::{
    Experiment, ExperimentStatus, ExperimentStrategy, ExperimentStrategyStatus, Regime, SourceType, Strategy,
};
use crate::db::repo::BacktestMetricsRow;
use crate::db::{repo, Pool};
use crate::error::{CoreError, CoreResult};
use crate::llm::{CandidateStrategy, StrategyGenerator};
use crate::validator::{self, Candidate};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use dashmap::DashMap;
use progress::{ProgressBus, ProgressEventKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const BACKTEST_SEMAPHORE_PERMITS: usize = 3;
const BACKTEST_TIMEOUT_SECS: u64 = 600;
const COMBO_BACKTEST_TIMEOUT_SECS: u64 = 900;
const WATCHDOG_POLL: Duration = Duration::from_secs(60);
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(3600);
const PROGRESS_RETENTION: Duration = Duration::from_secs(300);
const UNIVERSE_WINDOW_DAYS: i64 = 365 * 3;
const MIN_BARS_REQUIRED: usize = 60;
const CANDIDATE_COUNT: usize = 8;
const BENCHMARK_CODE: &str = "000001.SH";

pub struct RunnerHandle {
    pub bus: Arc<ProgressBus>,
    started_at: Instant,
    finished_at: std::sync::Mutex<Option<Instant>>,
    _task: tokio::task::JoinHandle<()>,
}

impl RunnerHandle {
    fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn is_live_for_get_progress(&self) -> bool {
        if !self.bus.is_finished() {
            return true;
        }
        self.finished_at
            .lock()
            .expect("finished_at poisoned")
            .is_some_and(|t| t.elapsed() < PROGRESS_RETENTION)
    }
}

pub struct Runner {
    pool: Arc<Pool>,
    config: AppConfig,
    generator: Arc<dyn StrategyGenerator>,
    collector: Arc<Collector>,
    semaphore: Arc<Semaphore>,
    registry: Arc<DashMap<i64, Arc<RunnerHandle>>>,
}

impl Runner {
    pub fn new(pool: Arc<Pool>, config: AppConfig, generator: Arc<dyn StrategyGenerator>, collector: Arc<Collector>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config,
            generator,
            collector,
            semaphore: Arc::new(Semaphore::new(BACKTEST_SEMAPHORE_PERMITS)),
            registry: Arc::new(DashMap::new()),
        })
    }

    pub fn is_running(&self, experiment_id: i64) -> bool {
        self.registry
            .get(&experiment_id)
            .is_some_and(|h| !h.bus.is_finished())
    }

    pub fn get_progress(&self, experiment_id: i64) -> Option<Arc<RunnerHandle>> {
        let handle = self.registry.get(&experiment_id)?.clone();
        handle.is_live_for_get_progress().then_some(handle)
    }

    /// Fails only if the experiment record is missing.
    pub fn start(self: &Arc<Self>, experiment_id: i64) -> CoreResult<Arc<RunnerHandle>> {
        {
            let conn = self.checkout()?;
            repo::get_experiment(&conn, experiment_id)?;
        }
        Ok(self.spawn_worker(experiment_id, false))
    }

    /// Idempotent: returns the existing handle if a worker is already
    /// active, else spawns a resume worker.
    pub fn resume(self: &Arc<Self>, experiment_id: i64) -> CoreResult<Arc<RunnerHandle>> {
        if let Some(handle) = self.get_progress(experiment_id) {
            if !handle.bus.is_finished() {
                return Ok(handle);
            }
        }
        {
            let conn = self.checkout()?;
            repo::get_experiment(&conn, experiment_id)?;
        }
        Ok(self.spawn_worker(experiment_id, true))
    }

    fn checkout(&self) -> CoreResult<crate::db::PooledConnection> {
        self.pool.get().map_err(|e| CoreError::DbBusy(e.to_string()))
    }

    fn spawn_worker(self: &Arc<Self>, experiment_id: i64, resume: bool) -> Arc<RunnerHandle> {
        let bus = Arc::new(ProgressBus::new());
        let runner = Arc::clone(self);
        let worker_bus = Arc::clone(&bus);
        let task = tokio::spawn(async move {
            runner.run_worker(experiment_id, resume, worker_bus).await;
        });
        let handle = Arc::new(RunnerHandle {
            bus,
            started_at: Instant::now(),
            finished_at: std::sync::Mutex::new(None),
            _task: task,
        });
        self.registry.insert(experiment_id, Arc::clone(&handle));
        handle
    }

    async fn run_worker(self: Arc<Self>, experiment_id: i64, resume: bool, bus: Arc<ProgressBus>) {
        if resume {
            bus.push(ProgressEventKind::ResumeStart);
        }

        let outcome = self.run_worker_inner(experiment_id, resume, &bus).await;
        if let Err(e) = outcome {
            warn!(experiment_id, error = %e, "experiment worker failed");
            bus.push(ProgressEventKind::Error { message: e.to_string() });
            if let Ok(conn) = self.checkout() {
                if let Ok(exp) = repo::get_experiment(&conn, experiment_id) {
                    if !exp.status.is_terminal() {
                        let _ = repo::update_experiment_status(&conn, experiment_id, ExperimentStatus::Failed);
                    }
                }
            }
        }

        bus.finish();
        if let Some(handle) = self.registry.get(&experiment_id) {
            *handle.finished_at.lock().expect("finished_at poisoned") = Some(Instant::now());
        }
    }

    async fn run_worker_inner(&self, experiment_id: i64, resume: bool, bus: &ProgressBus) -> CoreResult<()> {
        let experiment = {
            let conn = self.checkout()?;
            repo::get_experiment(&conn, experiment_id)?
        };

        let strategies = if resume {
            bus.push(ProgressEventKind::ExperimentStatus { status: "resuming".into() });
            let conn = self.checkout()?;
            repo::resumable_experiment_strategies(&conn, experiment_id)?
        } else {
            match self.generate_and_validate(&experiment, bus).await? {
                Some(strategies) => strategies,
                // Generation failed; status and progress event were
                // already recorded by generate_and_validate.
                None => return Ok(()),
            }
        };

        self.backtest_candidates(&experiment, strategies, bus).await?;

        let conn = self.checkout()?;
        repo::update_experiment_status(&conn, experiment_id, ExperimentStatus::Done)?;
        let best_score = repo::list_experiment_strategies(&conn, experiment_id)?
            .into_iter()
            .filter(|es| es.status == ExperimentStrategyStatus::Done)
            .map(|es| es.score)
            .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a: f64| a.max(s))));
        bus.push(ProgressEventKind::ExperimentDone { best_score });
        Ok(())
    }

    /// Phase 1 (generate) + Phase 2 (validate & persist). `Ok(None)` means
    /// generation itself failed — the external-call failure is logged and
    /// the experiment marked failed here, matching the "log and continue"
    /// convention for non-`CoreError` external failures.
    async fn generate_and_validate(&self, experiment: &Experiment, bus: &ProgressBus) -> CoreResult<Option<Vec<ExperimentStrategy>>> {
        {
            let conn = self.checkout()?;
            repo::update_experiment_status(&conn, experiment.id, ExperimentStatus::Generating)?;
        }
        bus.push(ProgressEventKind::Generating);

        let candidates: Vec<CandidateStrategy> = match self.generator.generate(experiment, CANDIDATE_COUNT).await {
            Ok(c) => c,
            Err(e) => {
                warn!(experiment_id = experiment.id, error = %e, "strategy generation failed");
                let conn = self.checkout()?;
                repo::update_experiment_status(&conn, experiment.id, ExperimentStatus::Failed)?;
                bus.push(ProgressEventKind::Error { message: e.to_string() });
                return Ok(None);
            }
        };

        let conn = self.checkout()?;
        let mut persisted = Vec::with_capacity(candidates.len());
        for (seq, candidate) in candidates.into_iter().enumerate() {
            let outcome = validator::validate(Candidate {
                name: candidate.name.clone(),
                description: candidate.description.clone(),
                buy_conditions: candidate.buy_conditions,
                sell_conditions: candidate.sell_conditions,
                exit_config: candidate.exit_config,
            });

            let status = if outcome.failed {
                ExperimentStrategyStatus::Failed
            } else {
                ExperimentStrategyStatus::Pending
            };

            let mut es = ExperimentStrategy {
                id: 0,
                experiment_id: experiment.id,
                name: candidate.name,
                buy_conditions: outcome.buy_conditions,
                sell_conditions: outcome.sell_conditions,
                exit_config: outcome.exit_config,
                status,
                error_message: (!outcome.errors.is_empty()).then(|| outcome.errors.join("; ")),
                total_trades: 0,
                win_rate: 0.0,
                total_return_pct: 0.0,
                max_drawdown_pct: 0.0,
                avg_hold_days: 0.0,
                avg_pnl_pct: 0.0,
                score: 0.0,
                regime_stats: None,
                combo_config: None,
                backtest_run_id: None,
                promoted_strategy_id: None,
                seq: seq as i64,
            };
            es.id = repo::insert_experiment_strategy(&conn, &es)?;
            persisted.push(es);
        }

        bus.push(ProgressEventKind::StrategiesReady {
            strategies: serde_json::to_value(
                persisted.iter().map(|es| (es.id, es.name.clone(), es.status.as_str())).collect::<Vec<_>>(),
            )
            .unwrap_or(serde_json::Value::Null),
        });

        Ok(Some(persisted))
    }

    /// Phase 3 (load universe) + Phase 4 (backtest loop).
    async fn backtest_candidates(&self, experiment: &Experiment, candidates: Vec<ExperimentStrategy>, bus: &ProgressBus) -> CoreResult<()> {
        let conn = self.checkout()?;
        repo::update_experiment_status(&conn, experiment.id, ExperimentStatus::Backtesting)?;
        drop(conn);

        bus.push(ProgressEventKind::DataIntegrity);
        let today = Utc::now().date_naive();
        let window_start = today - ChronoDuration::days(UNIVERSE_WINDOW_DAYS);
        let repaired = {
            let conn = self.checkout()?;
            match self.collector.repair_daily_gaps(&conn, window_start, today, |_, _| {}).await {
                Ok(n) => n,
                Err(e) => {
                    bus.push(ProgressEventKind::DataIntegrityWarning { message: e.to_string() });
                    0
                }
            }
        };
        bus.push(ProgressEventKind::DataIntegrityDone { repaired });

        bus.push(ProgressEventKind::LoadingData);
        let mut bars = std::collections::HashMap::new();
        {
            let conn = self.checkout()?;
            for code in repo::all_stock_codes(&conn)? {
                let series = repo::trailing_window(&conn, &code, today, (UNIVERSE_WINDOW_DAYS as usize).min(800))?;
                if series.len() >= MIN_BARS_REQUIRED {
                    bars.insert(code, series);
                }
            }
        }
        let stock_count = bars.len();

        bus.push(ProgressEventKind::ComputingRegimes);
        let (regimes, benchmark_return_pct) = {
            let conn = self.checkout()?;
            let index_bars = repo::index_daily_bars(&conn, BENCHMARK_CODE, window_start, today)?;
            if index_bars.len() < 2 {
                bus.push(ProgressEventKind::RegimeWarning { message: "insufficient benchmark index data".into() });
                (std::collections::HashMap::new(), 0.0)
            } else {
                if let Err(e) = crate::regime::ensure_regimes(&conn, &index_bars, window_start, today) {
                    bus.push(ProgressEventKind::RegimeWarning { message: e.to_string() });
                }
                let map = crate::regime::regime_map(&conn, window_start, today).unwrap_or_default();
                let first = index_bars.first().unwrap();
                let last = index_bars.last().unwrap();
                let benchmark_return = if first.open > 0.0 { (last.close - first.open) / first.open * 100.0 } else { 0.0 };
                (map, benchmark_return)
            }
        };
        bus.push(ProgressEventKind::DataLoaded { stock_count, benchmark_return_pct });

        let inputs = Arc::new(BacktestInputs {
            bars,
            regimes: regimes.clone(),
            initial_capital: experiment.capital,
            max_positions: experiment.max_positions as usize,
            max_position_pct: experiment.max_position_pct,
        });
        let weights = ScoreWeights::from(&self.config.ai_lab);

        for es in candidates {
            if es.status.is_terminal() || (es.status == ExperimentStrategyStatus::Failed && !es.is_retryable()) {
                continue;
            }
            self.backtest_one(es, &inputs, &weights, &regimes, bus).await?;
        }

        Ok(())
    }

    async fn backtest_one(
        &self,
        es: ExperimentStrategy,
        inputs: &Arc<BacktestInputs>,
        weights: &ScoreWeights,
        regimes: &std::collections::HashMap<NaiveDate, Regime>,
        bus: &ProgressBus,
    ) -> CoreResult<()> {
        let (reachable, reason) = validator::check_reachable(&es.buy_conditions);
        if !reachable {
            let conn = self.checkout()?;
            repo::update_experiment_strategy_status(&conn, es.id, ExperimentStrategyStatus::Invalid, Some(&reason))?;
            bus.push(ProgressEventKind::BacktestSkip { strategy_id: es.id, name: es.name.clone(), reason });
            return Ok(());
        }

        bus.push(ProgressEventKind::BacktestStart { strategy_id: es.id, name: es.name.clone() });

        let strategy = Strategy {
            id: es.id,
            name: es.name.clone(),
            description: String::new(),
            buy_conditions: es.buy_conditions.clone(),
            sell_conditions: es.sell_conditions.clone(),
            exit_config: es.exit_config.clone(),
            portfolio_config: es.combo_config.clone(),
            category: None,
            source_experiment_id: Some(es.experiment_id),
        };

        let timeout_secs = if strategy.is_combo() { COMBO_BACKTEST_TIMEOUT_SECS } else { BACKTEST_TIMEOUT_SECS };
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.expect("semaphore closed");
        let token = CancellationToken::new();
        let timer_token = token.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
            timer_token.cancel();
        });

        let inputs_for_task = Arc::clone(inputs);
        let run_token = token.clone();
        let result = tokio::task::spawn_blocking(move || backtest::run(&strategy, &inputs_for_task, &run_token)).await;
        timer.abort();
        drop(permit);

        match result {
            Ok(Ok(run_outcome)) => self.persist_outcome(&es, run_outcome, inputs.initial_capital, weights, regimes, bus).await?,
            Ok(Err(e @ (CoreError::SignalExplosion { .. } | CoreError::BacktestTimeout | CoreError::Unreachable(_)))) => {
                let message = e.to_string();
                let conn = self.checkout()?;
                repo::update_experiment_strategy_status(&conn, es.id, ExperimentStrategyStatus::Invalid, Some(&message))?;
                bus.push(ProgressEventKind::BacktestError { strategy_id: es.id, name: es.name.clone(), message });
            }
            Ok(Err(other)) => {
                let message = other.to_string();
                let conn = self.checkout()?;
                repo::update_experiment_strategy_status(&conn, es.id, ExperimentStrategyStatus::Failed, Some(&message))?;
                bus.push(ProgressEventKind::BacktestError { strategy_id: es.id, name: es.name.clone(), message });
            }
            Err(join_err) => {
                let message = format!("backtest task panicked: {join_err}");
                let conn = self.checkout()?;
                repo::update_experiment_strategy_status(&conn, es.id, ExperimentStrategyStatus::Failed, Some(&message))?;
                bus.push(ProgressEventKind::BacktestError { strategy_id: es.id, name: es.name.clone(), message });
            }
        }
        Ok(())
    }

    async fn persist_outcome(
        &self,
        es: &ExperimentStrategy,
        outcome: backtest::BacktestOutcome,
        initial_capital: f64,
        weights: &ScoreWeights,
        regimes: &std::collections::HashMap<NaiveDate, Regime>,
        bus: &ProgressBus,
    ) -> CoreResult<()> {
        let conn = self.checkout()?;

        if outcome.trades.is_empty() {
            repo::update_experiment_strategy_status(&conn, es.id, ExperimentStrategyStatus::Invalid, Some("zero trades"))?;
            bus.push(ProgressEventKind::BacktestSkip { strategy_id: es.id, name: es.name.clone(), reason: "zero trades".into() });
            return Ok(());
        }

        let trade_models: Vec<_> = outcome
            .trades
            .iter()
            .cloned()
            .map(|t| {
                let regime = regimes.get(&t.buy_date).copied();
                t.into_model(regime)
            })
            .collect();

        let metrics = backtest::metrics::compute(&trade_models, &outcome.equity_curve, initial_capital);
        let score = backtest::score(&metrics, weights);
        let final_equity = outcome.equity_curve.last().map_or(initial_capital, |p| p.equity);

        let run_id = repo::insert_backtest_run(
            &conn,
            Some(es.id),
            &es.name,
            initial_capital,
            final_equity,
            &serde_json::to_value(&metrics).unwrap_or(serde_json::Value::Null),
            &Utc::now().to_rfc3339(),
        )?;
        repo::insert_backtest_trades(&conn, run_id, &trade_models)?;
        repo::record_backtest_result(
            &conn,
            es.id,
            &BacktestMetricsRow {
                total_trades: metrics.total_trades as i64,
                win_rate: metrics.win_rate,
                total_return_pct: metrics.total_return_pct,
                max_drawdown_pct: metrics.max_drawdown_pct,
                avg_hold_days: metrics.avg_hold_days,
                avg_pnl_pct: metrics.avg_pnl_pct,
                score,
                regime_stats: serde_json::to_value(&metrics.regime_stats).ok(),
            },
            run_id,
        )?;

        bus.push(ProgressEventKind::BacktestDone { strategy_id: es.id, name: es.name.clone(), score });
        Ok(())
    }

    /// Background loop: force-finish any worker whose wall-clock age
    /// exceeds `WATCHDOG_TIMEOUT`.
    pub async fn run_watchdog(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(WATCHDOG_POLL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_watchdog().await {
                        warn!(error = %e, "watchdog sweep failed");
                    }
                }
            }
        }
    }

    async fn sweep_watchdog(&self) -> CoreResult<()> {
        let expired: Vec<i64> = self
            .registry
            .iter()
            .filter(|entry| !entry.value().bus.is_finished() && entry.value().age() > WATCHDOG_TIMEOUT)
            .map(|entry| *entry.key())
            .collect();

        for experiment_id in expired {
            let minutes = WATCHDOG_TIMEOUT.as_secs() / 60;
            info!(experiment_id, minutes, "watchdog timeout exceeded, force-finishing worker");
            let conn = self.checkout()?;
            repo::update_experiment_status(&conn, experiment_id, ExperimentStatus::Failed)?;
            for es in repo::list_experiment_strategies(&conn, experiment_id)? {
                if !es.status.is_terminal() {
                    repo::update_experiment_strategy_status(
                        &conn,
                        es.id,
                        ExperimentStrategyStatus::Invalid,
                        Some(&CoreError::WatchdogTimeout { minutes }.to_string()),
                    )?;
                }
            }
            if let Some(handle) = self.registry.get(&experiment_id) {
                handle.bus.push(ProgressEventKind::Error { message: CoreError::WatchdogTimeout { minutes }.to_string() });
                handle.bus.finish();
                *handle.finished_at.lock().expect("finished_at poisoned") = Some(Instant::now());
            }
        }
        Ok(())
    }

    /// Startup sweep: strategies left in `pending`/`backtesting` by a
    /// crash. Clone-sourced experiments are resubmitted; everything else
    /// is marked failed for the retry endpoint to pick up later.
    pub async fn recover_on_startup(self: &Arc<Self>) -> CoreResult<()> {
        let orphaned = {
            let conn = self.checkout()?;
            repo::non_terminal_experiments(&conn)?
        };

        let mut resubmitted = 0usize;
        let mut failed = 0usize;
        for experiment in orphaned {
            match experiment.source_type {
                SourceType::Clone => {
                    self.resume(experiment.id)?;
                    resubmitted += 1;
                }
                _ => {
                    let conn = self.checkout()?;
                    repo::update_experiment_status(&conn, experiment.id, ExperimentStatus::Failed)?;
                    for es in repo::list_experiment_strategies(&conn, experiment.id)? {
                        if !es.status.is_terminal() {
                            repo::update_experiment_strategy_status(
                                &conn,
                                es.id,
                                ExperimentStrategyStatus::Failed,
                                Some("orphaned after server restart"),
                            )?;
                        }
                    }
                    failed += 1;
                }
            }
        }
        info!(resubmitted, failed, "orphan recovery complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ExitConfig, SourceType};
    use async_trait::async_trait;

    struct StubGenerator;

    #[async_trait]
    impl StrategyGenerator for StubGenerator {
        async fn generate(&self, _experiment: &Experiment, _count: usize) -> anyhow::Result<Vec<CandidateStrategy>> {
            Ok(vec![CandidateStrategy {
                name: "stub-momentum".into(),
                description: String::new(),
                buy_conditions: vec![crate::conditions::Condition::Value {
                    field: "RSI".into(),
                    params: Default::default(),
                    operator: crate::conditions::Operator::Lt,
                    compare_value: 30.0,
                }],
                sell_conditions: vec![crate::conditions::Condition::Value {
                    field: "RSI".into(),
                    params: Default::default(),
                    operator: crate::conditions::Operator::Gt,
                    compare_value: 70.0,
                }],
                exit_config: ExitConfig::default(),
            }])
        }
    }

    fn test_collector() -> Arc<Collector> {
        Arc::new(Collector::new(
            &crate::config::DataSourcesConfig::default(),
            crate::collector::source::select("tushare", None),
            None,
        ))
    }

    #[tokio::test]
    async fn start_then_experiment_reaches_done() {
        let pool = Arc::new(Pool::open_in_memory().unwrap());
        {
            let conn = pool.get().unwrap();
            repo::insert_experiment(
                &conn,
                &Experiment {
                    id: 0,
                    theme: "oversold bounce".into(),
                    source_type: SourceType::Template,
                    source_text: String::new(),
                    status: ExperimentStatus::Pending,
                    capital: 100_000.0,
                    max_positions: 10,
                    max_position_pct: 30.0,
                    strategy_count: 0,
                },
                &Utc::now().to_rfc3339(),
            )
            .unwrap();
        }

        let runner = Runner::new(pool.clone(), AppConfig::default(), Arc::new(StubGenerator), test_collector());
        let handle = runner.start(1).unwrap();
        let mut attempts = 0;
        while !handle.bus.is_finished() && attempts < 200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            attempts += 1;
        }
        assert!(handle.bus.is_finished());

        let conn = pool.get().unwrap();
        let exp = repo::get_experiment(&conn, 1).unwrap();
        assert_eq!(exp.status, ExperimentStatus::Done);
    }

    #[tokio::test]
    async fn start_fails_for_missing_experiment() {
        let pool = Arc::new(Pool::open_in_memory().unwrap());
        let runner = Runner::new(pool, AppConfig::default(), Arc::new(StubGenerator), test_collector());
        let result = runner.start(999);
        assert!(matches!(result, Err(CoreError::ExperimentNotFound(999))));
    }

    #[tokio::test]
    async fn orphan_recovery_marks_template_experiments_failed() {
        let pool = Arc::new(Pool::open_in_memory().unwrap());
        {
            let conn = pool.get().unwrap();
            repo::insert_experiment(
                &conn,
                &Experiment {
                    id: 0,
                    theme: "abandoned".into(),
                    source_type: SourceType::Template,
                    source_text: String::new(),
                    status: ExperimentStatus::Backtesting,
                    capital: 100_000.0,
                    max_positions: 10,
                    max_position_pct: 30.0,
                    strategy_count: 0,
                },
                &Utc::now().to_rfc3339(),
            )
            .unwrap();
        }

        let runner = Runner::new(pool.clone(), AppConfig::default(), Arc::new(StubGenerator), test_collector());
        runner.recover_on_startup().await.unwrap();

        let conn = pool.get().unwrap();
        let exp = repo::get_experiment(&conn, 1).unwrap();
        assert_eq!(exp.status, ExperimentStatus::Failed);
    }
}
