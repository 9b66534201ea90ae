//! Scheduled Pipeline (spec.md §4.5): the daily orchestrator. A daemon
//! loop wakes every 30 s, and when the wall clock crosses the configured
//! refresh time for a date not yet run, executes the seven-step sequence.
//! Grounded on the teacher's `tokio::time::interval` + `CancellationToken`
//! shutdown idiom used for its own background polling loop.

use crate::config::AppConfig;
use crate::db::Pool;
use crate::error::CoreResult;
use chrono::{NaiveDate, NaiveTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
const THROTTLE_PER_STOCKS: usize = 50;
const THROTTLE_SLEEP: std::time::Duration = std::time::Duration::from_secs(1);
const EXCHANGE: &str = "SSE";

/// Collaborators the pipeline drives but does not own the implementation
/// of; injected so the sequencing logic can be exercised without live
/// network/LLM calls.
#[async_trait::async_trait]
pub trait PipelineCollaborators: Send + Sync {
    async fn repair_gaps(&self, pool: &Pool, date: NaiveDate) -> anyhow::Result<usize>;
    async fn sync_prices(&self, pool: &Pool, date: NaiveDate) -> anyhow::Result<usize>;
    async fn generate_signals(&self, pool: &Pool, date: NaiveDate) -> anyhow::Result<usize>;
    async fn run_daily_analysis(&self, pool: &Pool, date: NaiveDate) -> anyhow::Result<crate::db::models::AiReport>;
}

pub struct Pipeline {
    pool: Arc<Pool>,
    config: AppConfig,
    collaborators: Arc<dyn PipelineCollaborators>,
}

impl Pipeline {
    pub fn new(pool: Arc<Pool>, config: AppConfig, collaborators: Arc<dyn PipelineCollaborators>) -> Self {
        Self { pool, config, collaborators }
    }

    fn conn(&self) -> CoreResult<crate::db::PooledConnection> {
        self.pool.get().map_err(|e| crate::error::CoreError::DbBusy(e.to_string()))
    }

    /// Run the daemon wake loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("pipeline daemon shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.maybe_fire().await {
                        warn!(error = %e, "pipeline tick failed");
                    }
                }
            }
        }
    }

    async fn maybe_fire(&self) -> CoreResult<()> {
        let now = Utc::now();
        let today = now.date_naive();
        let target = NaiveTime::from_hms_opt(
            self.config.signals.auto_refresh_hour,
            self.config.signals.auto_refresh_minute,
            0,
        )
        .unwrap_or_else(|| NaiveTime::from_hms_opt(9, 5, 0).unwrap());

        let conn = self.conn()?;
        let last_run = crate::db::repo::pipeline_last_run_date(&conn)?;
        let in_flight = crate::db::repo::pipeline_in_flight(&conn)?;
        drop(conn);

        if in_flight || last_run == Some(today) || now.time() < target {
            return Ok(());
        }

        self.run_for_date(today).await
    }

    /// Manual trigger: bypasses the clock check, still honors the
    /// in-flight guard.
    pub async fn trigger(&self, date: NaiveDate) -> CoreResult<()> {
        let conn = self.conn()?;
        let in_flight = crate::db::repo::pipeline_in_flight(&conn)?;
        drop(conn);
        if in_flight {
            return Err(crate::error::CoreError::Conflict);
        }
        self.run_for_date(date).await
    }

    async fn run_for_date(&self, date: NaiveDate) -> CoreResult<()> {
        {
            let conn = self.conn()?;
            crate::db::repo::set_pipeline_in_flight(&conn, true)?;
        }

        // Step 1: execute pending trade plans. Always runs, even on a
        // non-trading day, so missed-day expiry can fire.
        self.step("execute_pending_plans", date, || self.execute_plans(date)).await;

        let is_trading_day = {
            let conn = self.conn()?;
            crate::db::repo::is_trading_day(&conn, EXCHANGE, date).unwrap_or(false)
        };

        if is_trading_day {
            self.step("data_integrity", date, || self.data_integrity(date)).await;
            self.step("price_sync", date, || self.price_sync(date)).await;
            self.step("signal_generation", date, || self.signal_generation(date)).await;
        } else {
            info!(%date, "not a trading day, skipping steps 3-5");
        }

        // Step 6 always runs.
        self.step("ai_daily_analysis", date, || self.ai_daily_analysis(date)).await;

        let conn = self.conn()?;
        crate::db::repo::set_pipeline_last_run_date(&conn, date)?;
        crate::db::repo::set_pipeline_in_flight(&conn, false)?;
        Ok(())
    }

    /// Run a step under its own failure boundary: log and continue rather
    /// than aborting the sequence.
    async fn step<F, Fut>(&self, name: &str, date: NaiveDate, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        match f().await {
            Ok(()) => info!(step = name, %date, "pipeline step completed"),
            Err(e) => warn!(step = name, %date, error = %e, "pipeline step failed, continuing"),
        }
    }

    async fn execute_plans(&self, date: NaiveDate) -> anyhow::Result<()> {
        let conn = self.conn()?;
        let bars_today = |code: &str| -> CoreResult<Option<crate::db::models::DailyBar>> {
            let bars = crate::db::repo::daily_bars(&conn, code, date, date)?;
            Ok(bars.into_iter().next())
        };
        crate::planner::execute_pending(&conn, date, bars_today, &Default::default())?;
        Ok(())
    }

    async fn data_integrity(&self, date: NaiveDate) -> anyhow::Result<()> {
        let n = self.collaborators.repair_gaps(&self.pool, date).await?;
        info!(repaired = n, "gap repair complete");
        Ok(())
    }

    async fn price_sync(&self, date: NaiveDate) -> anyhow::Result<()> {
        let n = self.collaborators.sync_prices(&self.pool, date).await?;
        if n > THROTTLE_PER_STOCKS {
            tokio::time::sleep(THROTTLE_SLEEP * (n / THROTTLE_PER_STOCKS) as u32).await;
        }
        Ok(())
    }

    async fn signal_generation(&self, date: NaiveDate) -> anyhow::Result<()> {
        self.collaborators.generate_signals(&self.pool, date).await?;
        Ok(())
    }

    async fn ai_daily_analysis(&self, date: NaiveDate) -> anyhow::Result<()> {
        let report = self.collaborators.run_daily_analysis(&self.pool, date).await?;
        let conn = self.conn()?;
        crate::db::repo::insert_ai_report(&conn, &report, &Utc::now().to_rfc3339())?;

        let next_day = next_trading_day(&conn, date)?;
        crate::planner::create_plans_from_recommendations(&conn, &report.recommendations, next_day, &Utc::now().to_rfc3339())?;
        Ok(())
    }
}

fn next_trading_day(conn: &rusqlite::Connection, date: NaiveDate) -> anyhow::Result<NaiveDate> {
    let mut cursor = date + chrono::Duration::days(1);
    for _ in 0..14 {
        if crate::db::repo::is_trading_day(conn, EXCHANGE, cursor)? {
            return Ok(cursor);
        }
        cursor += chrono::Duration::days(1);
    }
    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::AiReport;

    struct NoopCollaborators;

    #[async_trait::async_trait]
    impl PipelineCollaborators for NoopCollaborators {
        async fn repair_gaps(&self, _pool: &Pool, _date: NaiveDate) -> anyhow::Result<usize> {
            Ok(0)
        }
        async fn sync_prices(&self, _pool: &Pool, _date: NaiveDate) -> anyhow::Result<usize> {
            Ok(0)
        }
        async fn generate_signals(&self, _pool: &Pool, _date: NaiveDate) -> anyhow::Result<usize> {
            Ok(0)
        }
        async fn run_daily_analysis(&self, _pool: &Pool, date: NaiveDate) -> anyhow::Result<AiReport> {
            Ok(AiReport {
                id: 0,
                report_date: date,
                report_type: "daily".into(),
                market_regime: None,
                market_regime_confidence: None,
                thinking_process: None,
                summary: None,
                recommendations: vec![],
                strategy_actions: vec![],
            })
        }
    }

    #[tokio::test]
    async fn trigger_runs_full_sequence_and_sets_last_run_date() {
        let pool = Arc::new(Pool::open_in_memory().unwrap());
        let pipeline = Pipeline::new(pool.clone(), AppConfig::default(), Arc::new(NoopCollaborators));
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        pipeline.trigger(date).await.unwrap();

        let conn = pool.get().unwrap();
        assert_eq!(crate::db::repo::pipeline_last_run_date(&conn).unwrap(), Some(date));
        assert!(!crate::db::repo::pipeline_in_flight(&conn).unwrap());
    }

    #[tokio::test]
    async fn trigger_refuses_when_already_in_flight() {
        let pool = Arc::new(Pool::open_in_memory().unwrap());
        {
            let conn = pool.get().unwrap();
            crate::db::repo::set_pipeline_in_flight(&conn, true).unwrap();
        }
        let pipeline = Pipeline::new(pool.clone(), AppConfig::default(), Arc::new(NoopCollaborators));
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let result = pipeline.trigger(date).await;
        assert!(matches!(result, Err(crate::error::CoreError::Conflict)));
    }

    #[test]
    fn next_trading_day_skips_closed_dates() {
        let pool = Pool::open_in_memory().unwrap();
        let conn = pool.get().unwrap();
        let d1 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        crate::db::repo::upsert_calendar_day(&conn, EXCHANGE, crate::db::models::CalendarDay { date: d1, is_open: false }).unwrap();
        crate::db::repo::upsert_calendar_day(&conn, EXCHANGE, crate::db::models::CalendarDay { date: d2, is_open: true }).unwrap();
        let next = next_trading_day(&conn, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()).unwrap();
        assert_eq!(next, d2);
    }
}
