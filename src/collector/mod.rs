//! Data Collector (spec.md §4.6): cached OHLCV access with gap detection,
//! per-category primary/fallback source selection, and batch-by-date gap
//! repair. External fetches are represented as `anyhow::Error` at the call
//! site per this crate's error-handling convention (see `crate::error`).

pub mod source;

use crate::config::DataSourcesConfig;
use crate::db::models::DailyBar;
use crate::db::repo;
use crate::error::CoreResult;
use chrono::{Duration, NaiveDate};
use rusqlite::Connection;
use std::collections::HashMap;

pub use source::{AkshareSource, Source, TushareSource};

/// Auto-extend window per the read path's "unless localOnly" rule.
const AUTO_EXTEND_YEARS: i64 = 5;
const STALE_EARLIEST_GAP_DAYS: i64 = 60;
const STALE_LATEST_GAP_DAYS: i64 = 1;
const GAP_COVERAGE_RATIO: f64 = 0.9;
const GAP_REPAIR_MIN_THRESHOLD: f64 = 3000.0;
const GAP_REPAIR_RATIO: f64 = 0.8;

pub struct Collector {
    primary: Box<dyn Source>,
    fallback: Option<Box<dyn Source>>,
    rate_limit_ms: u64,
}

impl Collector {
    pub fn new(cfg: &DataSourcesConfig, primary: Box<dyn Source>, fallback: Option<Box<dyn Source>>) -> Self {
        Self { primary, fallback, rate_limit_ms: cfg.rate_limit_ms }
    }

    /// `getDailyDF` read path: local-first, with conditional backfill.
    pub async fn daily_df(&self, conn: &Connection, code: &str, start: NaiveDate, end: NaiveDate, local_only: bool) -> CoreResult<Vec<DailyBar>> {
        let start = if local_only { start } else { start.min(end - Duration::days(365 * AUTO_EXTEND_YEARS)) };
        let local = repo::daily_bars(conn, code, start, end)?;

        if local_only {
            return Ok(local);
        }

        if !self.needs_fetch(&local, start, end) {
            return Ok(local);
        }

        match self.fetch_with_fallback(code, start, end).await {
            Ok(fetched) => {
                for bar in &fetched {
                    repo::upsert_daily_bar(conn, code, bar)?;
                }
                Ok(merge(local, fetched))
            }
            Err(e) => {
                tracing::warn!(code, error = %e, "external fetch failed, serving local data only");
                Ok(local)
            }
        }
    }

    fn needs_fetch(&self, local: &[DailyBar], start: NaiveDate, end: NaiveDate) -> bool {
        if local.is_empty() {
            return true;
        }
        let earliest = local.first().unwrap().date;
        let latest = local.last().unwrap().date;
        if (earliest - start).num_days() > STALE_EARLIEST_GAP_DAYS {
            return true;
        }
        if (end - latest).num_days() > STALE_LATEST_GAP_DAYS {
            return true;
        }
        let expected = (end - start).num_days().max(1) as f64 * 5.0 / 7.0;
        (local.len() as f64) < GAP_COVERAGE_RATIO * expected
    }

    async fn fetch_with_fallback(&self, code: &str, start: NaiveDate, end: NaiveDate) -> anyhow::Result<Vec<DailyBar>> {
        tokio::time::sleep(std::time::Duration::from_millis(self.rate_limit_ms)).await;
        match self.primary.fetch_daily(code, start, end).await {
            Ok(bars) => Ok(bars),
            Err(primary_err) => match &self.fallback {
                Some(fb) => fb.fetch_daily(code, start, end).await.map_err(|fallback_err| {
                    anyhow::anyhow!("primary failed ({primary_err}); fallback failed ({fallback_err})")
                }),
                None => Err(primary_err),
            },
        }
    }

    /// `repairDailyGaps`: for each trading date in `[start, end]` whose local
    /// row count falls below the observed-max-derived threshold, issue one
    /// batch-by-date fetch covering every stock for that date.
    pub async fn repair_daily_gaps(
        &self,
        conn: &Connection,
        start: NaiveDate,
        end: NaiveDate,
        mut on_progress: impl FnMut(NaiveDate, usize),
    ) -> CoreResult<usize> {
        let trading_dates = repo::open_dates_between(conn, "SSE", start, end)?;
        if trading_dates.is_empty() {
            return Ok(0);
        }

        let counts = per_date_counts(conn, &trading_dates)?;
        let max_observed = counts.values().copied().max().unwrap_or(0) as f64;
        let threshold = (GAP_REPAIR_RATIO * max_observed).max(GAP_REPAIR_MIN_THRESHOLD);

        let mut repaired = 0usize;
        for date in trading_dates {
            let count = counts.get(&date).copied().unwrap_or(0) as f64;
            if count >= threshold {
                continue;
            }
            tokio::time::sleep(std::time::Duration::from_millis(self.rate_limit_ms)).await;
            match self.primary.fetch_all_for_date(date).await {
                Ok(bars) => {
                    let tx = conn.unchecked_transaction()?;
                    for (code, bar) in &bars {
                        if repo::upsert_daily_bar(&tx, code, bar).is_err() {
                            continue;
                        }
                    }
                    tx.commit()?;
                    repaired += 1;
                    on_progress(date, bars.len());
                }
                Err(e) => tracing::warn!(%date, error = %e, "batch-by-date gap repair failed"),
            }
        }
        Ok(repaired)
    }
}

fn merge(local: Vec<DailyBar>, fetched: Vec<DailyBar>) -> Vec<DailyBar> {
    let mut by_date: HashMap<NaiveDate, DailyBar> = local.into_iter().map(|b| (b.date, b)).collect();
    for bar in fetched {
        by_date.insert(bar.date, bar);
    }
    let mut merged: Vec<DailyBar> = by_date.into_values().collect();
    merged.sort_by_key(|b| b.date);
    merged
}

fn per_date_counts(conn: &Connection, dates: &[NaiveDate]) -> CoreResult<HashMap<NaiveDate, i64>> {
    let mut stmt = conn.prepare("SELECT date, COUNT(*) FROM daily_price WHERE date = ?1")?;
    let mut counts = HashMap::new();
    for &date in dates {
        let n: i64 = stmt.query_row(rusqlite::params![date.format("%Y-%m-%d").to_string()], |r| r.get(0))?;
        counts.insert(date, n);
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Pool;

    fn bar(date: NaiveDate, close: f64) -> DailyBar {
        DailyBar { date, open: close, high: close, low: close, close, volume: 100.0, amount: close * 100.0 }
    }

    #[test]
    fn needs_fetch_true_when_no_local_rows() {
        let pool = Pool::open_in_memory().unwrap();
        let conn = pool.get().unwrap();
        let collector = Collector::new(
            &DataSourcesConfig::default(),
            Box::new(TushareSource::new(None)),
            Some(Box::new(AkshareSource::new())),
        );
        let _ = &conn;
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        assert!(collector.needs_fetch(&[], start, end));
    }

    #[test]
    fn needs_fetch_false_when_window_fully_covered() {
        let collector = Collector::new(
            &DataSourcesConfig::default(),
            Box::new(TushareSource::new(None)),
            None,
        );
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let local: Vec<DailyBar> = (0..5).map(|i| bar(start + Duration::days(i), 10.0)).collect();
        assert!(!collector.needs_fetch(&local, start, end));
    }

    #[test]
    fn merge_prefers_freshly_fetched_rows() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let local = vec![bar(d, 10.0)];
        let fetched = vec![bar(d, 11.0)];
        let merged = merge(local, fetched);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].close, 11.0);
    }
}
