use thiserror::Error;

/// Structured error variants that cross a module boundary and need to be
/// matched on by a caller (watchdog vs. per-candidate failure, etc).
/// Errors that are purely "log and continue" (external fetch failure, LLM
/// failure) are represented as `anyhow::Error` at the call site instead.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("experiment {0} not found")]
    ExperimentNotFound(i64),

    #[error("strategy '{name}' produced a signal explosion on {day}: {count} entries")]
    SignalExplosion {
        name: String,
        day: chrono::NaiveDate,
        count: usize,
    },

    #[error("backtest timed out")]
    BacktestTimeout,

    #[error("watchdog timeout: {minutes} min exceeded")]
    WatchdogTimeout { minutes: u64 },

    #[error("strategy conditions are unreachable: {0}")]
    Unreachable(String),

    #[error("database busy: {0}")]
    DbBusy(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("resource is actively running and cannot be modified")]
    Conflict,

    #[error("validation error: {0}")]
    Validation(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
