//! Multi-consumer progress bus (spec.md §4.1): an append-only event log
//! plus a finished flag guarded by one mutex, with consumers blocking on a
//! `Notify` rather than a condition variable (the async-land equivalent
//! spec.md §9 calls for). Late subscribers replay the full history from
//! offset 0 — that replay guarantee is the whole point of keeping the log
//! instead of a plain broadcast channel.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEventKind {
    Generating,
    StrategiesReady { strategies: serde_json::Value },
    DataIntegrity,
    DataIntegrityDone { repaired: usize },
    DataIntegrityWarning { message: String },
    LoadingData,
    DataLoaded { stock_count: usize, benchmark_return_pct: f64 },
    ComputingRegimes,
    RegimeWarning { message: String },
    BacktestStart { strategy_id: i64, name: String },
    BacktestDone { strategy_id: i64, name: String, score: f64 },
    BacktestSkip { strategy_id: i64, name: String, reason: String },
    BacktestError { strategy_id: i64, name: String, message: String },
    ExperimentDone { best_score: Option<f64> },
    ResumeStart,
    ExperimentStatus { status: String },
    Error { message: String },
    Info { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub offset: usize,
    pub kind: ProgressEventKind,
}

pub struct ProgressBus {
    log: Mutex<Vec<ProgressEvent>>,
    notify: Notify,
    finished: AtomicBool,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            notify: Notify::new(),
            finished: AtomicBool::new(false),
        }
    }

    pub fn push(&self, kind: ProgressEventKind) {
        let mut log = self.log.lock().expect("progress log poisoned");
        let offset = log.len();
        log.push(ProgressEvent { offset, kind });
        drop(log);
        self.notify.notify_waiters();
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.log.lock().expect("progress log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot_from(&self, offset: usize) -> Vec<ProgressEvent> {
        let log = self.log.lock().expect("progress log poisoned");
        if offset >= log.len() {
            Vec::new()
        } else {
            log[offset..].to_vec()
        }
    }

    /// Replay `[offset..]` immediately, then await new events, emitting a
    /// keepalive (not appended to the log) every 30 s of silence.
    /// Terminates once finished and the caller has drained everything.
    pub fn subscribe_from(self: std::sync::Arc<Self>, mut offset: usize) -> impl futures::Stream<Item = ProgressItem> {
        async_stream::stream! {
            loop {
                let batch = self.snapshot_from(offset);
                if !batch.is_empty() {
                    offset += batch.len();
                    for event in batch {
                        yield ProgressItem::Event(event);
                    }
                    continue;
                }

                if self.is_finished() {
                    return;
                }

                match tokio::time::timeout(KEEPALIVE_TIMEOUT, self.notify.notified()).await {
                    Ok(()) => continue,
                    Err(_) => yield ProgressItem::Keepalive,
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProgressItem {
    Event(ProgressEvent),
    Keepalive,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn late_subscriber_replays_full_history_from_zero() {
        let bus = std::sync::Arc::new(ProgressBus::new());
        bus.push(ProgressEventKind::Generating);
        bus.push(ProgressEventKind::LoadingData);
        bus.finish();

        let mut stream = Box::pin(bus.clone().subscribe_from(0));
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert!(matches!(first, ProgressItem::Event(e) if matches!(e.kind, ProgressEventKind::Generating)));
        assert!(matches!(second, ProgressItem::Event(e) if matches!(e.kind, ProgressEventKind::LoadingData)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn subscriber_from_nonzero_offset_skips_earlier_events() {
        let bus = std::sync::Arc::new(ProgressBus::new());
        bus.push(ProgressEventKind::Generating);
        bus.push(ProgressEventKind::LoadingData);
        bus.finish();

        let mut stream = Box::pin(bus.subscribe_from(1));
        let only = stream.next().await.unwrap();
        assert!(matches!(only, ProgressItem::Event(e) if matches!(e.kind, ProgressEventKind::LoadingData)));
        assert!(stream.next().await.is_none());
    }
}
