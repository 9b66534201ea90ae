//! External LLM contracts (spec.md §6 — wire format is out of scope; this
//! module defines the seams the rest of the core calls through). Grounded
//! on the teacher's own pattern of trait-boundary external collaborators
//! (`data::eodhd::EodhdProvider` there played the same role for market
//! data as these traits play for model calls here).

use crate::db::models::{AiRecommendation, Experiment};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod family;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateStrategy {
    pub name: String,
    pub description: String,
    pub buy_conditions: Vec<crate::conditions::Condition>,
    pub sell_conditions: Vec<crate::conditions::Condition>,
    pub exit_config: crate::db::models::ExitConfig,
}

/// Phase 1 of the Experiment Runner worker: turn an experiment's theme/source
/// text into N candidate strategies.
#[async_trait]
pub trait StrategyGenerator: Send + Sync {
    async fn generate(&self, experiment: &Experiment, count: usize) -> anyhow::Result<Vec<CandidateStrategy>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyAnalysis {
    pub market_regime: Option<String>,
    pub market_regime_confidence: Option<f64>,
    pub thinking_process: Option<String>,
    pub summary: Option<String>,
    pub recommendations: Vec<AiRecommendation>,
    pub strategy_actions: Vec<serde_json::Value>,
}

/// Scheduled Pipeline step 6: produce the day's market read and
/// stock-level recommendations.
#[async_trait]
pub trait DailyAnalyst: Send + Sync {
    async fn analyze(&self, trade_date: chrono::NaiveDate) -> anyhow::Result<DailyAnalysis>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyStats {
    pub family: String,
    /// The best-scoring variant's score, not a mean across variants —
    /// matches `build_family_summary`'s own "keep the best variant" shape.
    pub avg_score: f64,
    pub best_strategy_id: i64,
    pub strategy_ids: Vec<i64>,
}

/// Scheduled Pipeline step 5's optional family selector: given per-family
/// score statistics, pick which strategies to run the Signal Engine with.
/// Falls back to top-N by score on failure (the caller, not this trait,
/// owns that fallback since it needs the candidate list either way).
#[async_trait]
pub trait StrategyFamilySelector: Send + Sync {
    async fn select(&self, families: &[FamilyStats]) -> anyhow::Result<Vec<i64>>;
}

#[async_trait]
pub trait ChatAssistant: Send + Sync {
    async fn reply(&self, conversation: &[ChatMessage]) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Placeholder implementations that always fail; a deployment wires in a
/// real Deepseek-backed client satisfying these traits. Kept here so the
/// rest of the core compiles and is unit-testable against a contract
/// without depending on network access.
pub struct UnconfiguredLlm;

#[async_trait]
impl StrategyGenerator for UnconfiguredLlm {
    async fn generate(&self, _experiment: &Experiment, _count: usize) -> anyhow::Result<Vec<CandidateStrategy>> {
        anyhow::bail!("no strategy generator configured")
    }
}

#[async_trait]
impl DailyAnalyst for UnconfiguredLlm {
    async fn analyze(&self, _trade_date: chrono::NaiveDate) -> anyhow::Result<DailyAnalysis> {
        anyhow::bail!("no daily analyst configured")
    }
}

#[async_trait]
impl StrategyFamilySelector for UnconfiguredLlm {
    async fn select(&self, _families: &[FamilyStats]) -> anyhow::Result<Vec<i64>> {
        anyhow::bail!("no strategy family selector configured")
    }
}

#[async_trait]
impl ChatAssistant for UnconfiguredLlm {
    async fn reply(&self, _conversation: &[ChatMessage]) -> anyhow::Result<String> {
        anyhow::bail!("no chat assistant configured")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ExperimentStatus, SourceType};

    #[tokio::test]
    async fn unconfigured_generator_fails_clearly() {
        let llm = UnconfiguredLlm;
        let experiment = Experiment {
            id: 1,
            theme: "momentum".into(),
            source_type: SourceType::Template,
            source_text: String::new(),
            status: ExperimentStatus::Pending,
            capital: 100_000.0,
            max_positions: 10,
            max_position_pct: 30.0,
            strategy_count: 0,
        };
        let result = llm.generate(&experiment, 5).await;
        assert!(result.is_err());
    }
}
