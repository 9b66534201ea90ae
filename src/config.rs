//! Configuration loading: defaults < `config/config.yaml` < `config/local.toml`
//! < environment.
//!
//! Mirrors the precedence chain in spec §6. The YAML layer is merged by
//! deserializing it over a struct that already carries its `Default` impl;
//! the optional local TOML layer is merged key-by-key on top of that (so a
//! developer's `local.toml` can override a single field without repeating
//! the rest of `config.yaml`), then a handful of env vars the original
//! treats as secrets/toggles rather than tunables are overlaid last.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourcesConfig {
    pub realtime_quotes: String,
    pub historical_daily: String,
    pub index_data: String,
    pub sector_data: String,
    pub money_flow: String,
    pub stock_list: String,
    pub fallback_enabled: bool,
    pub rate_limit_ms: u64,
    pub tushare_per_minute_limit: u32,
}

impl Default for DataSourcesConfig {
    fn default() -> Self {
        Self {
            realtime_quotes: "tushare".into(),
            historical_daily: "tushare".into(),
            index_data: "tushare".into(),
            sector_data: "akshare".into(),
            money_flow: "akshare".into(),
            stock_list: "tushare".into(),
            fallback_enabled: true,
            rate_limit_ms: 300,
            tushare_per_minute_limit: 190,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    pub auto_refresh_hour: u32,
    pub auto_refresh_minute: u32,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            auto_refresh_hour: 9,
            auto_refresh_minute: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskControlConfig {
    pub default_capital: f64,
    pub max_positions: u32,
    pub max_position_pct: f64,
}

impl Default for RiskControlConfig {
    fn default() -> Self {
        Self {
            default_capital: 100_000.0,
            max_positions: 10,
            max_position_pct: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepseekConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for DeepseekConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".into(),
            model: "deepseek-chat".into(),
            timeout_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiLabConfig {
    pub weight_return: f64,
    pub weight_drawdown: f64,
    pub weight_sharpe: f64,
    pub weight_plr: f64,
}

impl Default for AiLabConfig {
    fn default() -> Self {
        Self {
            weight_return: 0.30,
            weight_drawdown: 0.25,
            weight_sharpe: 0.25,
            weight_plr: 0.20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub db_path: String,
    pub data_sources: DataSourcesConfig,
    pub signals: SignalsConfig,
    pub risk_control: RiskControlConfig,
    pub deepseek: DeepseekConfig,
    pub ai_lab: AiLabConfig,
    #[serde(skip)]
    pub tushare_token: Option<String>,
    #[serde(skip)]
    pub deepseek_api_key: Option<String>,
    #[serde(skip)]
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "data/ashare_quant.db".into(),
            data_sources: DataSourcesConfig::default(),
            signals: SignalsConfig::default(),
            risk_control: RiskControlConfig::default(),
            deepseek: DeepseekConfig::default(),
            ai_lab: AiLabConfig::default(),
            tushare_token: None,
            deepseek_api_key: None,
            debug: false,
        }
    }
}

/// Per-host overrides not meant to be committed to `config.yaml`, e.g. a
/// developer's local Tushare rate limit or db path. Optional; merged over
/// the YAML layer field-by-field rather than replacing it wholesale.
const LOCAL_TOML_OVERRIDE: &str = "config/local.toml";

/// Recursively overlay `patch`'s keys onto `base`, leaving any key absent
/// from `patch` untouched. Arrays and scalars in `patch` replace `base`
/// outright.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                merge_json(base_map.entry(k).or_insert(serde_json::Value::Null), v);
            }
        }
        (base_slot, patch_value) => *base_slot = patch_value,
    }
}

impl AppConfig {
    /// Load defaults, overlay `config/config.yaml` if present, overlay
    /// `config/local.toml` if present, then overlay environment variables.
    /// Never errors on a missing file — only a malformed one.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from_with_override(Path::new("config/config.yaml"), Path::new(LOCAL_TOML_OVERRIDE))
    }

    pub fn load_from(yaml_path: &Path) -> anyhow::Result<Self> {
        Self::load_from_with_override(yaml_path, Path::new(LOCAL_TOML_OVERRIDE))
    }

    pub fn load_from_with_override(yaml_path: &Path, local_toml_path: &Path) -> anyhow::Result<Self> {
        let mut cfg = if yaml_path.exists() {
            let raw = std::fs::read_to_string(yaml_path)?;
            serde_yaml::from_str(&raw)?
        } else {
            Self::default()
        };

        if local_toml_path.exists() {
            let raw = std::fs::read_to_string(local_toml_path)?;
            let overlay: toml::Value = toml::from_str(&raw)?;
            let mut merged = serde_json::to_value(&cfg)?;
            merge_json(&mut merged, serde_json::to_value(overlay)?);
            cfg = serde_json::from_value(merged)?;
        }

        cfg.tushare_token = std::env::var("TUSHARE_TOKEN").ok();
        cfg.deepseek_api_key = std::env::var("DEEPSEEK_API_KEY").ok();
        cfg.debug = std::env::var("DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_weights() {
        let cfg = AppConfig::default();
        assert!((cfg.ai_lab.weight_return - 0.30).abs() < f64::EPSILON);
        assert!((cfg.ai_lab.weight_drawdown - 0.25).abs() < f64::EPSILON);
        assert!((cfg.ai_lab.weight_sharpe - 0.25).abs() < f64::EPSILON);
        assert!((cfg.ai_lab.weight_plr - 0.20).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_yaml_falls_back_to_defaults() {
        let cfg = AppConfig::load_from(Path::new("/nonexistent/config.yaml")).unwrap();
        assert_eq!(cfg.db_path, "data/ashare_quant.db");
    }

    #[test]
    fn yaml_overlay_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "db_path: /tmp/custom.db\nsignals:\n  auto_refresh_hour: 15\n",
        )
        .unwrap();
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.db_path, "/tmp/custom.db");
        assert_eq!(cfg.signals.auto_refresh_hour, 15);
        // Untouched keys keep their defaults
        assert_eq!(cfg.risk_control.max_positions, 10);
    }

    #[test]
    fn local_toml_overlays_a_single_field_without_disturbing_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.path().join("config.yaml");
        std::fs::write(
            &yaml_path,
            "db_path: /tmp/custom.db\nsignals:\n  auto_refresh_hour: 15\n",
        )
        .unwrap();
        let toml_path = dir.path().join("local.toml");
        std::fs::write(&toml_path, "[data_sources]\ntushare_per_minute_limit = 90\n").unwrap();

        let cfg = AppConfig::load_from_with_override(&yaml_path, &toml_path).unwrap();
        assert_eq!(cfg.data_sources.tushare_per_minute_limit, 90);
        // Fields set by the YAML layer and untouched by local.toml survive.
        assert_eq!(cfg.db_path, "/tmp/custom.db");
        assert_eq!(cfg.signals.auto_refresh_hour, 15);
        // Fields untouched by either layer keep their defaults.
        assert_eq!(cfg.risk_control.max_positions, 10);
    }

    #[test]
    fn missing_local_toml_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.path().join("config.yaml");
        std::fs::write(&yaml_path, "db_path: /tmp/custom.db\n").unwrap();
        let cfg = AppConfig::load_from_with_override(&yaml_path, Path::new("/nonexistent/local.toml")).unwrap();
        assert_eq!(cfg.db_path, "/tmp/custom.db");
    }
}
