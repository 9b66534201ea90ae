//! Field/indicator catalog: membership, value bounds, and default
//! parameters. The Python original keeps this as a module-level dict
//! (`src/indicators/indicator_calculator.py`); the idiomatic replacement
//! used throughout this corpus's sibling repos is a `once_cell::sync::Lazy`
//! static, so that's what this crate uses instead of a `phf` map or a
//! runtime-built `HashMap` rebuilt on every lookup.

use super::Params;
use once_cell::sync::Lazy;
use ordered_float::OrderedFloat;
use std::collections::HashMap;

/// The inclusive numeric range a `compare_type=value` threshold against
/// this field must fall inside (spec.md §4.2 step 3). `None` means the
/// field cannot be value-compared at all — only field-to-field.
#[derive(Debug, Clone, Copy)]
pub struct ValueBounds {
    pub min: f64,
    pub max: f64,
    /// Reject thresholds strictly below this even when `>= min` (the
    /// close/open/high/low price-percentage-misuse guard).
    pub reject_below: Option<f64>,
}

pub struct IndicatorMeta {
    pub bounds: Option<ValueBounds>,
    pub requires_field_compare: bool,
    pub default_params: fn() -> Params,
}

fn no_params() -> Params {
    Params::new()
}

fn ma_params() -> Params {
    let mut p = Params::new();
    p.insert("period".into(), OrderedFloat(20.0));
    p
}

fn boll_params() -> Params {
    let mut p = Params::new();
    p.insert("length".into(), OrderedFloat(20.0));
    p.insert("std".into(), OrderedFloat(2.0));
    p
}

fn psar_params() -> Params {
    let mut p = Params::new();
    p.insert("step".into(), OrderedFloat(0.02));
    p.insert("max_step".into(), OrderedFloat(0.2));
    p
}

fn bounded(min: f64, max: f64) -> Option<ValueBounds> {
    Some(ValueBounds {
        min,
        max,
        reject_below: None,
    })
}

static REGISTRY: Lazy<HashMap<&'static str, IndicatorMeta>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, IndicatorMeta> = HashMap::new();

    for name in ["RSI", "KDJ_K", "KDJ_D", "MFI", "ADX", "ADX_PDI", "ADX_MDI", "STOCHRSI_K", "STOCHRSI_D"] {
        m.insert(
            name,
            IndicatorMeta {
                bounds: bounded(0.0, 100.0),
                requires_field_compare: false,
                default_params: no_params,
            },
        );
    }
    m.insert(
        "KDJ_J",
        IndicatorMeta {
            bounds: bounded(-20.0, 120.0),
            requires_field_compare: false,
            default_params: no_params,
        },
    );
    m.insert(
        "CCI",
        IndicatorMeta {
            bounds: bounded(-500.0, 500.0),
            requires_field_compare: false,
            default_params: no_params,
        },
    );
    m.insert(
        "WR",
        IndicatorMeta {
            bounds: bounded(-100.0, 0.0),
            requires_field_compare: false,
            default_params: no_params,
        },
    );
    m.insert(
        "ROC",
        IndicatorMeta {
            bounds: bounded(-50.0, 50.0),
            requires_field_compare: false,
            default_params: no_params,
        },
    );
    for name in ["CMF", "TRIX"] {
        m.insert(
            name,
            IndicatorMeta {
                bounds: bounded(-1.0, 1.0),
                requires_field_compare: false,
                default_params: no_params,
            },
        );
    }
    m.insert(
        "DPO",
        IndicatorMeta {
            bounds: bounded(-100.0, 100.0),
            requires_field_compare: false,
            default_params: no_params,
        },
    );
    m.insert(
        "ATR",
        IndicatorMeta {
            bounds: bounded(0.1, 500.0),
            requires_field_compare: false,
            default_params: no_params,
        },
    );
    for name in ["close", "open", "high", "low"] {
        m.insert(
            name,
            IndicatorMeta {
                bounds: Some(ValueBounds {
                    min: 1.0,
                    max: 10_000.0,
                    reject_below: Some(2.0),
                }),
                requires_field_compare: false,
                default_params: no_params,
            },
        );
    }
    for name in ["BOLL_UPPER", "BOLL_LOWER", "VWAP", "OBV"] {
        m.insert(
            name,
            IndicatorMeta {
                bounds: None,
                requires_field_compare: true,
                default_params: if name.starts_with("BOLL") { boll_params } else { no_params },
            },
        );
    }
    m.insert(
        "MA",
        IndicatorMeta {
            bounds: None,
            requires_field_compare: true,
            default_params: ma_params,
        },
    );
    m.insert(
        "EMA",
        IndicatorMeta {
            bounds: None,
            requires_field_compare: true,
            default_params: ma_params,
        },
    );
    m.insert(
        "PSAR",
        IndicatorMeta {
            bounds: None,
            requires_field_compare: true,
            default_params: psar_params,
        },
    );
    m.insert(
        "MACD",
        IndicatorMeta {
            bounds: None,
            requires_field_compare: true,
            default_params: no_params,
        },
    );
    m.insert(
        "MACD_HIST",
        IndicatorMeta {
            bounds: bounded(-50.0, 50.0),
            requires_field_compare: false,
            default_params: no_params,
        },
    );
    m.insert(
        "volume",
        IndicatorMeta {
            bounds: None,
            requires_field_compare: true,
            default_params: no_params,
        },
    );

    m
});

pub fn is_known_field(field: &str) -> bool {
    REGISTRY.contains_key(field)
}

pub fn bounds(field: &str) -> Option<ValueBounds> {
    REGISTRY.get(field).and_then(|m| m.bounds)
}

pub fn requires_field_compare(field: &str) -> bool {
    REGISTRY.get(field).is_some_and(|m| m.requires_field_compare)
}

pub fn default_params(field: &str) -> Params {
    REGISTRY.get(field).map_or_else(Params::new, |m| (m.default_params)())
}

/// A field counts as a "price field" for the auto-swap rule (spec.md §4.2
/// step 4) if it's a raw OHLCV column rather than a derived indicator.
pub fn is_price_field(field: &str) -> bool {
    matches!(field, "close" | "open" | "high" | "low" | "volume")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_bounds_are_0_to_100() {
        let b = bounds("RSI").unwrap();
        assert_eq!((b.min, b.max), (0.0, 100.0));
    }

    #[test]
    fn boll_requires_field_compare_and_has_defaults() {
        assert!(requires_field_compare("BOLL_UPPER"));
        let p = default_params("BOLL_UPPER");
        assert_eq!(p.get("length").copied().map(|v| v.0), Some(20.0));
        assert_eq!(p.get("std").copied().map(|v| v.0), Some(2.0));
    }

    #[test]
    fn unknown_field_is_not_known() {
        assert!(!is_known_field("NOT_A_FIELD"));
    }

    #[test]
    fn price_fields_reject_small_thresholds() {
        let b = bounds("close").unwrap();
        assert_eq!(b.reject_below, Some(2.0));
    }
}
