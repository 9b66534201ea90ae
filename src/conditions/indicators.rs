//! Indicator materialization: turns a `(field, params)` pair into a
//! `Vec<f64>` aligned 1:1 with a bar series, NaN-padded at the front where
//! the indicator needs more history than is available yet.
//!
//! Where `rust_ti` has the indicator, it's used directly (`standard_indicators`
//! for RSI/MACD, `momentum_indicators` for money-flow-index/OBV — the same
//! functions `signals/momentum.rs` and `signals/volume.rs` call). Indicators
//! `rust_ti` doesn't expose (KDJ, CCI, Williams %R, CMF, TRIX, DPO, ADX,
//! anchored VWAP, Parabolic SAR) are computed with the same "windowed manual
//! loop" idiom `signals/trend.rs` uses for Aroon/Supertrend.

use super::Params;
use crate::db::models::DailyBar;
use rust_ti::standard_indicators::bulk as sti;
use std::cell::RefCell;
use std::collections::HashMap;

/// A window of bars plus a lazily-computed, memoized cache of indicator
/// series keyed by a `(field, params)` fingerprint. One `IndicatorFrame` is
/// built per code per evaluation window (spec.md §4.3 step 1, §4.4).
pub struct IndicatorFrame<'a> {
    bars: &'a [DailyBar],
    cache: RefCell<HashMap<String, Vec<f64>>>,
}

fn fingerprint(field: &str, params: &Params) -> String {
    let mut key = String::from(field);
    for (k, v) in params {
        key.push(':');
        key.push_str(k);
        key.push('=');
        key.push_str(&v.0.to_string());
    }
    key
}

fn param(params: &Params, name: &str, default: f64) -> f64 {
    params.get(name).map_or(default, |v| v.0)
}

impl<'a> IndicatorFrame<'a> {
    pub fn new(bars: &'a [DailyBar]) -> Self {
        Self {
            bars,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    fn series(&self, field: &str, params: &Params) -> Vec<f64> {
        let key = fingerprint(field, params);
        if let Some(v) = self.cache.borrow().get(&key) {
            return v.clone();
        }
        let computed = compute_series(field, params, self.bars);
        self.cache.borrow_mut().insert(key, computed.clone());
        computed
    }

    pub fn value_at(&self, field: &str, params: &Params, idx: usize) -> Option<f64> {
        let s = self.series(field, params);
        s.get(idx).copied().filter(|v| !v.is_nan())
    }

    pub fn window_min(&self, field: &str, params: &Params, idx: usize, n: usize) -> Option<f64> {
        let s = self.series(field, params);
        window_slice(&s, idx, n).and_then(|w| {
            w.iter().copied().filter(|v| !v.is_nan()).fold(None, |acc, v| {
                Some(acc.map_or(v, |a: f64| a.min(v)))
            })
        })
    }

    pub fn window_max(&self, field: &str, params: &Params, idx: usize, n: usize) -> Option<f64> {
        let s = self.series(field, params);
        window_slice(&s, idx, n).and_then(|w| {
            w.iter().copied().filter(|v| !v.is_nan()).fold(None, |acc, v| {
                Some(acc.map_or(v, |a: f64| a.max(v)))
            })
        })
    }

    pub fn is_consecutive(
        &self,
        field: &str,
        params: &Params,
        idx: usize,
        n: usize,
        direction: super::ConsecutiveDirection,
    ) -> bool {
        let s = self.series(field, params);
        let Some(w) = window_slice(&s, idx, n.max(1)) else {
            return false;
        };
        if w.iter().any(|v| v.is_nan()) || w.len() < 2 {
            return false;
        }
        w.windows(2).all(|pair| match direction {
            super::ConsecutiveDirection::Rising => pair[1] > pair[0],
            super::ConsecutiveDirection::Falling => pair[1] < pair[0],
        })
    }
}

/// Returns the inclusive window `[idx - n + 1 ..= idx]`, or `None` if that
/// range runs off the front of the series.
fn window_slice(series: &[f64], idx: usize, n: usize) -> Option<&[f64]> {
    let start = idx.checked_add(1)?.checked_sub(n)?;
    series.get(start..=idx)
}

fn left_pad(mut values: Vec<f64>, total_len: usize) -> Vec<f64> {
    if values.len() >= total_len {
        return values;
    }
    let mut padded = vec![f64::NAN; total_len - values.len()];
    padded.append(&mut values);
    padded
}

fn sma(series: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || series.len() < period {
        return vec![f64::NAN; series.len()];
    }
    let body: Vec<f64> = series
        .windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect();
    left_pad(body, series.len())
}

fn ema(series: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || series.len() < period {
        return vec![f64::NAN; series.len()];
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = vec![f64::NAN; period - 1];
    let seed = series[..period].iter().sum::<f64>() / period as f64;
    out.push(seed);
    let mut prev = seed;
    for v in &series[period..] {
        let next = v * k + prev * (1.0 - k);
        out.push(next);
        prev = next;
    }
    out
}

fn stddev(window: &[f64], mean: f64) -> f64 {
    (window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window.len() as f64).sqrt()
}

fn compute_series(field: &str, params: &Params, bars: &[DailyBar]) -> Vec<f64> {
    let n = bars.len();
    match field {
        "close" => bars.iter().map(|b| b.close).collect(),
        "open" => bars.iter().map(|b| b.open).collect(),
        "high" => bars.iter().map(|b| b.high).collect(),
        "low" => bars.iter().map(|b| b.low).collect(),
        "volume" => bars.iter().map(|b| b.volume).collect(),

        "MA" => {
            let period = param(params, "period", 20.0) as usize;
            sma(&closes(bars), period)
        }
        "EMA" => {
            let period = param(params, "period", 20.0) as usize;
            ema(&closes(bars), period)
        }

        "RSI" => {
            let closes = closes(bars);
            if closes.len() < 15 {
                return vec![f64::NAN; n];
            }
            left_pad(sti::rsi(&closes), n)
        }

        "MACD" | "MACD_HIST" => {
            let closes = closes(bars);
            if closes.len() < 35 {
                return vec![f64::NAN; n];
            }
            let macd = sti::macd(&closes);
            let idx = if field == "MACD" { 0 } else { 2 };
            left_pad(macd.iter().map(|t| pick3(*t, idx)).collect(), n)
        }

        "MFI" => {
            let period = param(params, "period", 14.0) as usize;
            let typical = typical_prices(bars);
            let volume = volumes(bars);
            if typical.len() <= period {
                return vec![f64::NAN; n];
            }
            left_pad(
                rust_ti::momentum_indicators::bulk::money_flow_index(&typical, &volume, period),
                n,
            )
        }

        "OBV" => rust_ti::momentum_indicators::bulk::on_balance_volume(
            &closes(bars),
            &volumes(bars),
            0.0,
        ),

        "KDJ_K" => kdj_k(bars, param(params, "period", 9.0) as usize),
        "KDJ_D" => {
            let k = kdj_k(bars, param(params, "period", 9.0) as usize);
            sma(&k, 3)
        }
        "KDJ_J" => {
            let k = kdj_k(bars, param(params, "period", 9.0) as usize);
            let d = sma(&k, 3);
            k.iter()
                .zip(d.iter())
                .map(|(k, d)| 3.0 * k - 2.0 * d)
                .collect()
        }

        "STOCHRSI_K" => {
            let rsi = compute_series("RSI", &Params::new(), bars);
            stoch_of(&rsi, param(params, "period", 14.0) as usize)
        }
        "STOCHRSI_D" => {
            let k = compute_series("STOCHRSI_K", params, bars);
            sma(&k, 3)
        }

        "CCI" => cci(bars, param(params, "period", 20.0) as usize),
        "WR" => williams_r(bars, param(params, "period", 14.0) as usize),
        "ROC" => {
            let period = param(params, "period", 12.0) as usize;
            let closes = closes(bars);
            let mut out = vec![f64::NAN; period];
            for i in period..closes.len() {
                let prev = closes[i - period];
                out.push(if prev == 0.0 { f64::NAN } else { (closes[i] - prev) / prev * 100.0 });
            }
            out
        }
        "CMF" => cmf(bars, param(params, "period", 20.0) as usize),
        "TRIX" => trix(bars, param(params, "period", 15.0) as usize),
        "DPO" => dpo(bars, param(params, "period", 20.0) as usize),
        "ADX" | "ADX_PDI" | "ADX_MDI" => adx(bars, param(params, "period", 14.0) as usize, field),

        "BOLL_UPPER" | "BOLL_LOWER" => {
            let length = param(params, "length", 20.0) as usize;
            let std_mult = param(params, "std", 2.0);
            let closes = closes(bars);
            if closes.len() < length {
                return vec![f64::NAN; n];
            }
            let body: Vec<f64> = closes
                .windows(length)
                .map(|w| {
                    let mean = w.iter().sum::<f64>() / length as f64;
                    let sd = stddev(w, mean);
                    if field == "BOLL_UPPER" {
                        mean + std_mult * sd
                    } else {
                        mean - std_mult * sd
                    }
                })
                .collect();
            left_pad(body, n)
        }

        "VWAP" => {
            let mut cum_amount = 0.0;
            let mut cum_volume = 0.0;
            bars.iter()
                .map(|b| {
                    cum_amount += b.amount;
                    cum_volume += b.volume;
                    if cum_volume == 0.0 { f64::NAN } else { cum_amount / cum_volume }
                })
                .collect()
        }

        "PSAR" => psar(bars, param(params, "step", 0.02), param(params, "max_step", 0.2)),

        _ => vec![f64::NAN; n],
    }
}

fn pick3(t: (f64, f64, f64), idx: usize) -> f64 {
    match idx {
        0 => t.0,
        1 => t.1,
        _ => t.2,
    }
}

fn closes(bars: &[DailyBar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

fn volumes(bars: &[DailyBar]) -> Vec<f64> {
    bars.iter().map(|b| b.volume).collect()
}

fn typical_prices(bars: &[DailyBar]) -> Vec<f64> {
    bars.iter().map(|b| (b.high + b.low + b.close) / 3.0).collect()
}

fn kdj_k(bars: &[DailyBar], period: usize) -> Vec<f64> {
    let n = bars.len();
    if period == 0 || n < period {
        return vec![f64::NAN; n];
    }
    let body: Vec<f64> = (0..=n - period)
        .map(|start| {
            let window = &bars[start..start + period];
            let hi = window.iter().fold(f64::MIN, |a, b| a.max(b.high));
            let lo = window.iter().fold(f64::MAX, |a, b| a.min(b.low));
            let close = window.last().unwrap().close;
            if hi == lo { 50.0 } else { (close - lo) / (hi - lo) * 100.0 }
        })
        .collect();
    left_pad(body, n)
}

fn stoch_of(series: &[f64], period: usize) -> Vec<f64> {
    let n = series.len();
    if period == 0 || n < period {
        return vec![f64::NAN; n];
    }
    let body: Vec<f64> = series
        .windows(period)
        .map(|w| {
            if w.iter().any(|v| v.is_nan()) {
                return f64::NAN;
            }
            let hi = w.iter().copied().fold(f64::MIN, f64::max);
            let lo = w.iter().copied().fold(f64::MAX, f64::min);
            let last = *w.last().unwrap();
            if hi == lo { 50.0 } else { (last - lo) / (hi - lo) * 100.0 }
        })
        .collect();
    left_pad(body, n)
}

fn cci(bars: &[DailyBar], period: usize) -> Vec<f64> {
    let n = bars.len();
    let tp = typical_prices(bars);
    if period == 0 || n < period {
        return vec![f64::NAN; n];
    }
    let body: Vec<f64> = tp
        .windows(period)
        .map(|w| {
            let mean = w.iter().sum::<f64>() / period as f64;
            let mean_dev = w.iter().map(|v| (v - mean).abs()).sum::<f64>() / period as f64;
            let last = *w.last().unwrap();
            if mean_dev == 0.0 { 0.0 } else { (last - mean) / (0.015 * mean_dev) }
        })
        .collect();
    left_pad(body, n)
}

fn williams_r(bars: &[DailyBar], period: usize) -> Vec<f64> {
    let n = bars.len();
    if period == 0 || n < period {
        return vec![f64::NAN; n];
    }
    let body: Vec<f64> = bars
        .windows(period)
        .map(|w| {
            let hi = w.iter().fold(f64::MIN, |a, b| a.max(b.high));
            let lo = w.iter().fold(f64::MAX, |a, b| a.min(b.low));
            let close = w.last().unwrap().close;
            if hi == lo { -50.0 } else { -100.0 * (hi - close) / (hi - lo) }
        })
        .collect();
    left_pad(body, n)
}

fn cmf(bars: &[DailyBar], period: usize) -> Vec<f64> {
    let n = bars.len();
    if period == 0 || n < period {
        return vec![f64::NAN; n];
    }
    let body: Vec<f64> = bars
        .windows(period)
        .map(|w| {
            let mut mf_sum = 0.0;
            let mut vol_sum = 0.0;
            for b in w {
                let range = b.high - b.low;
                let mfm = if range == 0.0 { 0.0 } else { ((b.close - b.low) - (b.high - b.close)) / range };
                mf_sum += mfm * b.volume;
                vol_sum += b.volume;
            }
            if vol_sum == 0.0 { 0.0 } else { mf_sum / vol_sum }
        })
        .collect();
    left_pad(body, n)
}

fn trix(bars: &[DailyBar], period: usize) -> Vec<f64> {
    let closes = closes(bars);
    let e1 = ema(&closes, period);
    let e2 = ema(&e1.iter().map(|v| if v.is_nan() { 0.0 } else { *v }).collect::<Vec<_>>(), period);
    let e3 = ema(&e2.iter().map(|v| if v.is_nan() { 0.0 } else { *v }).collect::<Vec<_>>(), period);
    let mut out = vec![f64::NAN; e3.len()];
    for i in 1..e3.len() {
        if e3[i - 1].is_nan() || e3[i].is_nan() || e3[i - 1] == 0.0 {
            continue;
        }
        out[i] = (e3[i] - e3[i - 1]) / e3[i - 1];
    }
    out
}

fn dpo(bars: &[DailyBar], period: usize) -> Vec<f64> {
    let closes = closes(bars);
    let shift = period / 2 + 1;
    let avg = sma(&closes, period);
    let n = closes.len();
    (0..n)
        .map(|i| {
            if i < shift || avg.get(i).is_none_or(|v| v.is_nan()) {
                f64::NAN
            } else {
                closes[i - shift] - avg[i]
            }
        })
        .collect()
}

/// Wilder's ADX/+DI/-DI, smoothed with a simple rolling average rather than
/// Wilder's exact recursive smoothing — close enough for condition
/// evaluation and avoids carrying extra per-series state.
fn adx(bars: &[DailyBar], period: usize, field: &str) -> Vec<f64> {
    let n = bars.len();
    if period == 0 || n < period + 1 {
        return vec![f64::NAN; n];
    }
    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];
    let mut tr = vec![0.0; n];
    for i in 1..n {
        let up_move = bars[i].high - bars[i - 1].high;
        let down_move = bars[i - 1].low - bars[i].low;
        plus_dm[i] = if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 };
        minus_dm[i] = if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 };
        tr[i] = (bars[i].high - bars[i].low)
            .max((bars[i].high - bars[i - 1].close).abs())
            .max((bars[i].low - bars[i - 1].close).abs());
    }
    let smoothed_tr = sma(&tr, period);
    let smoothed_plus = sma(&plus_dm, period);
    let smoothed_minus = sma(&minus_dm, period);
    let plus_di: Vec<f64> = smoothed_plus
        .iter()
        .zip(&smoothed_tr)
        .map(|(p, t)| if *t == 0.0 || t.is_nan() { f64::NAN } else { 100.0 * p / t })
        .collect();
    let minus_di: Vec<f64> = smoothed_minus
        .iter()
        .zip(&smoothed_tr)
        .map(|(m, t)| if *t == 0.0 || t.is_nan() { f64::NAN } else { 100.0 * m / t })
        .collect();
    match field {
        "ADX_PDI" => return plus_di,
        "ADX_MDI" => return minus_di,
        _ => {}
    }
    let dx: Vec<f64> = plus_di
        .iter()
        .zip(&minus_di)
        .map(|(p, m)| {
            if p.is_nan() || m.is_nan() || p + m == 0.0 {
                f64::NAN
            } else {
                100.0 * (p - m).abs() / (p + m)
            }
        })
        .collect();
    sma(&dx.iter().map(|v| if v.is_nan() { 0.0 } else { *v }).collect::<Vec<_>>(), period)
}

/// Parabolic SAR, the standard Wilder iterative algorithm.
fn psar(bars: &[DailyBar], step: f64, max_step: f64) -> Vec<f64> {
    let n = bars.len();
    if n < 2 {
        return vec![f64::NAN; n];
    }
    let mut out = vec![f64::NAN; n];
    let mut rising = bars[1].close >= bars[0].close;
    let mut af = step;
    let mut ep = if rising { bars[0].high } else { bars[0].low };
    let mut sar = if rising { bars[0].low } else { bars[0].high };
    out[0] = sar;
    for i in 1..n {
        sar += af * (ep - sar);
        if rising {
            if bars[i].low < sar {
                rising = false;
                sar = ep;
                ep = bars[i].low;
                af = step;
            } else {
                if bars[i].high > ep {
                    ep = bars[i].high;
                    af = (af + step).min(max_step);
                }
                sar = sar.min(bars[i.saturating_sub(1)].low);
            }
        } else if bars[i].high > sar {
            rising = true;
            sar = ep;
            ep = bars[i].high;
            af = step;
        } else {
            if bars[i].low < ep {
                ep = bars[i].low;
                af = (af + step).min(max_step);
            }
            sar = sar.max(bars[i.saturating_sub(1)].high);
        }
        out[i] = sar;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn make_bars(closes: &[f64]) -> Vec<DailyBar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| DailyBar {
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i as i64),
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 1000.0 + i as f64,
                amount: c * (1000.0 + i as f64),
            })
            .collect()
    }

    #[test]
    fn ma_is_nan_until_period_reached() {
        let bars = make_bars(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let frame = IndicatorFrame::new(&bars);
        let mut params = Params::new();
        params.insert("period".into(), ordered_float::OrderedFloat(3.0));
        assert!(frame.value_at("MA", &params, 1).is_none());
        assert_eq!(frame.value_at("MA", &params, 2), Some(2.0));
        assert_eq!(frame.value_at("MA", &params, 4), Some(4.0));
    }

    #[test]
    fn window_min_max_respect_boundaries() {
        let bars = make_bars(&[5.0, 1.0, 9.0, 3.0]);
        let frame = IndicatorFrame::new(&bars);
        let params = Params::new();
        assert_eq!(frame.window_min("close", &params, 2, 3), Some(1.0));
        assert_eq!(frame.window_max("close", &params, 2, 3), Some(9.0));
        assert_eq!(frame.window_min("close", &params, 0, 3), Some(5.0));
    }

    #[test]
    fn consecutive_rising_detects_strict_increase() {
        let bars = make_bars(&[1.0, 2.0, 3.0, 2.5]);
        let frame = IndicatorFrame::new(&bars);
        let params = Params::new();
        assert!(frame.is_consecutive("close", &params, 2, 3, super::super::ConsecutiveDirection::Rising));
        assert!(!frame.is_consecutive("close", &params, 3, 3, super::super::ConsecutiveDirection::Rising));
    }

    #[test]
    fn rsi_caches_between_lookups() {
        let closes: Vec<f64> = (0..30).map(|i| 10.0 + (i as f64 * 0.3).sin() * 3.0).collect();
        let bars = make_bars(&closes);
        let frame = IndicatorFrame::new(&bars);
        let params = Params::new();
        let a = frame.value_at("RSI", &params, 20);
        let b = frame.value_at("RSI", &params, 20);
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn unknown_field_yields_all_nan() {
        let bars = make_bars(&[1.0, 2.0, 3.0]);
        let frame = IndicatorFrame::new(&bars);
        assert!(frame.value_at("NOPE", &Params::new(), 2).is_none());
    }
}
