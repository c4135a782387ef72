//! Per-bar indicator snapshots
//!
//! Every candle in a segment gets a snapshot computed from the bars up to
//! and including it. Bars before the warm-up window are marked not ready
//! and never trigger a pattern.

use serde::{Deserialize, Serialize};

use super::types::Candle;

/// Bars required before every indicator is defined
pub const WARMUP_BARS: usize = 30;

/// Indicator features a pattern predicate can test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// RSI(14), 0..100
    Rsi14,
    /// close / SMA(20) - 1
    SmaDeviation,
    /// 5-bar close-to-close return
    Momentum5,
    /// volume / mean volume over 20 bars
    VolumeRatio,
    /// stddev of 1-bar returns over 20 bars
    Volatility20,
    /// SMA(10) / SMA(30) - 1
    SmaSpread,
}

impl Feature {
    pub fn all() -> [Feature; 6] {
        [
            Feature::Rsi14,
            Feature::SmaDeviation,
            Feature::Momentum5,
            Feature::VolumeRatio,
            Feature::Volatility20,
            Feature::SmaSpread,
        ]
    }

    /// Plausible threshold range for random rule generation
    pub fn threshold_range(&self) -> (f64, f64) {
        match self {
            Feature::Rsi14 => (20.0, 80.0),
            Feature::SmaDeviation => (-0.03, 0.03),
            Feature::Momentum5 => (-0.03, 0.03),
            Feature::VolumeRatio => (0.5, 2.5),
            Feature::Volatility20 => (0.002, 0.03),
            Feature::SmaSpread => (-0.02, 0.02),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Rsi14 => "rsi14",
            Feature::SmaDeviation => "sma_dev",
            Feature::Momentum5 => "mom5",
            Feature::VolumeRatio => "vol_ratio",
            Feature::Volatility20 => "volatility20",
            Feature::SmaSpread => "sma_spread",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub ready: bool,
    pub rsi14: f64,
    pub sma_deviation: f64,
    pub momentum5: f64,
    pub volume_ratio: f64,
    pub volatility20: f64,
    pub sma_spread: f64,
}

impl IndicatorSnapshot {
    pub fn value(&self, feature: Feature) -> f64 {
        match feature {
            Feature::Rsi14 => self.rsi14,
            Feature::SmaDeviation => self.sma_deviation,
            Feature::Momentum5 => self.momentum5,
            Feature::VolumeRatio => self.volume_ratio,
            Feature::Volatility20 => self.volatility20,
            Feature::SmaSpread => self.sma_spread,
        }
    }
}

fn sma(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = sma(values);
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Wilder-style RSI over the trailing `period` changes
fn rsi(closes: &[f64], period: usize) -> f64 {
    if closes.len() <= period {
        return 50.0;
    }
    let window = &closes[closes.len() - period - 1..];
    let (mut gains, mut losses) = (0.0, 0.0);
    for pair in window.windows(2) {
        let change = pair[1] - pair[0];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    if losses == 0.0 {
        return if gains == 0.0 { 50.0 } else { 100.0 };
    }
    let rs = gains / losses;
    100.0 - 100.0 / (1.0 + rs)
}

/// Compute a snapshot for every candle
pub fn compute(candles: &[Candle]) -> Vec<IndicatorSnapshot> {
    let closes: Vec<f64> = candles.iter().map(Candle::close_f64).collect();
    let volumes: Vec<f64> = candles.iter().map(Candle::volume_f64).collect();

    (0..candles.len())
        .map(|i| {
            if i + 1 < WARMUP_BARS {
                return IndicatorSnapshot::default();
            }
            let upto = &closes[..=i];
            let close = closes[i];

            let sma20 = sma(&upto[upto.len() - 20..]);
            let sma10 = sma(&upto[upto.len() - 10..]);
            let sma30 = sma(&upto[upto.len() - 30..]);
            let prev5 = closes[i - 5];

            let returns: Vec<f64> = upto[upto.len() - 21..]
                .windows(2)
                .map(|w| if w[0] > 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
                .collect();

            let avg_volume = sma(&volumes[i + 1 - 20..=i]);

            IndicatorSnapshot {
                ready: true,
                rsi14: rsi(upto, 14),
                sma_deviation: if sma20 > 0.0 { close / sma20 - 1.0 } else { 0.0 },
                momentum5: if prev5 > 0.0 { close / prev5 - 1.0 } else { 0.0 },
                volume_ratio: if avg_volume > 0.0 { volumes[i] / avg_volume } else { 1.0 },
                volatility20: stddev(&returns),
                sma_spread: if sma30 > 0.0 { sma10 / sma30 - 1.0 } else { 0.0 },
            }
        })
        .collect()
}
