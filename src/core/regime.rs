//! Market Condition Buckets
//!
//! The decision engine is handed the current market condition as three
//! coarse tiers:
//! - Volatility: Low / Normal / High (20-bar return stddev)
//! - Trend: Up / Flat / Down (SMA10 vs SMA30 spread)
//! - Volume: Low / Normal / High (volume vs 20-bar average)
//!
//! The bucket key is what agent knowledge is indexed by.

use serde::{Deserialize, Serialize};

use super::indicators::IndicatorSnapshot;
use super::types::Segment;

const LOW_VOLATILITY: f64 = 0.004;
const HIGH_VOLATILITY: f64 = 0.012;
const TREND_SPREAD: f64 = 0.002;
const LOW_VOLUME: f64 = 0.8;
const HIGH_VOLUME: f64 = 1.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Low,
    Normal,
    High,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Low => "low",
            Tier::Normal => "normal",
            Tier::High => "high",
        }
    }

    fn classify(value: f64, low: f64, high: f64) -> Self {
        if value < low {
            Tier::Low
        } else if value > high {
            Tier::High
        } else {
            Tier::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Flat,
    Down,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Up => "up",
            Trend::Flat => "flat",
            Trend::Down => "down",
        }
    }
}

/// Current market condition supplied to the decision engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketCondition {
    pub volatility: Tier,
    pub trend: Trend,
    pub volume: Tier,
}

impl Default for MarketCondition {
    fn default() -> Self {
        Self {
            volatility: Tier::Normal,
            trend: Trend::Flat,
            volume: Tier::Normal,
        }
    }
}

impl MarketCondition {
    pub fn new(volatility: Tier, trend: Trend, volume: Tier) -> Self {
        Self { volatility, trend, volume }
    }

    pub fn from_snapshot(snap: &IndicatorSnapshot) -> Self {
        if !snap.ready {
            return Self::default();
        }
        let trend = if snap.sma_spread > TREND_SPREAD {
            Trend::Up
        } else if snap.sma_spread < -TREND_SPREAD {
            Trend::Down
        } else {
            Trend::Flat
        };
        Self {
            volatility: Tier::classify(snap.volatility20, LOW_VOLATILITY, HIGH_VOLATILITY),
            trend,
            volume: Tier::classify(snap.volume_ratio, LOW_VOLUME, HIGH_VOLUME),
        }
    }

    /// Classify from the last bar of a segment
    pub fn classify(segment: &Segment) -> Self {
        segment
            .indicators
            .last()
            .map(Self::from_snapshot)
            .unwrap_or_default()
    }

    /// Stable key used to index knowledge, e.g. `vol:high|trend:up|volume:normal`
    pub fn bucket(&self) -> String {
        format!(
            "vol:{}|trend:{}|volume:{}",
            self.volatility.as_str(),
            self.trend.as_str(),
            self.volume.as_str()
        )
    }
}

impl std::fmt::Display for MarketCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.bucket())
    }
}
