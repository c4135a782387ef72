//! Core type definitions shared by the arenas
//!
//! Candles keep decimal prices; indicator math converts to f64 once
//! per segment.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::indicators::{self, IndicatorSnapshot};

/// FNV-1a; stable across runs and platforms, unlike `DefaultHasher`
pub fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(0xcbf29ce484222325u64, |h, b| {
        (h ^ b as u64).wrapping_mul(0x100000001b3)
    })
}

/// Independent replayable stream for (`label`, `n`) under the root seed
pub fn seeded_rng(seed: u64, label: &str, n: i64) -> StdRng {
    let mixed = seed ^ fnv1a(label).rotate_left(21) ^ (n as u64).wrapping_mul(0x9e3779b97f4a7c15);
    StdRng::seed_from_u64(mixed)
}

/// Represents a single price candle (OHLCV)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Timestamp of the candle open
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn new(
        time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self { time, open, high, low, close, volume }
    }

    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(0.0)
    }

    pub fn volume_f64(&self) -> f64 {
        self.volume.to_f64().unwrap_or(0.0)
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// Get the full range (high - low)
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }
}

/// Timeframe bucket for a segment, shortest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn all() -> [Timeframe; 6] {
        [
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
        ]
    }

    pub fn index(&self) -> usize {
        match self {
            Timeframe::M1 => 0,
            Timeframe::M5 => 1,
            Timeframe::M15 => 2,
            Timeframe::H1 => 3,
            Timeframe::H4 => 4,
            Timeframe::D1 => 5,
        }
    }

    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }

    /// Linear score multiplier: 1.0x for the shortest bucket, 2.0x for the longest
    pub fn multiplier(&self) -> f64 {
        let last = (Self::all().len() - 1) as f64;
        1.0 + self.index() as f64 / last
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::all().into_iter().find(|tf| tf.as_str() == s)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trade direction implied by a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

/// An ordered candle sequence with a per-bar indicator snapshot
#[derive(Debug, Clone)]
pub struct Segment {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candles: Vec<Candle>,
    pub indicators: Vec<IndicatorSnapshot>,
}

impl Segment {
    pub fn new(symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) -> Self {
        let indicators = indicators::compute(&candles);
        Self {
            symbol: symbol.to_string(),
            timeframe,
            candles,
            indicators,
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(Candle::close_f64).collect()
    }

    /// Return from bar `from` to bar `to` (fractional, e.g. 0.01 = +1%)
    pub fn forward_return(&self, from: usize, to: usize) -> Option<f64> {
        let entry = self.candles.get(from)?.close_f64();
        let exit = self.candles.get(to)?.close_f64();
        if entry <= 0.0 {
            return None;
        }
        Some((exit - entry) / entry)
    }

    /// Split into an observation window and the bars that follow it
    pub fn split_at(&self, observe: usize) -> Option<(Segment, Segment)> {
        if observe == 0 || observe >= self.candles.len() {
            return None;
        }
        let head = Segment {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            candles: self.candles[..observe].to_vec(),
            indicators: self.indicators[..observe].to_vec(),
        };
        // The tail keeps the last observed bar so returns are measured from it
        let tail = Segment {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            candles: self.candles[observe - 1..].to_vec(),
            indicators: self.indicators[observe - 1..].to_vec(),
        };
        Some((head, tail))
    }
}
