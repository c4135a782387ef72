//! Price Sources
//!
//! Everything that scores a pattern or simulates a trade asks a
//! `PriceSource` for a segment. Two implementations:
//! - `SyntheticSource`: seeded regime-switching random walk, fully replayable
//! - `CsvSource`: historical base bars from `<data_dir>/<SYMBOL>.csv`,
//!   resampled into the requested timeframe

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::core::types::{fnv1a, Candle, Segment, Timeframe};
use crate::error::{EngineError, EngineResult};

/// Supplies ordered candle sequences with indicator snapshots
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// `bars` candles of `timeframe` starting at or after `start`
    async fn get_segment(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        timeframe: Timeframe,
        bars: usize,
    ) -> EngineResult<Segment>;

    /// First and last timestamps a segment may cover for `symbol`
    async fn available_range(&self, symbol: &str) -> EngineResult<(DateTime<Utc>, DateTime<Utc>)>;
}

/// Pick a random start so that `bars` candles of `timeframe` fit in range
pub fn random_start(
    rng: &mut StdRng,
    range: (DateTime<Utc>, DateTime<Utc>),
    timeframe: Timeframe,
    bars: usize,
    symbol: &str,
) -> EngineResult<DateTime<Utc>> {
    let (first, last) = range;
    let needed = timeframe.duration() * bars as i32;
    let latest = last - needed;
    if latest < first {
        return Err(EngineError::data_unavailable(
            symbol,
            format!("{} bars of {} do not fit in history", bars, timeframe),
        ));
    }
    let span_minutes = (latest - first).num_minutes();
    let steps = span_minutes / timeframe.minutes();
    let step = if steps > 0 { rng.gen_range(0..=steps) } else { 0 };
    Ok(first + timeframe.duration() * step as i32)
}

fn to_decimal(x: f64) -> Decimal {
    Decimal::from_f64_retain(x).unwrap_or_default().round_dp(4)
}

// =============================================================================
// SYNTHETIC
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Regime {
    drift: f64,
    vol: f64,
    volume: f64,
}

const REGIMES: [Regime; 4] = [
    Regime { drift: 0.0008, vol: 0.006, volume: 1.2 },
    Regime { drift: -0.0008, vol: 0.006, volume: 1.2 },
    Regime { drift: 0.0, vol: 0.003, volume: 0.8 },
    Regime { drift: 0.0, vol: 0.015, volume: 1.8 },
];

/// Chance per bar of switching to another regime
const REGIME_SWITCH_PROB: f64 = 0.03;

/// Deterministic random-walk market
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    seed: u64,
    history_start: DateTime<Utc>,
    history_end: DateTime<Utc>,
}

impl SyntheticSource {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            history_start: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            history_end: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or_default(),
        }
    }

    fn generate(&self, symbol: &str, start: DateTime<Utc>, timeframe: Timeframe, bars: usize) -> Vec<Candle> {
        let sym = fnv1a(symbol);
        let mixed = self.seed
            ^ sym.rotate_left(17)
            ^ (start.timestamp() as u64).rotate_left(31)
            ^ timeframe.index() as u64;
        let mut rng = StdRng::seed_from_u64(mixed);

        // Longer bars move more; sqrt-of-time, capped
        let scale = ((timeframe.minutes() as f64).sqrt() / 4.0).clamp(0.5, 4.0);
        let mut regime = REGIMES[rng.gen_range(0..REGIMES.len())];
        let mut price = 50.0 + (sym % 200) as f64;
        let mut candles = Vec::with_capacity(bars);

        for i in 0..bars {
            if rng.gen::<f64>() < REGIME_SWITCH_PROB {
                regime = REGIMES[rng.gen_range(0..REGIMES.len())];
            }
            let shock: f64 = rng.sample(StandardNormal);
            let ret = (regime.drift + regime.vol * shock) * scale;
            let open = price;
            let close = (open * (1.0 + ret)).max(0.01);
            let wick: f64 = rng.sample::<f64, _>(StandardNormal).abs() * regime.vol * scale * 0.5;
            let high = open.max(close) * (1.0 + wick);
            let low = open.min(close) * (1.0 - wick).max(0.5);
            let spike = if rng.gen::<f64>() < 0.05 { 3.0 } else { 1.0 };
            let volume = 1000.0 * regime.volume * (1.0 + shock.abs()) * spike;

            candles.push(Candle::new(
                start + timeframe.duration() * i as i32,
                to_decimal(open),
                to_decimal(high),
                to_decimal(low),
                to_decimal(close),
                to_decimal(volume.round()),
            ));
            price = close;
        }
        candles
    }
}

#[async_trait]
impl PriceSource for SyntheticSource {
    async fn get_segment(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        timeframe: Timeframe,
        bars: usize,
    ) -> EngineResult<Segment> {
        if bars == 0 {
            return Err(EngineError::data_unavailable(symbol, "zero bars requested"));
        }
        if start < self.history_start || start > self.history_end {
            return Err(EngineError::data_unavailable(symbol, format!("{} outside synthetic history", start)));
        }
        let candles = self.generate(symbol, start, timeframe, bars);
        Ok(Segment::new(symbol, timeframe, candles))
    }

    async fn available_range(&self, _symbol: &str) -> EngineResult<(DateTime<Utc>, DateTime<Utc>)> {
        Ok((self.history_start, self.history_end))
    }
}

// =============================================================================
// CSV
// =============================================================================

/// Historical base bars loaded from disk on first use
pub struct CsvSource {
    data_dir: PathBuf,
    cache: RwLock<HashMap<String, Vec<Candle>>>,
}

impl CsvSource {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Parse `timestamp,open,high,low,close,volume` with a header row.
    /// Timestamps are unix seconds or RFC3339; malformed rows are skipped.
    pub fn parse_csv(text: &str) -> Vec<Candle> {
        let mut candles = Vec::new();
        let mut skipped = 0usize;

        for line in text.lines().skip(1) {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 6 {
                skipped += 1;
                continue;
            }
            let time = match parts[0].parse::<i64>() {
                Ok(secs) => Utc.timestamp_opt(secs, 0).single(),
                Err(_) => DateTime::parse_from_rfc3339(parts[0]).ok().map(|t| t.with_timezone(&Utc)),
            };
            let nums: Vec<Option<Decimal>> = parts[1..6].iter().map(|p| p.parse::<Decimal>().ok()).collect();
            match (time, nums[0], nums[1], nums[2], nums[3], nums[4]) {
                (Some(t), Some(o), Some(h), Some(l), Some(c), Some(v)) => {
                    candles.push(Candle::new(t, o, h, l, c, v));
                }
                _ => skipped += 1,
            }
        }

        if skipped > 0 {
            debug!(skipped, "skipped malformed csv rows");
        }
        candles.sort_by_key(|c| c.time);
        candles
    }

    /// Aggregate base bars into `timeframe` buckets
    pub fn resample(base: &[Candle], timeframe: Timeframe) -> Vec<Candle> {
        let width = timeframe.minutes() * 60;
        let mut out: Vec<Candle> = Vec::new();
        let mut current_bucket: Option<i64> = None;

        for c in base {
            let bucket = c.time.timestamp().div_euclid(width);
            match (current_bucket, out.last_mut()) {
                (Some(b), Some(last)) if b == bucket => {
                    last.high = last.high.max(c.high);
                    last.low = last.low.min(c.low);
                    last.close = c.close;
                    last.volume += c.volume;
                }
                _ => {
                    let time = Utc.timestamp_opt(bucket * width, 0).single().unwrap_or(c.time);
                    out.push(Candle::new(time, c.open, c.high, c.low, c.close, c.volume));
                    current_bucket = Some(bucket);
                }
            }
        }
        out
    }

    async fn base_bars(&self, symbol: &str) -> EngineResult<Vec<Candle>> {
        if let Some(bars) = self.cache.read().await.get(symbol) {
            return Ok(bars.clone());
        }

        let path = self.data_dir.join(format!("{}.csv", symbol));
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| EngineError::data_unavailable(symbol, format!("{}: {}", path.display(), e)))?;
        let bars = Self::parse_csv(&text);
        if bars.is_empty() {
            return Err(EngineError::data_unavailable(symbol, "csv has no usable rows"));
        }
        info!(symbol, bars = bars.len(), "loaded price history");

        self.cache.write().await.insert(symbol.to_string(), bars.clone());
        Ok(bars)
    }
}

#[async_trait]
impl PriceSource for CsvSource {
    async fn get_segment(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        timeframe: Timeframe,
        bars: usize,
    ) -> EngineResult<Segment> {
        let base = self.base_bars(symbol).await?;
        let from = base.partition_point(|c| c.time < start);
        let resampled = Self::resample(&base[from..], timeframe);
        if resampled.len() < bars {
            return Err(EngineError::data_unavailable(
                symbol,
                format!("only {} {} bars after {}", resampled.len(), timeframe, start),
            ));
        }
        let candles = resampled.into_iter().take(bars).collect();
        Ok(Segment::new(symbol, timeframe, candles))
    }

    async fn available_range(&self, symbol: &str) -> EngineResult<(DateTime<Utc>, DateTime<Utc>)> {
        let base = self.base_bars(symbol).await?;
        match (base.first(), base.last()) {
            (Some(first), Some(last)) => Ok((first.time, last.time)),
            _ => Err(EngineError::data_unavailable(symbol, "empty history")),
        }
    }
}
