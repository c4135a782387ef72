//! Trade Sampler (ingestion tick)
//!
//! Keeps the pattern library stocked and feeds it labeled outcomes:
//! 1. Top up active patterns to the target size from the discovery producers
//! 2. Fetch one random segment
//! 3. Label every triggered trade of every active pattern as an episode
//! 4. Fold the episodes into each pattern's sample size and win rate
//!
//! Outcomes never touch votes; those belong to the head-to-head arena.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::discovery;
use super::pattern::Pattern;
use super::types::{seeded_rng, Segment, Timeframe};
use crate::config::{LibraryConfig, MarketConfig};
use crate::data::{random_start, EvolutionStore, PriceSource};
use crate::error::{EngineError, EngineResult};

/// One simulated trade attributed to a pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledEpisode {
    pub pattern_id: String,
    pub entry_index: usize,
    pub signed_return: f64,
    pub profitable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub discovered: usize,
    pub episodes: usize,
    pub patterns_touched: usize,
    pub symbol: Option<String>,
}

/// Label every episode the patterns trigger on `segment`
pub fn label_episodes(patterns: &[Pattern], segment: &Segment) -> Vec<LabeledEpisode> {
    let mut out = Vec::new();
    for p in patterns {
        match p.evaluate(segment) {
            Ok(eval) => out.extend(eval.episodes.iter().map(|e| LabeledEpisode {
                pattern_id: p.id.clone(),
                entry_index: e.entry_index,
                signed_return: e.signed_return,
                profitable: e.profitable(),
            })),
            Err(e) => debug!(pattern = %p.id, cause = %e, "pattern skipped by sampler"),
        }
    }
    out
}

pub struct TradeSampler {
    store: Arc<EvolutionStore>,
    source: Arc<dyn PriceSource>,
    market: MarketConfig,
    library: LibraryConfig,
    seed: u64,
}

impl TradeSampler {
    pub fn new(
        store: Arc<EvolutionStore>,
        source: Arc<dyn PriceSource>,
        market: MarketConfig,
        library: LibraryConfig,
        seed: u64,
    ) -> Self {
        Self { store, source, market, library, seed }
    }

    /// Insert new patterns until the active library reaches the target
    pub async fn top_up_library(&self, rng: &mut StdRng) -> EngineResult<usize> {
        let target = self.library.target_size;
        self.store.write_async(|r| {
            let active = r.active_patterns()?.len();
            if active >= target {
                return Ok(0);
            }
            let needed = target - active;
            let mut inserted = 0;
            for p in discovery::candidates(rng, needed) {
                if inserted >= needed {
                    break;
                }
                if r.insert_pattern_if_absent(&p)? {
                    debug!(pattern = %p.id, name = %p.name, origin = p.origin.as_str(), "pattern discovered");
                    inserted += 1;
                }
            }
            Ok(inserted)
        }).await
    }

    async fn draw_segment(&self, rng: &mut StdRng) -> EngineResult<Segment> {
        let symbol = self
            .market
            .symbols
            .choose(rng)
            .cloned()
            .ok_or_else(|| EngineError::data_unavailable("*", "no symbols configured"))?;
        let timeframe = *Timeframe::all().choose(rng).unwrap_or(&Timeframe::H1);
        let range = self.source.available_range(&symbol).await?;
        let start = random_start(rng, range, timeframe, self.market.segment_bars, &symbol)?;
        self.source.get_segment(&symbol, start, timeframe, self.market.segment_bars).await
    }

    pub async fn run_tick(&self) -> EngineResult<IngestReport> {
        let round = self.store.write_async(|r| r.increment_counter("ingest_rounds")).await?;
        let mut rng = seeded_rng(self.seed, "ingest", round);
        let mut report = IngestReport {
            discovered: self.top_up_library(&mut rng).await?,
            ..Default::default()
        };

        let segment = match self.draw_segment(&mut rng).await {
            Ok(s) => s,
            Err(e) if e.is_data_problem() => {
                warn!(round, cause = %e, "ingest segment unavailable");
                return Ok(report);
            }
            Err(e) => return Err(e),
        };
        report.symbol = Some(segment.symbol.clone());

        let patterns = self.store.read(|r| r.active_patterns())?;
        let episodes = label_episodes(&patterns, &segment);
        self.store
            .write_async(|r| {
                for e in &episodes {
                    r.record_pattern_outcome(&e.pattern_id, e.profitable)?;
                }
                Ok(())
            })
            .await?;

        report.episodes = episodes.len();
        let mut touched: Vec<&str> = episodes.iter().map(|e| e.pattern_id.as_str()).collect();
        touched.sort_unstable();
        touched.dedup();
        report.patterns_touched = touched.len();

        info!(
            round,
            symbol = %segment.symbol,
            timeframe = %segment.timeframe,
            discovered = report.discovered,
            episodes = report.episodes,
            "ingest tick"
        );
        Ok(report)
    }
}
