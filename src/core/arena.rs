//! Head-to-Head Pattern Arena
//!
//! Two patterns are drawn without replacement, weighted by
//! `(100 / (runs + 1)) * (votes + 10)`, and scored on the same random
//! segment. The higher timeframe-scaled score takes a vote from the other.
//! A draw that cannot be evaluated is abandoned untouched and redrawn.

use chrono::{DateTime, Utc};
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::pattern::{LifecycleRules, Pattern, PatternStatus};
use super::types::{seeded_rng, Segment, Timeframe};
use crate::config::{ArenaConfig, MarketConfig};
use crate::data::{random_start, EvolutionStore, PriceSource, Records};
use crate::error::{EngineError, EngineResult};

/// Floor applied when sampling so deeply negative patterns can still be drawn
const MIN_SAMPLING_WEIGHT: f64 = 0.01;

/// Selection weight before clamping; ~1000 for an untested pattern
pub fn selection_weight(runs: i64, votes: i64) -> f64 {
    (100.0 / (runs.max(0) as f64 + 1.0)) * (votes as f64 + 10.0)
}

/// Draw two distinct indices by selection weight
pub fn draw_pair(rng: &mut StdRng, patterns: &[Pattern]) -> Option<(usize, usize)> {
    if patterns.len() < 2 {
        return None;
    }
    let weights: Vec<f64> = patterns
        .iter()
        .map(|p| selection_weight(p.runs, p.votes).max(MIN_SAMPLING_WEIGHT))
        .collect();

    let first = WeightedIndex::new(&weights).ok()?.sample(rng);
    let mut rest = weights.clone();
    rest[first] = 0.0;
    let second = WeightedIndex::new(&rest).ok()?.sample(rng);
    Some((first, second))
}

/// Timeframe-scaled score of one side
pub fn scaled_score(raw_score: f64, timeframe: Timeframe) -> f64 {
    raw_score * timeframe.multiplier()
}

/// Audit row of one completed matchup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchupRecord {
    pub round: i64,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub segment_start: DateTime<Utc>,
    pub pattern_a: String,
    pub pattern_b: String,
    pub score_a: f64,
    pub score_b: f64,
    /// None on a tie
    pub winner: Option<String>,
}

/// What one arena tick did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArenaTickReport {
    pub completed: usize,
    pub ties: usize,
    pub aborted: usize,
    pub promoted: usize,
    pub retired: usize,
}

/// Apply a scored matchup in the caller's transaction
pub fn apply_matchup(r: &Records<'_>, rules: &LifecycleRules, m: &mut MatchupRecord) -> EngineResult<Vec<(String, PatternStatus)>> {
    m.round = r.increment_counter("pattern_rounds")?;
    match m.winner.as_deref() {
        Some(w) if w == m.pattern_a => r.record_matchup_win(&m.pattern_a, &m.pattern_b)?,
        Some(w) if w == m.pattern_b => r.record_matchup_win(&m.pattern_b, &m.pattern_a)?,
        Some(other) => {
            return Err(EngineError::invariant(format!("matchup:{}", m.round), format!("winner {} not a contestant", other)))
        }
        None => r.record_matchup_tie(&m.pattern_a, &m.pattern_b)?,
    }
    r.append_matchup(m)?;

    let mut transitions = Vec::new();
    for id in [&m.pattern_a, &m.pattern_b] {
        if let Some(p) = r.get_pattern(id)? {
            let next = rules.next_status(p.status, p.runs, p.votes);
            if next != p.status {
                r.set_pattern_status(id, next)?;
                transitions.push((id.clone(), next));
            }
        }
    }
    Ok(transitions)
}

pub struct PatternArena {
    store: Arc<EvolutionStore>,
    source: Arc<dyn PriceSource>,
    arena: ArenaConfig,
    market: MarketConfig,
    rules: LifecycleRules,
    seed: u64,
}

impl PatternArena {
    pub fn new(
        store: Arc<EvolutionStore>,
        source: Arc<dyn PriceSource>,
        arena: ArenaConfig,
        market: MarketConfig,
        rules: LifecycleRules,
        seed: u64,
    ) -> Self {
        Self { store, source, arena, market, rules, seed }
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

    /// Score one drawn pair; None if the draw must be abandoned
    async fn contest(&self, rng: &mut StdRng, a: &Pattern, b: &Pattern) -> Option<MatchupRecord> {
        let segment = match self.draw_segment(rng).await {
            Ok(s) => s,
            Err(e) => {
                warn!(pattern_a = %a.id, pattern_b = %b.id, cause = %e, "matchup aborted");
                return None;
            }
        };
        let (eval_a, eval_b) = match (a.evaluate(&segment), b.evaluate(&segment)) {
            (Ok(ea), Ok(eb)) => (ea, eb),
            (Err(e), _) | (_, Err(e)) => {
                warn!(pattern_a = %a.id, pattern_b = %b.id, cause = %e, "matchup aborted");
                return None;
            }
        };

        let score_a = scaled_score(eval_a.raw_score, segment.timeframe);
        let score_b = scaled_score(eval_b.raw_score, segment.timeframe);
        let winner = if score_a > score_b {
            Some(a.id.clone())
        } else if score_b > score_a {
            Some(b.id.clone())
        } else {
            None
        };

        Some(MatchupRecord {
            round: 0,
            symbol: segment.symbol.clone(),
            timeframe: segment.timeframe,
            segment_start: segment.candles.first().map(|c| c.time).unwrap_or_else(Utc::now),
            pattern_a: a.id.clone(),
            pattern_b: b.id.clone(),
            score_a,
            score_b,
            winner,
        })
    }

    /// Run `matchups_per_tick` matchups
    pub async fn run_tick(&self) -> EngineResult<ArenaTickReport> {
        let start_round = self.store.read(|r| r.counter("pattern_rounds"))?;
        let mut rng = seeded_rng(self.seed, "pattern-arena", start_round);
        let mut report = ArenaTickReport::default();

        for _ in 0..self.arena.matchups_per_tick {
            let mut done = false;
            for _ in 0..self.arena.max_redraws.max(1) {
                let patterns = self.store.read(|r| r.active_patterns())?;
                let Some((ia, ib)) = draw_pair(&mut rng, &patterns) else {
                    debug!(active = patterns.len(), "not enough active patterns for a matchup");
                    return Ok(report);
                };

                let Some(mut matchup) = self.contest(&mut rng, &patterns[ia], &patterns[ib]).await else {
                    report.aborted += 1;
                    continue;
                };

                let transitions = match self.store.write_async(|r| apply_matchup(r, &self.rules, &mut matchup)).await {
                    Ok(t) => t,
                    Err(e @ EngineError::InvariantViolation { .. }) => {
                        warn!(pattern_a = %matchup.pattern_a, pattern_b = %matchup.pattern_b, cause = %e, "matchup skipped");
                        report.aborted += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                report.completed += 1;
                if matchup.winner.is_none() {
                    report.ties += 1;
                }
                for (id, status) in transitions {
                    match status {
                        PatternStatus::Retired => {
                            report.retired += 1;
                            info!(pattern = %id, "pattern retired");
                        }
                        PatternStatus::Winning => {
                            report.promoted += 1;
                            info!(pattern = %id, "pattern promoted");
                        }
                        PatternStatus::Testing => debug!(pattern = %id, "pattern back to testing"),
                    }
                }
                done = true;
                break;
            }
            if !done {
                warn!(redraws = self.arena.max_redraws, "matchup slot skipped after redraws");
            }
        }

        info!(
            completed = report.completed,
            ties = report.ties,
            aborted = report.aborted,
            "pattern arena tick"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::discovery;
    use crate::data::SyntheticSource;
    use async_trait::async_trait;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves stubby segments (too short to evaluate) for the first
    /// `short_calls` requests, full ones afterwards
    struct StubbySource {
        inner: SyntheticSource,
        short_calls: AtomicUsize,
    }

    impl StubbySource {
        fn new(short_calls: usize) -> Self {
            Self { inner: SyntheticSource::new(1), short_calls: AtomicUsize::new(short_calls) }
        }
    }

    #[async_trait]
    impl PriceSource for StubbySource {
        async fn get_segment(
            &self,
            symbol: &str,
            start: DateTime<Utc>,
            timeframe: Timeframe,
            bars: usize,
        ) -> EngineResult<Segment> {
            let short = self
                .short_calls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let bars = if short { 5 } else { bars };
            self.inner.get_segment(symbol, start, timeframe, bars).await
        }

        async fn available_range(&self, symbol: &str) -> EngineResult<(DateTime<Utc>, DateTime<Utc>)> {
            self.inner.available_range(symbol).await
        }
    }

    fn catalogue_store() -> Arc<EvolutionStore> {
        let store = Arc::new(EvolutionStore::in_memory().unwrap());
        store
            .write(|r| {
                for p in discovery::literature_catalogue() {
                    r.insert_pattern_if_absent(&p)?;
                }
                Ok(())
            })
            .unwrap();
        store
    }

    fn stubby_arena(store: Arc<EvolutionStore>, short_calls: usize, matchups_per_tick: usize, max_redraws: usize) -> PatternArena {
        PatternArena::new(
            store,
            Arc::new(StubbySource::new(short_calls)),
            ArenaConfig { matchups_per_tick, max_redraws },
            MarketConfig::default(),
            LifecycleRules { min_runs_before_retire: 1000, retire_vote_floor: -100, promote_vote_threshold: 100 },
            5,
        )
    }

    #[test]
    fn test_weight_reference_values() {
        assert!((selection_weight(0, 0) - 1000.0).abs() < 1e-9);
        assert!((selection_weight(100, 40) - 5000.0 / 101.0).abs() < 1e-9);
        assert!(selection_weight(0, 0) > selection_weight(100, 40));
    }

    #[test]
    fn test_draw_pair_distinct() {
        let patterns: Vec<Pattern> = discovery::literature_catalogue();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let (a, b) = draw_pair(&mut rng, &patterns).unwrap();
            assert_ne!(a, b);
        }
        assert!(draw_pair(&mut rng, &patterns[..1]).is_none());
    }

    #[test]
    fn test_draw_favours_untested() {
        let mut patterns: Vec<Pattern> = discovery::literature_catalogue().into_iter().take(3).collect();
        patterns[0].runs = 500;
        patterns[0].votes = -5;
        let mut rng = StdRng::seed_from_u64(5);
        let mut hits = 0;
        for _ in 0..1000 {
            let (a, b) = draw_pair(&mut rng, &patterns).unwrap();
            if a == 0 || b == 0 {
                hits += 1;
            }
        }
        assert!(hits < 50, "stale pattern drawn {} times", hits);
    }

    #[test]
    fn test_apply_matchup_win_and_tie() {
        let store = EvolutionStore::in_memory().unwrap();
        let pats = discovery::literature_catalogue();
        let (a, b) = (pats[0].clone(), pats[1].clone());
        store
            .write(|r| {
                r.insert_pattern_if_absent(&a)?;
                r.insert_pattern_if_absent(&b)
            })
            .unwrap();

        let rules = LifecycleRules { min_runs_before_retire: 20, retire_vote_floor: -5, promote_vote_threshold: 5 };
        let mut m = MatchupRecord {
            round: 0,
            symbol: "X".into(),
            timeframe: Timeframe::H1,
            segment_start: Utc::now(),
            pattern_a: a.id.clone(),
            pattern_b: b.id.clone(),
            score_a: 1.0,
            score_b: -1.0,
            winner: Some(a.id.clone()),
        };
        store.write(|r| apply_matchup(r, &rules, &mut m)).unwrap();
        assert_eq!(m.round, 1);

        let mut tie = m.clone();
        tie.winner = None;
        store.write(|r| apply_matchup(r, &rules, &mut tie)).unwrap();

        let pa = store.read(|r| r.get_pattern(&a.id)).unwrap().unwrap();
        let pb = store.read(|r| r.get_pattern(&b.id)).unwrap().unwrap();
        assert_eq!((pa.runs, pa.wins, pa.losses, pa.votes), (2, 1, 0, 1));
        assert_eq!((pb.runs, pb.wins, pb.losses, pb.votes), (2, 0, 1, -1));
        assert_eq!(store.read(|r| r.matchups_for_pattern(&a.id)).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tick_preserves_vote_accounting() {
        let store = Arc::new(EvolutionStore::in_memory().unwrap());
        store
            .write(|r| {
                for p in discovery::literature_catalogue() {
                    r.insert_pattern_if_absent(&p)?;
                }
                Ok(())
            })
            .unwrap();

        let arena = PatternArena::new(
            store.clone(),
            Arc::new(SyntheticSource::new(1)),
            ArenaConfig { matchups_per_tick: 12, max_redraws: 3 },
            MarketConfig::default(),
            LifecycleRules { min_runs_before_retire: 1000, retire_vote_floor: -100, promote_vote_threshold: 100 },
            99,
        );
        let report = arena.run_tick().await.unwrap();
        assert_eq!(report.completed, 12);

        let patterns = store.read(|r| r.all_patterns()).unwrap();
        let total_runs: i64 = patterns.iter().map(|p| p.runs).sum();
        assert_eq!(total_runs, 24);
        for p in &patterns {
            assert_eq!(p.votes, p.wins - p.losses);
        }
        assert_eq!(store.read(|r| r.counter("pattern_rounds")).unwrap(), 12);
    }

    #[tokio::test]
    async fn test_unevaluable_draws_change_nothing() {
        let store = catalogue_store();
        let arena = stubby_arena(store.clone(), usize::MAX, 3, 2);
        let report = arena.run_tick().await.unwrap();
        assert_eq!(report.completed, 0);
        assert_eq!(report.aborted, 6);

        for p in store.read(|r| r.all_patterns()).unwrap() {
            assert_eq!((p.runs, p.votes, p.wins, p.losses), (0, 0, 0, 0));
            assert!(store.read(|r| r.matchups_for_pattern(&p.id)).unwrap().is_empty());
        }
        assert_eq!(store.read(|r| r.counter("pattern_rounds")).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_aborted_draw_is_redrawn() {
        let store = catalogue_store();
        let arena = stubby_arena(store.clone(), 2, 1, 3);
        let report = arena.run_tick().await.unwrap();
        assert_eq!(report.aborted, 2);
        assert_eq!(report.completed, 1);

        let patterns = store.read(|r| r.all_patterns()).unwrap();
        assert_eq!(patterns.iter().map(|p| p.runs).sum::<i64>(), 2);
        assert_eq!(store.read(|r| r.counter("pattern_rounds")).unwrap(), 1);
    }
}
