//! Decision Engine
//!
//! One decision for one agent:
//! 1. Observe a random segment and classify the market condition
//! 2. Pick the top-K patterns by win rate x own knowledge x personality bias
//! 3. Combine them into a signal (oracle, or the weighted-average fallback)
//! 4. Hold the position over the following bars and measure ROI
//! 5. Reflect: move knowledge counters, maybe learn a new rule
//! 6. Append the decision record
//!
//! Steps 1-3 only read the store and draw from a seeded stream keyed by
//! agent and trade count, so they replay exactly from the same snapshot.
//! Steps 4-6 commit in one transaction.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::agent::Agent;
use super::indicators::IndicatorSnapshot;
use super::knowledge::{KnowledgeDelta, KnowledgeItem, KnowledgeKind};
use super::oracle::{weighted_average, OracleVerdict, PatternVote, ReasoningOracle};
use super::pattern::Pattern;
use super::regime::MarketCondition;
use super::types::{seeded_rng, Segment, Timeframe};
use crate::config::{AgentsConfig, MarketConfig};
use crate::data::{random_start, EvolutionStore, PriceSource, Records};
use crate::error::{EngineError, EngineResult};

/// Win rate floor so a cold pattern can still be picked
const MIN_WIN_RATE: f64 = 0.01;
/// Confidence above which a losing trade teaches an avoid rule
const AVOID_CONFIDENCE: f64 = 0.5;
const NEW_ITEM_CONFIDENCE: f64 = 0.5;

/// Immutable log entry for one decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: i64,
    pub agent_id: String,
    pub round: i64,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub condition_bucket: String,
    pub pattern_ids: Vec<String>,
    pub signal: f64,
    pub confidence: f64,
    pub explanation: String,
    pub used_oracle: bool,
    pub roi: f64,
    pub profitable: bool,
    pub reflection: String,
    pub knowledge_deltas: Vec<KnowledgeDelta>,
}

/// Everything decided before the trade is taken
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionPlan {
    pub condition: MarketCondition,
    pub votes: Vec<PatternVote>,
    pub verdict: OracleVerdict,
    pub used_oracle: bool,
}

/// Selection score of one pattern for one agent under a condition
pub fn score_pattern(agent: &Agent, pattern: &Pattern, knowledge: &[KnowledgeItem], condition: &MarketCondition) -> f64 {
    let bucket = condition.bucket();
    let knowledge_factor: f64 = knowledge
        .iter()
        .filter(|k| k.condition_bucket == bucket && k.pattern_id.as_deref() == Some(pattern.id.as_str()))
        .map(KnowledgeItem::selection_factor)
        .product();
    let bias = agent
        .personality
        .bias(condition, pattern.condition.direction, pattern.origin);
    let genome = (1.0 + agent.genome.weight(&pattern.id)).max(0.05);

    pattern.win_rate.max(MIN_WIN_RATE) * knowledge_factor.clamp(0.1, 3.0) * bias * genome
}

/// Top-K selection with seeded exploration. Ties break by pattern id.
pub fn select_patterns(
    rng: &mut StdRng,
    agent: &Agent,
    patterns: &[Pattern],
    knowledge: &[KnowledgeItem],
    condition: &MarketCondition,
    snapshot: &IndicatorSnapshot,
    config: &AgentsConfig,
) -> Vec<PatternVote> {
    let mut scored: Vec<(f64, &Pattern)> = patterns
        .iter()
        .filter(|p| p.is_active())
        .map(|p| (score_pattern(agent, p, knowledge, condition), p))
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.id.cmp(&b.1.id))
    });

    let k = agent.genome.top_k(config.top_k_min, config.top_k_max).min(scored.len());
    let mut chosen: Vec<usize> = Vec::with_capacity(k);
    let mut next_best = 0;
    for _ in 0..k {
        let explored = if rng.gen::<f64>() < config.explore_rate {
            let pool: Vec<usize> = (k..scored.len()).filter(|i| !chosen.contains(i)).collect();
            pool.choose(rng).copied()
        } else {
            None
        };
        let pick = match explored {
            Some(i) => i,
            None => {
                while chosen.contains(&next_best) {
                    next_best += 1;
                }
                next_best
            }
        };
        chosen.push(pick);
    }

    chosen
        .into_iter()
        .map(|i| {
            let (score, p) = scored[i];
            PatternVote {
                pattern_id: p.id.clone(),
                direction: p.condition.direction,
                weight: score,
                activation: p.condition.activation(snapshot),
                win_rate: p.win_rate,
            }
        })
        .collect()
}

/// Fold one trade into the agent's knowledge; returns deltas and the lesson
pub fn reflect(
    r: &Records<'_>,
    agent_id: &str,
    bucket: &str,
    votes: &[PatternVote],
    market_return: f64,
    profitable: bool,
    confidence: f64,
    learning_rate: f64,
) -> EngineResult<(Vec<KnowledgeDelta>, String)> {
    let items = r.knowledge_for_agent(agent_id)?;
    let mut deltas = Vec::new();
    let mut helped_ids = Vec::new();
    let mut hurt_ids = Vec::new();

    for vote in votes {
        let helped = vote.direction.sign() * market_return > 0.0;
        if helped {
            helped_ids.push(vote.pattern_id.clone());
        } else {
            hurt_ids.push(vote.pattern_id.clone());
        }

        let mut has_preference = false;
        for item in items
            .iter()
            .filter(|k| k.condition_bucket == bucket && k.pattern_id.as_deref() == Some(vote.pattern_id.as_str()))
        {
            let mut item = item.clone();
            let outcome = match item.kind {
                KnowledgeKind::CombinationRule => profitable,
                _ => helped,
            };
            if item.kind == KnowledgeKind::PatternPreference {
                has_preference = true;
            }
            deltas.push(item.apply_outcome(outcome, learning_rate));
            r.update_knowledge(&item)?;
        }

        if !has_preference {
            let strength = if helped { learning_rate } else { -learning_rate };
            let item = KnowledgeItem::new(
                agent_id,
                KnowledgeKind::PatternPreference,
                Some(&vote.pattern_id),
                bucket,
                strength,
                NEW_ITEM_CONFIDENCE,
            );
            if r.insert_knowledge_if_absent(&item)? {
                deltas.push(item.created_delta());
            }
        }

        r.record_pattern_outcome(&vote.pattern_id, helped)?;
    }

    // A confident loss: remember to distrust the heaviest wrong pattern here
    if !profitable && confidence >= AVOID_CONFIDENCE {
        let culprit = votes
            .iter()
            .filter(|v| hurt_ids.contains(&v.pattern_id))
            .max_by(|a, b| a.weight.partial_cmp(&b.weight).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(v) = culprit {
            let mut item = KnowledgeItem::new(
                agent_id,
                KnowledgeKind::AvoidCondition,
                Some(&v.pattern_id),
                bucket,
                -0.5,
                confidence,
            );
            item.detail = format!("lost {:.4} at confidence {:.2}", market_return.abs(), confidence);
            if r.insert_knowledge_if_absent(&item)? {
                deltas.push(item.created_delta());
            }
        }
    }

    // A profitable combination: remember the pairing on the lead pattern
    if profitable && votes.len() >= 2 {
        let lead = &votes[0];
        let partners: Vec<&str> = votes[1..].iter().map(|v| v.pattern_id.as_str()).collect();
        let mut item = KnowledgeItem::new(
            agent_id,
            KnowledgeKind::CombinationRule,
            Some(&lead.pattern_id),
            bucket,
            0.5,
            NEW_ITEM_CONFIDENCE,
        );
        item.detail = partners.join(",");
        if r.insert_knowledge_if_absent(&item)? {
            deltas.push(item.created_delta());
        }
    }

    let lesson = format!(
        "{} under {}: helped [{}] hurt [{}]",
        if profitable { "won" } else { "lost" },
        bucket,
        helped_ids.join(","),
        hurt_ids.join(",")
    );
    Ok((deltas, lesson))
}

pub struct DecisionEngine {
    store: Arc<EvolutionStore>,
    source: Arc<dyn PriceSource>,
    oracle: Arc<dyn ReasoningOracle>,
    agents: AgentsConfig,
    market: MarketConfig,
    seed: u64,
}

impl DecisionEngine {
    pub fn new(
        store: Arc<EvolutionStore>,
        source: Arc<dyn PriceSource>,
        oracle: Arc<dyn ReasoningOracle>,
        agents: AgentsConfig,
        market: MarketConfig,
        seed: u64,
    ) -> Self {
        Self { store, source, oracle, agents, market, seed }
    }

    /// Seeded stream for the agent's next decision
    pub fn decision_rng(&self, agent: &Agent) -> StdRng {
        seeded_rng(self.seed, &format!("decide:{}", agent.id), agent.total_trades)
    }

    async fn draw_segment(&self, rng: &mut StdRng) -> EngineResult<Segment> {
        let symbol = self
            .market
            .symbols
            .choose(rng)
            .cloned()
            .ok_or_else(|| EngineError::data_unavailable("*", "no symbols configured"))?;
        let timeframe = *Timeframe::all().choose(rng).unwrap_or(&Timeframe::H1);
        let bars = self.agents.lookback_bars + self.agents.horizon_bars;
        let range = self.source.available_range(&symbol).await?;
        let start = random_start(rng, range, timeframe, bars, &symbol)?;
        self.source.get_segment(&symbol, start, timeframe, bars).await
    }

    /// Steps 1-3: reads only
    pub async fn plan(
        &self,
        agent: &Agent,
        rng: &mut StdRng,
        observed: &Segment,
    ) -> EngineResult<DecisionPlan> {
        let condition = MarketCondition::classify(observed);
        let snapshot = observed.indicators.last().copied().unwrap_or_default();
        let (patterns, knowledge) = self
            .store
            .read(|r| Ok((r.active_patterns()?, r.knowledge_for_agent(&agent.id)?)))?;

        let votes = select_patterns(rng, agent, &patterns, &knowledge, &condition, &snapshot, &self.agents);
        if votes.is_empty() {
            return Err(EngineError::invariant(format!("agent:{}", agent.id), "no active patterns to select"));
        }

        let (verdict, used_oracle) = match self.oracle.combine(&votes, &condition).await {
            Ok(v) => (
                OracleVerdict {
                    signal: v.signal.clamp(-1.0, 1.0),
                    confidence: v.confidence.clamp(0.0, 1.0),
                    explanation: v.explanation,
                },
                true,
            ),
            Err(e) => {
                debug!(agent = %agent.id, cause = %e, "oracle fallback to weighted average");
                (weighted_average(&votes, &condition), false)
            }
        };

        Ok(DecisionPlan { condition, votes, verdict, used_oracle })
    }

    /// One full decision for `agent_id`; returns the stored record
    pub async fn decide(&self, agent_id: &str) -> EngineResult<DecisionRecord> {
        let (agent, round) = self.store.read(|r| Ok((r.get_agent(agent_id)?, r.counter("agent_rounds")?)))?;
        let agent = agent
            .filter(Agent::is_active)
            .ok_or_else(|| EngineError::invariant(format!("agent:{}", agent_id), "not an active agent"))?;

        let mut rng = self.decision_rng(&agent);
        let segment = self.draw_segment(&mut rng).await?;
        let (observed, forward) = segment
            .split_at(self.agents.lookback_bars)
            .ok_or_else(|| EngineError::data_unavailable(&segment.symbol, "segment too short to split"))?;
        let plan = self.plan(&agent, &mut rng, &observed).await?;

        let exit = self.agents.horizon_bars.min(forward.len().saturating_sub(1));
        let market_return = forward
            .forward_return(0, exit)
            .ok_or_else(|| EngineError::data_unavailable(&segment.symbol, "no forward bars"))?;
        let direction = plan.verdict.signal.signum();
        let roi = if plan.verdict.signal == 0.0 {
            0.0
        } else {
            direction * market_return * agent.genome.leverage()
        };
        let profitable = roi > 0.0;
        let bucket = plan.condition.bucket();
        let learning_rate = self.agents.learning_rate;

        let record = self.store.write_async(|r| {
            let (deltas, lesson) = reflect(
                r,
                &agent.id,
                &bucket,
                &plan.votes,
                market_return,
                profitable,
                plan.verdict.confidence,
                learning_rate,
            )?;
            r.record_agent_trade(&agent.id, roi, profitable)?;

            let mut record = DecisionRecord {
                id: 0,
                agent_id: agent.id.clone(),
                round,
                timestamp: Utc::now(),
                symbol: segment.symbol.clone(),
                timeframe: segment.timeframe,
                condition_bucket: bucket.clone(),
                pattern_ids: plan.votes.iter().map(|v| v.pattern_id.clone()).collect(),
                signal: plan.verdict.signal,
                confidence: plan.verdict.confidence,
                explanation: plan.verdict.explanation.clone(),
                used_oracle: plan.used_oracle,
                roi,
                profitable,
                reflection: lesson,
                knowledge_deltas: deltas,
            };
            record.id = r.append_decision(&record)?;
            Ok(record)
        }).await?;

        if !plan.used_oracle {
            debug!(agent = %agent.id, decision = record.id, "decision used weighted-average fallback");
        }
        Ok(record)
    }

    /// Decide for every id; failures are logged and skipped
    pub async fn decide_all(&self, agent_ids: &[String]) -> Vec<DecisionRecord> {
        let mut records = Vec::with_capacity(agent_ids.len());
        for id in agent_ids {
            match self.decide(id).await {
                Ok(rec) => records.push(rec),
                Err(e) => warn!(agent = %id, cause = %e, "decision aborted"),
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::Personality;
    use crate::core::discovery;
    use crate::core::oracle::NoopOracle;
    use crate::data::SyntheticSource;
    use async_trait::async_trait;
    use rand::SeedableRng;

    fn seeded_store() -> Arc<EvolutionStore> {
        let store = Arc::new(EvolutionStore::in_memory().unwrap());
        store
            .write(|r| {
                for p in discovery::literature_catalogue() {
                    r.insert_pattern_if_absent(&p)?;
                }
                r.insert_agent_if_absent(&Agent::founder(Personality::Momentum, 0))?;
                r.insert_agent_if_absent(&Agent::founder(Personality::Contrarian, 0))
            })
            .unwrap();
        store
    }

    fn engine(store: Arc<EvolutionStore>, oracle: Arc<dyn ReasoningOracle>) -> DecisionEngine {
        DecisionEngine::new(
            store,
            Arc::new(SyntheticSource::new(5)),
            oracle,
            AgentsConfig::default(),
            MarketConfig::default(),
            21,
        )
    }

    struct FixedOracle;

    #[async_trait]
    impl ReasoningOracle for FixedOracle {
        async fn combine(&self, _votes: &[PatternVote], _c: &MarketCondition) -> EngineResult<OracleVerdict> {
            Ok(OracleVerdict { signal: 2.0, confidence: 0.9, explanation: "fixed".into() })
        }
    }

    #[test]
    fn test_selection_is_replayable() {
        let patterns = discovery::literature_catalogue();
        let agent = Agent::founder(Personality::Balanced, 0);
        let cond = MarketCondition::default();
        let snap = IndicatorSnapshot { ready: true, ..Default::default() };
        let cfg = AgentsConfig { explore_rate: 0.5, ..Default::default() };

        let a = select_patterns(&mut StdRng::seed_from_u64(4), &agent, &patterns, &[], &cond, &snap, &cfg);
        let b = select_patterns(&mut StdRng::seed_from_u64(4), &agent, &patterns, &[], &cond, &snap, &cfg);
        assert_eq!(a, b);
        assert_eq!(a.len(), agent.genome.top_k(2, 4));
        let mut ids: Vec<&str> = a.iter().map(|v| v.pattern_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), a.len());
    }

    #[test]
    fn test_knowledge_shifts_selection() {
        let patterns = discovery::literature_catalogue();
        let agent = Agent::founder(Personality::Balanced, 0);
        let cond = MarketCondition::default();
        let snap = IndicatorSnapshot { ready: true, ..Default::default() };
        let cfg = AgentsConfig { explore_rate: 0.0, ..Default::default() };

        // Ties break by id; favour the last pattern by id through knowledge
        let target = patterns.iter().map(|p| p.id.clone()).max().unwrap();
        let item = KnowledgeItem::new(&agent.id, KnowledgeKind::PatternPreference, Some(&target), &cond.bucket(), 1.0, 1.0);
        let votes = select_patterns(&mut StdRng::seed_from_u64(1), &agent, &patterns, &[item], &cond, &snap, &cfg);
        assert_eq!(votes[0].pattern_id, target);
    }

    #[tokio::test]
    async fn test_decide_records_everything() {
        let store = seeded_store();
        let engine = engine(store.clone(), Arc::new(NoopOracle));
        let rec = engine.decide("founder-momentum-0").await.unwrap();

        assert!(!rec.used_oracle);
        assert!(rec.id > 0);
        assert!((2..=4).contains(&rec.pattern_ids.len()));
        assert!(!rec.knowledge_deltas.is_empty());

        let agent = store.read(|r| r.get_agent("founder-momentum-0")).unwrap().unwrap();
        assert_eq!(agent.total_trades, 1);
        assert_eq!(agent.winning_trades, rec.profitable as i64);
        assert!((agent.avg_roi_per_trade - rec.roi).abs() < 1e-12);

        let logged = store.read(|r| r.decisions_for_agent("founder-momentum-0", 10)).unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].pattern_ids, rec.pattern_ids);

        // Decision outcomes move sample size, never votes
        for p in store.read(|r| r.all_patterns()).unwrap() {
            assert_eq!(p.votes, 0);
        }
    }

    #[tokio::test]
    async fn test_oracle_verdict_is_clamped() {
        let store = seeded_store();
        let engine = engine(store, Arc::new(FixedOracle));
        let rec = engine.decide("founder-contrarian-0").await.unwrap();
        assert!(rec.used_oracle);
        assert_eq!(rec.signal, 1.0);
        assert_eq!(rec.explanation, "fixed");
    }

    #[tokio::test]
    async fn test_plan_replays_from_same_snapshot() {
        let store = seeded_store();
        let engine = engine(store.clone(), Arc::new(NoopOracle));
        let agent = store.read(|r| r.get_agent("founder-momentum-0")).unwrap().unwrap();

        let mut rng = engine.decision_rng(&agent);
        let seg = engine.draw_segment(&mut rng).await.unwrap();
        let first = engine.plan(&agent, &mut rng, &seg).await.unwrap();

        let mut rng = engine.decision_rng(&agent);
        let seg2 = engine.draw_segment(&mut rng).await.unwrap();
        let second = engine.plan(&agent, &mut rng, &seg2).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_eliminated_agent_cannot_decide() {
        let store = seeded_store();
        store.write(|r| r.eliminate_agent("founder-momentum-0")).unwrap();
        let engine = engine(store, Arc::new(NoopOracle));
        assert!(engine.decide("founder-momentum-0").await.is_err());
    }
}
