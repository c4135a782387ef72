//! Evolution Controller
//!
//! Periodic population-level selection over the ranked active agents:
//! - Bottom fraction eliminated (never deleted), unless that would break
//!   the population floor
//! - Top fraction cloned: generation + 1, fitness reset to the median,
//!   knowledge and pattern weights copied with a Gaussian nudge,
//!   personality reassigned with a fixed probability
//! - One lineage edge per clone
//!
//! A pass is keyed by its cycle (the agent-round clock). The pass and its
//! ledger row commit together, so re-running a cycle is a no-op and clone
//! ids (uuid v5 of parent and cycle) never collide with a second copy.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::agent::{Agent, AgentStatus, Genome, Personality};
use super::knowledge::{KnowledgeItem, KnowledgeKind};
use super::types::seeded_rng;
use crate::config::EvolutionConfig;
use crate::data::{EvolutionStore, Records};
use crate::error::{EngineError, EngineResult};

/// Structured diff between a parent and its clone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationDetails {
    pub personality_from: Personality,
    pub personality_to: Personality,
    pub risk_tolerance_from: f64,
    pub risk_tolerance_to: f64,
    /// Pattern id -> change applied to the inherited weight
    pub weight_deltas: BTreeMap<String, f64>,
    pub knowledge_copied: usize,
}

impl MutationDetails {
    pub fn personality_mutated(&self) -> bool {
        self.personality_from != self.personality_to
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEdge {
    pub ancestor_id: String,
    pub descendant_id: String,
    pub generation_gap: i64,
    pub cycle: i64,
    pub mutation: MutationDetails,
    pub created_at: DateTime<Utc>,
}

/// Result of one committed pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvolutionPass {
    pub cycle: i64,
    pub eliminated: Vec<String>,
    /// Would have been eliminated but the floor kept them
    pub spared: Vec<String>,
    pub cloned: Vec<String>,
    pub median_fitness: f64,
}

/// Who goes and who reproduces, decided before anything is written
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionPlan {
    pub eliminate: Vec<String>,
    pub spared: Vec<String>,
    pub parents: Vec<String>,
}

/// `ranked` must be best first.
///
/// The floor caps eliminations at `n - min_population`. When it binds,
/// the lowest-fitness agents are still the ones eliminated; the floor is
/// kept by sparing the candidates nearest the cutoff (the best of the
/// bottom fraction), reported as `spared`. The worst agent never outlives
/// a better one in the same pass.
///
/// Clones never outnumber eliminations, so the pass keeps the active
/// count in `[min(floor, n), n]`. Fractions outside `[0, 1]` are clamped.
pub fn plan_selection(ranked: &[Agent], config: &EvolutionConfig) -> SelectionPlan {
    let n = ranked.len();
    let wanted = ((n as f64 * config.eliminate_fraction.clamp(0.0, 1.0)).floor() as usize).min(n);
    let allowed = wanted.min(n.saturating_sub(config.min_population));

    let bottom = &ranked[n - wanted..];
    let spared_count = wanted - allowed;
    let spared: Vec<String> = bottom[..spared_count].iter().map(|a| a.id.clone()).collect();
    let eliminate: Vec<String> = bottom[spared_count..].iter().map(|a| a.id.clone()).collect();

    let clones = ((n as f64 * config.clone_fraction.clamp(0.0, 1.0)).floor() as usize).min(eliminate.len());
    let parents = ranked
        .iter()
        .filter(|a| !eliminate.contains(&a.id))
        .take(clones)
        .map(|a| a.id.clone())
        .collect();

    SelectionPlan { eliminate, spared, parents }
}

pub fn median_fitness(agents: &[Agent]) -> f64 {
    if agents.is_empty() {
        return 0.0;
    }
    let mut values: Vec<f64> = agents.iter().map(|a| a.fitness).collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Deterministic clone id for (parent, cycle)
pub fn clone_id(parent_id: &str, cycle: i64) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{}:{}", parent_id, cycle).as_bytes()).to_string()
}

/// Build a clone, its knowledge copies and its lineage edge
pub fn make_clone(
    parent: &Agent,
    parent_knowledge: &[KnowledgeItem],
    cycle: i64,
    median: f64,
    config: &EvolutionConfig,
    rng: &mut StdRng,
) -> EngineResult<(Agent, Vec<KnowledgeItem>, LineageEdge)> {
    let noise = Normal::new(0.0, config.weight_sigma.max(0.0))
        .map_err(|e| EngineError::invariant(format!("agent:{}", parent.id), e.to_string()))?;

    let personality = if rng.gen::<f64>() < config.personality_mutation_rate {
        *parent.personality.others().choose(rng).unwrap_or(&parent.personality)
    } else {
        parent.personality
    };

    // Inherit weights, folding in the parent's confident preferences
    let mut weights = parent.genome.pattern_weights.clone();
    for item in parent_knowledge.iter().filter(|k| k.kind == KnowledgeKind::PatternPreference) {
        if let Some(pid) = &item.pattern_id {
            let w = weights.entry(pid.clone()).or_insert(0.0);
            *w = (*w + 0.5 * item.strength * item.confidence).clamp(-1.0, 1.0);
        }
    }
    let mut weight_deltas = BTreeMap::new();
    for (pid, w) in weights.iter_mut() {
        let before = *w;
        *w = (*w + noise.sample(rng)).clamp(-1.0, 1.0);
        weight_deltas.insert(pid.clone(), *w - before);
    }

    let risk_tolerance = (parent.genome.risk_tolerance + noise.sample(rng)).clamp(0.05, 1.0);
    let id = clone_id(&parent.id, cycle);

    let child = Agent {
        id: id.clone(),
        personality,
        generation: parent.generation + 1,
        fitness: median,
        total_trades: 0,
        winning_trades: 0,
        avg_roi_per_trade: 0.0,
        status: AgentStatus::Active,
        genome: Genome { risk_tolerance, pattern_weights: weights },
        parent_id: Some(parent.id.clone()),
        created_at: Utc::now(),
    };

    let knowledge: Vec<KnowledgeItem> = parent_knowledge
        .iter()
        .map(|k| {
            let mut copy = KnowledgeItem::new(
                &id,
                k.kind,
                k.pattern_id.as_deref(),
                &k.condition_bucket,
                k.strength + noise.sample(rng),
                k.confidence,
            );
            copy.detail = k.detail.clone();
            copy
        })
        .collect();

    let edge = LineageEdge {
        ancestor_id: parent.id.clone(),
        descendant_id: id,
        generation_gap: 1,
        cycle,
        mutation: MutationDetails {
            personality_from: parent.personality,
            personality_to: personality,
            risk_tolerance_from: parent.genome.risk_tolerance,
            risk_tolerance_to: risk_tolerance,
            weight_deltas,
            knowledge_copied: knowledge.len(),
        },
        created_at: Utc::now(),
    };

    Ok((child, knowledge, edge))
}

/// Apply a full pass for `cycle` inside the caller's transaction.
/// Returns None when the cycle has already been applied.
pub fn apply_pass(
    r: &Records<'_>,
    cycle: i64,
    config: &EvolutionConfig,
    seed: u64,
) -> EngineResult<Option<EvolutionPass>> {
    if r.evolution_pass_exists(cycle)? {
        return Ok(None);
    }

    let ranked = r.active_agents()?;
    let median = median_fitness(&ranked);
    let plan = plan_selection(&ranked, config);
    let mut pass = EvolutionPass { cycle, median_fitness: median, ..Default::default() };

    for id in &plan.spared {
        let e = EngineError::invariant(format!("agent:{}", id), "elimination would break population floor");
        warn!(agent = %id, cycle, cause = %e, "elimination skipped");
        pass.spared.push(id.clone());
    }

    // Eliminations are fixed before any clone exists
    for id in &plan.eliminate {
        if r.eliminate_agent(id)? {
            debug!(agent = %id, cycle, "agent eliminated");
            pass.eliminated.push(id.clone());
        } else {
            let e = EngineError::invariant(format!("agent:{}", id), "not active at elimination");
            warn!(agent = %id, cycle, cause = %e, "elimination skipped");
        }
    }

    for parent_id in &plan.parents {
        let Some(parent) = ranked.iter().find(|a| &a.id == parent_id) else {
            continue;
        };
        let parent_knowledge = r.knowledge_for_agent(parent_id)?;
        let mut rng = seeded_rng(seed, &format!("evolve:{}", parent_id), cycle);
        let (child, knowledge, edge) = make_clone(parent, &parent_knowledge, cycle, median, config, &mut rng)?;

        if !r.insert_agent_if_absent(&child)? {
            let e = EngineError::invariant(format!("agent:{}", child.id), "clone already exists");
            warn!(agent = %child.id, cycle, cause = %e, "clone skipped");
            continue;
        }
        for item in &knowledge {
            r.insert_knowledge_if_absent(item)?;
        }
        r.insert_lineage_if_absent(&edge)?;
        debug!(
            parent = %parent_id,
            clone = %child.id,
            generation = child.generation,
            personality = %child.personality,
            mutated = edge.mutation.personality_mutated(),
            "agent cloned"
        );
        pass.cloned.push(child.id);
    }

    r.record_evolution_pass(&pass)?;
    r.increment_counter("evolution_passes")?;
    Ok(Some(pass))
}

pub struct EvolutionController {
    store: Arc<EvolutionStore>,
    config: EvolutionConfig,
    seed: u64,
}

impl EvolutionController {
    pub fn new(store: Arc<EvolutionStore>, config: EvolutionConfig, seed: u64) -> Self {
        Self { store, config, seed }
    }

    /// Whether enough agent rounds passed since the last cycle
    pub fn is_due(&self) -> EngineResult<bool> {
        self.store.read(|r| {
            let now = r.counter("agent_rounds")?;
            let last = r.last_evolution_cycle()?.unwrap_or(0);
            Ok(now > last && now - last >= self.config.every_rounds)
        })
    }

    /// Run the pass for the current agent-round cycle
    pub async fn run_pass(&self) -> EngineResult<Option<EvolutionPass>> {
        let config = self.config.clone();
        let seed = self.seed;
        let pass = self
            .store
            .write_async(|r| {
                let cycle = r.counter("agent_rounds")?;
                apply_pass(r, cycle, &config, seed)
            })
            .await?;

        match &pass {
            Some(p) => info!(
                cycle = p.cycle,
                eliminated = p.eliminated.len(),
                spared = p.spared.len(),
                cloned = p.cloned.len(),
                median = p.median_fitness,
                "evolution pass"
            ),
            None => debug!("evolution cycle already applied"),
        }
        Ok(pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn ranked(n: usize) -> Vec<Agent> {
        (0..n)
            .map(|i| {
                let mut a = Agent::founder(Personality::all()[i % 6], i);
                a.fitness = (n - i) as f64 * 10.0;
                a
            })
            .collect()
    }

    fn cfg(min_population: usize) -> EvolutionConfig {
        EvolutionConfig { min_population, ..Default::default() }
    }

    #[test]
    fn test_plan_basic_fractions() {
        let agents = ranked(10);
        let plan = plan_selection(&agents, &cfg(2));
        assert_eq!(plan.eliminate, vec![agents[8].id.clone(), agents[9].id.clone()]);
        assert_eq!(plan.parents, vec![agents[0].id.clone(), agents[1].id.clone()]);
        assert!(plan.spared.is_empty());
    }

    #[test]
    fn test_plan_respects_floor() {
        let agents = ranked(10);
        let plan = plan_selection(&agents, &cfg(9));
        // Only one may go: the worst; the next one up is spared
        assert_eq!(plan.eliminate, vec![agents[9].id.clone()]);
        assert_eq!(plan.spared, vec![agents[8].id.clone()]);
        assert_eq!(plan.parents.len(), 1);

        let at_floor = plan_selection(&agents, &cfg(10));
        assert!(at_floor.eliminate.is_empty());
        assert!(at_floor.parents.is_empty());
    }

    #[test]
    fn test_plan_tolerates_oversized_fractions() {
        let agents = ranked(5);
        let config = EvolutionConfig { eliminate_fraction: 1.5, clone_fraction: 2.0, min_population: 2, ..Default::default() };
        let plan = plan_selection(&agents, &config);
        // All five are candidates; the floor keeps the best two of them
        assert_eq!(plan.spared, vec![agents[0].id.clone(), agents[1].id.clone()]);
        assert_eq!(plan.eliminate.len(), 3);
        assert_eq!(plan.parents, vec![agents[0].id.clone(), agents[1].id.clone()]);

        let none = EvolutionConfig { eliminate_fraction: -1.0, ..cfg(0) };
        assert!(plan_selection(&agents, &none).eliminate.is_empty());
    }

    #[test]
    fn test_median() {
        assert_eq!(median_fitness(&ranked(3)), 20.0);
        assert_eq!(median_fitness(&ranked(4)), 25.0);
        assert_eq!(median_fitness(&[]), 0.0);
    }

    #[test]
    fn test_clone_shape() {
        let mut parent = Agent::founder(Personality::Momentum, 0);
        parent.generation = 3;
        parent.fitness = 80.0;
        let pref = KnowledgeItem::new(&parent.id, KnowledgeKind::PatternPreference, Some("p1"), "b", 0.8, 0.9);
        let mut rng = StdRng::seed_from_u64(1);
        let (child, knowledge, edge) = make_clone(&parent, &[pref], 50, 33.0, &EvolutionConfig::default(), &mut rng).unwrap();

        assert_eq!(child.generation, 4);
        assert_eq!(child.fitness, 33.0);
        assert_eq!(child.total_trades, 0);
        assert_eq!(child.id, clone_id(&parent.id, 50));
        assert!((0.05..=1.0).contains(&child.genome.risk_tolerance));
        assert!(child.genome.pattern_weights.contains_key("p1"));
        assert_eq!(knowledge.len(), 1);
        assert_eq!(knowledge[0].agent_id, child.id);
        assert_eq!(knowledge[0].times_validated, 0);
        assert_eq!(edge.ancestor_id, parent.id);
        assert_eq!(edge.mutation.knowledge_copied, 1);
    }

    #[test]
    fn test_personality_mutation_rate_bounds() {
        let parent = Agent::founder(Personality::Balanced, 0);
        let never = EvolutionConfig { personality_mutation_rate: 0.0, ..Default::default() };
        let always = EvolutionConfig { personality_mutation_rate: 1.0, ..Default::default() };
        for i in 0..20 {
            let mut rng = StdRng::seed_from_u64(i);
            let (c, _, _) = make_clone(&parent, &[], 1, 0.0, &never, &mut rng).unwrap();
            assert_eq!(c.personality, Personality::Balanced);
            let (c, _, e) = make_clone(&parent, &[], 1, 0.0, &always, &mut rng).unwrap();
            assert_ne!(c.personality, Personality::Balanced);
            assert!(e.mutation.personality_mutated());
        }
    }

    #[tokio::test]
    async fn test_pass_is_idempotent() {
        let store = Arc::new(EvolutionStore::in_memory().unwrap());
        store
            .write(|r| {
                for a in ranked(10) {
                    r.insert_agent_if_absent(&a)?;
                }
                for _ in 0..50 {
                    r.increment_counter("agent_rounds")?;
                }
                Ok(())
            })
            .unwrap();
        let ctl = EvolutionController::new(store.clone(), cfg(4), 7);
        assert!(ctl.is_due().unwrap());

        let first = ctl.run_pass().await.unwrap().unwrap();
        assert_eq!(first.eliminated.len(), 2);
        assert_eq!(first.cloned.len(), 2);
        let ranks_after: Vec<String> = store.read(|r| r.active_agents()).unwrap().into_iter().map(|a| a.id).collect();

        assert!(ctl.run_pass().await.unwrap().is_none());
        assert!(!ctl.is_due().unwrap());
        let ranks_again: Vec<String> = store.read(|r| r.active_agents()).unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ranks_after, ranks_again);
        assert_eq!(store.read(|r| r.all_lineage()).unwrap().len(), 2);
        assert_eq!(store.read(|r| r.count_agents(AgentStatus::Active)).unwrap(), 10);
    }
}
