//! Scheduler
//!
//! Five independent periodic tasks, fastest first: ingest, pattern arena,
//! decisions, agent arena, evolution (+ knowledge network). They share
//! nothing in-process beyond the store:
//! - single-flight per kind through a store lease taken fresh by every
//!   tick, so neither a manual trigger nor a second tick of the same
//!   scheduler can overlap a running one
//! - each tick runs under a time budget; an overrun abandons the tick,
//!   and since every unit commits on its own nothing half-done is kept
//! - different kinds may overlap freely

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::agent::{Agent, Personality};
use super::arena::{ArenaTickReport, PatternArena};
use super::competition::{AgentArena, CompetitionReport};
use super::decision::DecisionEngine;
use super::evolution::{EvolutionController, EvolutionPass};
use super::health::{TickHealth, TickHealthSnapshot};
use super::network::{KnowledgeNetwork, NetworkReport};
use super::oracle::ReasoningOracle;
use super::sampler::{IngestReport, TradeSampler};
use crate::config::{Config, SchedulerConfig};
use crate::data::{EvolutionStore, PriceSource};
use crate::error::EngineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Ingest,
    PatternArena,
    Decisions,
    AgentArena,
    Evolution,
}

impl TaskKind {
    pub fn all() -> [TaskKind; 5] {
        [
            TaskKind::Ingest,
            TaskKind::PatternArena,
            TaskKind::Decisions,
            TaskKind::AgentArena,
            TaskKind::Evolution,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Ingest => "ingest",
            TaskKind::PatternArena => "pattern-arena",
            TaskKind::Decisions => "decisions",
            TaskKind::AgentArena => "agent-arena",
            TaskKind::Evolution => "evolution",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::all().into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TickOutcome {
    Ingest(IngestReport),
    PatternArena(ArenaTickReport),
    Decisions { decided: usize, agents: usize },
    AgentArena(CompetitionReport),
    Evolution {
        pass: Option<EvolutionPass>,
        network: Option<NetworkReport>,
    },
    Skipped { reason: String },
}

/// Every component, wired to one store and one price source
pub struct Engine {
    pub store: Arc<EvolutionStore>,
    sampler: TradeSampler,
    arena: PatternArena,
    decisions: Arc<DecisionEngine>,
    agent_arena: AgentArena,
    evolution: EvolutionController,
    network: KnowledgeNetwork,
    founders_per_personality: usize,
}

impl Engine {
    pub fn new(
        config: &Config,
        store: Arc<EvolutionStore>,
        source: Arc<dyn PriceSource>,
        oracle: Arc<dyn ReasoningOracle>,
    ) -> Self {
        let seed = config.system.seed;
        let decisions = Arc::new(DecisionEngine::new(
            store.clone(),
            source.clone(),
            oracle,
            config.agents.clone(),
            config.market.clone(),
            seed,
        ));
        Self {
            sampler: TradeSampler::new(
                store.clone(),
                source.clone(),
                config.market.clone(),
                config.library.clone(),
                seed,
            ),
            arena: PatternArena::new(
                store.clone(),
                source,
                config.arena.clone(),
                config.market.clone(),
                config.library.lifecycle_rules(),
                seed,
            ),
            agent_arena: AgentArena::new(
                store.clone(),
                decisions.clone(),
                config.fitness.weights(),
                config.fitness.batch_trades,
            ),
            evolution: EvolutionController::new(store.clone(), config.evolution.clone(), seed),
            network: KnowledgeNetwork::new(store.clone(), config.knowledge.clone()),
            decisions,
            founders_per_personality: config.agents.founders_per_personality,
            store,
        }
    }

    /// Create founders once; later calls insert nothing
    pub async fn seed_founders(&self) -> EngineResult<usize> {
        let per = self.founders_per_personality;
        let created = self
            .store
            .write_async(|r| {
                let mut created = 0;
                for personality in Personality::all() {
                    for i in 0..per {
                        if r.insert_agent_if_absent(&Agent::founder(personality, i))? {
                            created += 1;
                        }
                    }
                }
                Ok(created)
            })
            .await?;
        if created > 0 {
            info!(created, "founders seeded");
        }
        Ok(created)
    }

    /// Founders plus a library top-up
    pub async fn seed(&self) -> EngineResult<(usize, usize)> {
        let founders = self.seed_founders().await?;
        let report = self.sampler.run_tick().await?;
        Ok((founders, report.discovered))
    }

    pub async fn run_task(&self, kind: TaskKind) -> EngineResult<TickOutcome> {
        match kind {
            TaskKind::Ingest => Ok(TickOutcome::Ingest(self.sampler.run_tick().await?)),
            TaskKind::PatternArena => Ok(TickOutcome::PatternArena(self.arena.run_tick().await?)),
            TaskKind::Decisions => {
                let ids: Vec<String> = self
                    .store
                    .read(|r| r.active_agents())?
                    .into_iter()
                    .map(|a| a.id)
                    .collect();
                let records = self.decisions.decide_all(&ids).await;
                info!(decided = records.len(), agents = ids.len(), "decision tick");
                Ok(TickOutcome::Decisions { decided: records.len(), agents: ids.len() })
            }
            TaskKind::AgentArena => Ok(TickOutcome::AgentArena(self.agent_arena.run_round().await?)),
            TaskKind::Evolution => self.evolve(false).await,
        }
    }

    /// Evolution pass when due (always when `force`), then any network
    /// pass still owed for the latest cycle
    pub async fn evolve(&self, force: bool) -> EngineResult<TickOutcome> {
        let pass = if force || self.evolution.is_due()? {
            self.evolution.run_pass().await?
        } else {
            None
        };
        // The network reads the post-pass registry
        let network = self.network.run().await?;
        if !force && pass.is_none() && network.is_none() {
            return Ok(TickOutcome::Skipped { reason: "evolution not due".to_string() });
        }
        Ok(TickOutcome::Evolution { pass, network })
    }
}

pub struct Scheduler {
    engine: Arc<Engine>,
    timing: SchedulerConfig,
    holder: String,
    health: Mutex<HashMap<TaskKind, TickHealth>>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, timing: SchedulerConfig) -> Self {
        let health = TaskKind::all()
            .into_iter()
            .map(|k| (k, TickHealth::new(timing.timing(k).interval() * 3 + timing.timing(k).budget())))
            .collect();
        Self {
            engine,
            timing,
            holder: uuid::Uuid::new_v4().to_string(),
            health: Mutex::new(health),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn with_health(&self, kind: TaskKind, f: impl FnOnce(&mut TickHealth)) {
        if let Ok(mut map) = self.health.lock() {
            if let Some(h) = map.get_mut(&kind) {
                f(h);
            }
        }
    }

    pub fn health(&self) -> Vec<TickHealthSnapshot> {
        match self.health.lock() {
            Ok(map) => TaskKind::all()
                .into_iter()
                .filter_map(|k| map.get(&k).map(|h| h.snapshot(k.as_str())))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// One single-flight, budgeted tick of `kind`
    pub async fn trigger(&self, kind: TaskKind) -> EngineResult<TickOutcome> {
        self.guarded(kind, self.engine.run_task(kind)).await
    }

    /// Evolution tick that ignores the cadence, still under the lease
    pub async fn force_evolution(&self) -> EngineResult<TickOutcome> {
        self.guarded(TaskKind::Evolution, self.engine.evolve(true)).await
    }

    async fn guarded(
        &self,
        kind: TaskKind,
        work: impl Future<Output = EngineResult<TickOutcome>>,
    ) -> EngineResult<TickOutcome> {
        let store = &self.engine.store;
        let holder = format!("{}:{}", self.holder, uuid::Uuid::new_v4());
        let now = Utc::now();
        let ttl = chrono::Duration::seconds(self.timing.lease_ttl_secs.max(1) as i64);
        let acquired = store
            .write_async(|r| r.try_acquire_lease(kind.as_str(), &holder, now, now + ttl))
            .await?;
        if !acquired {
            debug!(task = %kind, "lease held, tick skipped");
            self.with_health(kind, TickHealth::record_skip);
            return Ok(TickOutcome::Skipped { reason: "lease held".to_string() });
        }

        let budget = self.timing.timing(kind).budget();
        let result = tokio::time::timeout(budget, work).await;

        if let Err(e) = store.write_async(|r| r.release_lease(kind.as_str(), &holder)).await {
            warn!(task = %kind, cause = %e, "lease release failed");
        }

        match result {
            Ok(Ok(outcome)) => {
                self.with_health(kind, TickHealth::record_success);
                Ok(outcome)
            }
            Ok(Err(e)) => {
                warn!(task = %kind, cause = %e, "degraded tick");
                self.with_health(kind, TickHealth::record_failure);
                Err(e)
            }
            Err(_) => {
                warn!(task = %kind, budget_secs = budget.as_secs(), "tick exceeded budget, abandoned");
                self.with_health(kind, TickHealth::record_timeout);
                Ok(TickOutcome::Skipped { reason: "budget exceeded".to_string() })
            }
        }
    }

    /// Run every kind on its own interval until `shutdown` resolves
    pub async fn run(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) {
        let mut handles = Vec::new();
        for kind in TaskKind::all() {
            let me = self.clone();
            let period = self.timing.timing(kind).interval();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = me.trigger(kind).await {
                        debug!(task = %kind, cause = %e, "tick failed");
                    }
                }
            }));
        }
        info!(tasks = handles.len(), "scheduler running");

        shutdown.await;
        for h in &handles {
            h.abort();
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::oracle::NoopOracle;
    use crate::core::types::{Segment, Timeframe};
    use crate::data::SyntheticSource;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::time::Duration;

    /// Synthetic prices that take a few milliseconds to arrive
    struct SlowSource(SyntheticSource);

    #[async_trait]
    impl PriceSource for SlowSource {
        async fn get_segment(
            &self,
            symbol: &str,
            start: DateTime<Utc>,
            timeframe: Timeframe,
            bars: usize,
        ) -> EngineResult<Segment> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.0.get_segment(symbol, start, timeframe, bars).await
        }

        async fn available_range(&self, symbol: &str) -> EngineResult<(DateTime<Utc>, DateTime<Utc>)> {
            self.0.available_range(symbol).await
        }
    }

    fn engine() -> Arc<Engine> {
        engine_with(Arc::new(SyntheticSource::new(2)))
    }

    fn engine_with(source: Arc<dyn PriceSource>) -> Arc<Engine> {
        let mut config = Config::default();
        config.library.target_size = 16;
        config.agents.founders_per_personality = 1;
        config.evolution.every_rounds = 2;
        config.evolution.min_population = 3;
        let store = Arc::new(EvolutionStore::in_memory().unwrap());
        Arc::new(Engine::new(&config, store, source, Arc::new(NoopOracle)))
    }

    #[test]
    fn test_task_names() {
        for k in TaskKind::all() {
            assert_eq!(TaskKind::from_str(k.as_str()), Some(k));
        }
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let e = engine();
        let (founders, discovered) = e.seed().await.unwrap();
        assert_eq!(founders, 6);
        assert_eq!(discovered, 16);
        assert_eq!(e.seed_founders().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lease_blocks_second_holder() {
        let e = engine();
        let s = Scheduler::new(e.clone(), SchedulerConfig::default());
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(60);
        assert!(e.store.write(|r| r.try_acquire_lease("ingest", "someone-else", now, later)).unwrap());

        let out = s.trigger(TaskKind::Ingest).await.unwrap();
        assert_eq!(out, TickOutcome::Skipped { reason: "lease held".to_string() });
        assert_eq!(s.health()[0].skipped, 1);

        // Released leases can be taken over
        e.store.write(|r| r.release_lease("ingest", "someone-else")).unwrap();
        assert!(matches!(s.trigger(TaskKind::Ingest).await.unwrap(), TickOutcome::Ingest(_)));
    }

    #[tokio::test]
    async fn test_full_cycle_through_triggers() {
        let e = engine();
        e.seed().await.unwrap();
        let s = Scheduler::new(e.clone(), SchedulerConfig::default());

        s.trigger(TaskKind::PatternArena).await.unwrap();
        assert!(matches!(
            s.trigger(TaskKind::Evolution).await.unwrap(),
            TickOutcome::Skipped { .. }
        ));
        s.trigger(TaskKind::AgentArena).await.unwrap();
        s.trigger(TaskKind::AgentArena).await.unwrap();

        match s.trigger(TaskKind::Evolution).await.unwrap() {
            TickOutcome::Evolution { pass: Some(pass), network: Some(net) } => {
                assert_eq!(pass.cycle, 2);
                assert_eq!(pass.eliminated.len(), 1);
                assert_eq!(pass.cloned.len(), 1);
                assert_eq!(net.cycle, 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(s.health().iter().all(|h| h.failures == 0));
    }

    #[tokio::test]
    async fn test_same_kind_ticks_never_overlap() {
        let e = engine_with(Arc::new(SlowSource(SyntheticSource::new(2))));
        e.seed().await.unwrap();
        let s = Scheduler::new(e.clone(), SchedulerConfig::default());

        let (a, b) = tokio::join!(s.trigger(TaskKind::AgentArena), s.trigger(TaskKind::AgentArena));
        let outcomes = [a.unwrap(), b.unwrap()];
        let skipped = outcomes.iter().filter(|o| matches!(o, TickOutcome::Skipped { .. })).count();
        assert_eq!(skipped, 1);
        assert_eq!(e.store.read(|r| r.counter("agent_rounds")).unwrap(), 1);

        // The lease went back once the running tick finished
        assert!(matches!(
            s.trigger(TaskKind::AgentArena).await.unwrap(),
            TickOutcome::AgentArena(_)
        ));
        assert_eq!(e.store.read(|r| r.counter("agent_rounds")).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_forced_evolution_respects_lease() {
        let e = engine();
        e.seed().await.unwrap();
        let s = Scheduler::new(e.clone(), SchedulerConfig::default());
        s.trigger(TaskKind::AgentArena).await.unwrap();

        let now = Utc::now();
        let later = now + chrono::Duration::seconds(60);
        assert!(e.store.write(|r| r.try_acquire_lease("evolution", "daemon", now, later)).unwrap());
        assert_eq!(
            s.force_evolution().await.unwrap(),
            TickOutcome::Skipped { reason: "lease held".to_string() }
        );
        assert_eq!(e.store.read(|r| r.last_evolution_cycle()).unwrap(), None);

        e.store.write(|r| r.release_lease("evolution", "daemon")).unwrap();
        // One round is below the cadence, forcing runs it anyway
        match s.force_evolution().await.unwrap() {
            TickOutcome::Evolution { pass: Some(pass), network: Some(net) } => {
                assert_eq!(pass.cycle, 1);
                assert_eq!(net.cycle, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            s.force_evolution().await.unwrap(),
            TickOutcome::Evolution { pass: None, network: None }
        );
    }

    #[tokio::test]
    async fn test_missed_network_pass_runs_next_tick() {
        let e = engine();
        e.seed().await.unwrap();
        let s = Scheduler::new(e.clone(), SchedulerConfig::default());
        s.trigger(TaskKind::AgentArena).await.unwrap();
        s.trigger(TaskKind::AgentArena).await.unwrap();

        // The pass commits but its network pass never happens
        let pass = e.evolution.run_pass().await.unwrap().unwrap();
        assert_eq!(pass.cycle, 2);
        assert!(!e.store.read(|r| r.network_metrics_exist(2)).unwrap());

        match s.trigger(TaskKind::Evolution).await.unwrap() {
            TickOutcome::Evolution { pass: None, network: Some(net) } => assert_eq!(net.cycle, 2),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            s.trigger(TaskKind::Evolution).await.unwrap(),
            TickOutcome::Skipped { reason: "evolution not due".to_string() }
        );
    }
}
