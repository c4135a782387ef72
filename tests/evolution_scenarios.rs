//! End-to-end scenarios over an in-memory store and synthetic prices

use std::collections::HashMap;
use std::sync::Arc;

use colosseum::config::Config;
use colosseum::core::arena::selection_weight;
use colosseum::core::competition::{fitness, FitnessInputs, FitnessWeights};
use colosseum::core::{Engine, NoopOracle, TaskKind, TickOutcome};
use colosseum::data::{EvolutionStore, SyntheticSource};

fn engine(config: &Config) -> Arc<Engine> {
    let store = Arc::new(EvolutionStore::in_memory().unwrap());
    Arc::new(Engine::new(
        config,
        store,
        Arc::new(SyntheticSource::new(config.system.seed)),
        Arc::new(NoopOracle),
    ))
}

fn small_config() -> Config {
    let mut config = Config::default();
    config.system.seed = 11;
    config.library.target_size = 20;
    config.fitness.batch_trades = 2;
    config.evolution.every_rounds = 1;
    config.evolution.min_population = 10;
    config
}

#[tokio::test]
async fn test_generations_and_population_across_passes() {
    let config = small_config();
    let engine = engine(&config);
    let (founders, _) = engine.seed().await.unwrap();
    assert_eq!(founders, 12);

    let mut prev = 12;
    for cycle in 1..=4 {
        engine.run_task(TaskKind::PatternArena).await.unwrap();
        engine.run_task(TaskKind::AgentArena).await.unwrap();
        match engine.run_task(TaskKind::Evolution).await.unwrap() {
            TickOutcome::Evolution { pass: Some(pass), network: Some(net) } => {
                assert_eq!(pass.cycle, cycle);
                assert!(pass.cloned.len() <= pass.eliminated.len());
                assert_eq!(net.cycle, cycle);
            }
            other => panic!("cycle {} produced {:?}", cycle, other),
        }

        let active = engine.store.read(|r| r.active_agents()).unwrap().len();
        assert!(active >= 10 && active <= prev, "cycle {}: {} active", cycle, active);
        prev = active;
    }

    let agents: HashMap<String, i64> = engine
        .store
        .read(|r| r.all_agents())
        .unwrap()
        .into_iter()
        .map(|a| (a.id, a.generation))
        .collect();
    let lineage = engine.store.read(|r| r.all_lineage()).unwrap();
    assert!(!lineage.is_empty());
    for edge in &lineage {
        assert!(agents[&edge.descendant_id] > agents[&edge.ancestor_id]);
        assert_eq!(edge.generation_gap, 1);
    }
    assert!(engine.store.read(|r| r.max_generation()).unwrap() >= 1);
}

#[tokio::test]
async fn test_evolution_cycle_applies_once() {
    let config = small_config();
    let engine = engine(&config);
    engine.seed().await.unwrap();
    engine.run_task(TaskKind::AgentArena).await.unwrap();

    let first = engine.evolve(true).await.unwrap();
    let agents_after_first = engine.store.read(|r| r.all_agents()).unwrap().len();
    let lineage_after_first = engine.store.read(|r| r.all_lineage()).unwrap().len();

    // Same cycle again, forced or scheduled
    assert_eq!(engine.evolve(true).await.unwrap(), TickOutcome::Evolution { pass: None, network: None });
    assert!(matches!(
        engine.run_task(TaskKind::Evolution).await.unwrap(),
        TickOutcome::Skipped { .. }
    ));
    assert!(matches!(first, TickOutcome::Evolution { pass: Some(_), .. }));
    assert_eq!(engine.store.read(|r| r.all_agents()).unwrap().len(), agents_after_first);
    assert_eq!(engine.store.read(|r| r.all_lineage()).unwrap().len(), lineage_after_first);
}

#[tokio::test]
async fn test_decisions_leave_votes_untouched() {
    let config = small_config();
    let engine = engine(&config);
    engine.seed().await.unwrap();

    let before: HashMap<String, (i64, i64)> = engine
        .store
        .read(|r| r.all_patterns())
        .unwrap()
        .into_iter()
        .map(|p| (p.id, (p.votes, p.runs)))
        .collect();
    match engine.run_task(TaskKind::Decisions).await.unwrap() {
        TickOutcome::Decisions { decided, agents } => {
            assert_eq!(agents, 12);
            assert_eq!(decided, 12);
        }
        other => panic!("unexpected {:?}", other),
    }
    for p in engine.store.read(|r| r.all_patterns()).unwrap() {
        assert_eq!(before[&p.id], (p.votes, p.runs));
    }
    assert_eq!(engine.store.read(|r| r.count_decisions()).unwrap(), 12);
}

#[test]
fn test_untested_pattern_outdraws_veteran() {
    let fresh = selection_weight(0, 0);
    let veteran = selection_weight(100, 40);
    assert!((fresh - 1000.0).abs() < 1e-9);
    assert!((veteran - 49.5).abs() < 0.01);
    assert!(fresh > veteran);
}

#[test]
fn test_reference_fitness_with_custom_weights() {
    let inputs = FitnessInputs {
        win_rate: 0.6,
        avg_roi_per_trade: 0.02,
        total_trades: 200,
        sharpe_proxy: 1.2,
    };
    assert!((fitness(&inputs, &FitnessWeights::default()) - 62.2).abs() < 1e-9);

    let heavy_win = FitnessWeights { win_rate: 100.0, ..Default::default() };
    assert!((fitness(&inputs, &heavy_win) - 92.2).abs() < 1e-9);
}
