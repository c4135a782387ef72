//! Agent Fitness
//!
//! fitness = winRate*w1 + avgRoi*w2 + experience*w3 + sharpe*w4
//!
//! experience saturates at `experience_threshold` trades so young agents
//! are not stuck at the bottom; the Sharpe proxy is taken over the most
//! recent competition batch only.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::agent::Agent;
use super::decision::DecisionEngine;
use crate::data::EvolutionStore;
use crate::error::EngineResult;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitnessWeights {
    pub win_rate: f64,
    pub roi: f64,
    pub experience: f64,
    pub sharpe: f64,
    pub experience_threshold: i64,
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self {
            win_rate: 50.0,
            roi: 10.0,
            experience: 20.0,
            sharpe: 10.0,
            experience_threshold: 100,
        }
    }
}

/// Inputs to one fitness evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitnessInputs {
    pub win_rate: f64,
    pub avg_roi_per_trade: f64,
    pub total_trades: i64,
    pub sharpe_proxy: f64,
}

pub fn experience_term(total_trades: i64, threshold: i64) -> f64 {
    if threshold <= 0 {
        return 1.0;
    }
    (total_trades.max(0) as f64 / threshold as f64).min(1.0)
}

/// Batch mean over batch sample stddev; 0 when the stddev is 0
pub fn sharpe_proxy(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = var.sqrt();
    if std == 0.0 || !std.is_finite() {
        0.0
    } else {
        mean / std
    }
}

pub fn fitness(inputs: &FitnessInputs, weights: &FitnessWeights) -> f64 {
    inputs.win_rate * weights.win_rate
        + inputs.avg_roi_per_trade * weights.roi
        + experience_term(inputs.total_trades, weights.experience_threshold) * weights.experience
        + inputs.sharpe_proxy * weights.sharpe
}

/// Fitness for an agent's lifetime counters plus its latest batch
pub fn agent_fitness(agent: &Agent, batch_returns: &[f64], weights: &FitnessWeights) -> f64 {
    fitness(
        &FitnessInputs {
            win_rate: agent.win_rate(),
            avg_roi_per_trade: agent.avg_roi_per_trade,
            total_trades: agent.total_trades,
            sharpe_proxy: sharpe_proxy(batch_returns),
        },
        weights,
    )
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompetitionReport {
    pub round: i64,
    pub agents: usize,
    pub trades: usize,
    /// (agent id, fitness) best first
    pub standings: Vec<(String, f64)>,
}

/// Runs a fixed batch of decisions per active agent, then re-scores it
pub struct AgentArena {
    store: Arc<EvolutionStore>,
    engine: Arc<DecisionEngine>,
    weights: FitnessWeights,
    batch_trades: usize,
}

impl AgentArena {
    pub fn new(store: Arc<EvolutionStore>, engine: Arc<DecisionEngine>, weights: FitnessWeights, batch_trades: usize) -> Self {
        Self { store, engine, weights, batch_trades }
    }

    pub async fn run_round(&self) -> EngineResult<CompetitionReport> {
        let agents = self.store.read(|r| r.active_agents())?;
        let mut trades = 0;

        for agent in &agents {
            let mut returns = Vec::with_capacity(self.batch_trades);
            for _ in 0..self.batch_trades {
                match self.engine.decide(&agent.id).await {
                    Ok(rec) => returns.push(rec.roi),
                    Err(e) => warn!(agent = %agent.id, cause = %e, "competition trade aborted"),
                }
            }
            if returns.is_empty() {
                continue;
            }
            trades += returns.len();

            let weights = self.weights;
            self.store
                .write_async(|r| {
                    if let Some(fresh) = r.get_agent(&agent.id)? {
                        r.set_agent_fitness(&fresh.id, agent_fitness(&fresh, &returns, &weights))?;
                    }
                    Ok(())
                })
                .await?;
        }

        let round = self.store.write_async(|r| r.increment_counter("agent_rounds")).await?;
        let standings: Vec<(String, f64)> = self
            .store
            .read(|r| r.active_agents())?
            .into_iter()
            .map(|a| (a.id, a.fitness))
            .collect();

        info!(
            round,
            agents = agents.len(),
            trades,
            leader = standings.first().map(|s| s.0.as_str()).unwrap_or("-"),
            "agent arena round"
        );
        Ok(CompetitionReport { round, agents: agents.len(), trades, standings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentsConfig, MarketConfig};
    use crate::core::agent::Personality;
    use crate::core::discovery;
    use crate::core::oracle::NoopOracle;
    use crate::data::SyntheticSource;

    #[tokio::test]
    async fn test_round_scores_every_agent() {
        let store = Arc::new(EvolutionStore::in_memory().unwrap());
        store
            .write(|r| {
                for p in discovery::literature_catalogue() {
                    r.insert_pattern_if_absent(&p)?;
                }
                for (i, personality) in Personality::all().into_iter().enumerate() {
                    r.insert_agent_if_absent(&Agent::founder(personality, i))?;
                }
                Ok(())
            })
            .unwrap();
        let source = Arc::new(SyntheticSource::new(8));
        let engine = Arc::new(DecisionEngine::new(
            store.clone(),
            source,
            Arc::new(NoopOracle),
            AgentsConfig::default(),
            MarketConfig::default(),
            8,
        ));
        let arena = AgentArena::new(store.clone(), engine, FitnessWeights::default(), 5);

        let report = arena.run_round().await.unwrap();
        assert_eq!(report.round, 1);
        assert_eq!(report.agents, 6);
        assert_eq!(report.trades, 30);
        assert_eq!(report.standings.len(), 6);
        assert!(report.standings.windows(2).all(|w| w[0].1 >= w[1].1));

        for a in store.read(|r| r.all_agents()).unwrap() {
            assert_eq!(a.total_trades, 5);
            assert!(a.fitness.is_finite());
        }
    }

    #[test]
    fn test_reference_fitness() {
        let inputs = FitnessInputs {
            win_rate: 0.6,
            avg_roi_per_trade: 0.02,
            total_trades: 200,
            sharpe_proxy: 1.2,
        };
        let f = fitness(&inputs, &FitnessWeights::default());
        assert!((f - 62.2).abs() < 1e-9);
    }

    #[test]
    fn test_experience_saturates() {
        assert_eq!(experience_term(0, 100), 0.0);
        assert_eq!(experience_term(50, 100), 0.5);
        assert_eq!(experience_term(500, 100), 1.0);
    }

    #[test]
    fn test_sharpe_zero_when_flat() {
        assert_eq!(sharpe_proxy(&[0.01, 0.01, 0.01]), 0.0);
        assert_eq!(sharpe_proxy(&[0.05]), 0.0);
        assert!(sharpe_proxy(&[0.01, 0.03]) > 0.0);
        assert!(sharpe_proxy(&[-0.01, -0.03]) < 0.0);
    }
}
