//! Reasoning Oracle
//!
//! Optional collaborator that turns the selected patterns into one signal
//! with an explanation. When it fails (or is the no-op), the decision
//! engine uses `weighted_average`, which is deterministic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::regime::MarketCondition;
use super::types::Direction;
use crate::error::{EngineError, EngineResult};

/// One selected pattern as presented for combination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternVote {
    pub pattern_id: String,
    pub direction: Direction,
    /// Selection score; the averaging weight
    pub weight: f64,
    /// How strongly the pattern's condition holds now, [0, 1]
    pub activation: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleVerdict {
    /// [-1, 1]; sign is the trade direction
    pub signal: f64,
    /// [0, 1]
    pub confidence: f64,
    pub explanation: String,
}

#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    async fn combine(&self, votes: &[PatternVote], condition: &MarketCondition) -> EngineResult<OracleVerdict>;
}

/// Always unavailable, so every decision takes the deterministic path
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopOracle;

#[async_trait]
impl ReasoningOracle for NoopOracle {
    async fn combine(&self, _votes: &[PatternVote], _condition: &MarketCondition) -> EngineResult<OracleVerdict> {
        Err(EngineError::OracleUnavailable("no oracle configured".to_string()))
    }
}

/// Weighted average of direction x activation; confidence is the signal
/// magnitude scaled by mean win rate
pub fn weighted_average(votes: &[PatternVote], condition: &MarketCondition) -> OracleVerdict {
    let total_weight: f64 = votes.iter().map(|v| v.weight.max(0.0)).sum();
    if votes.is_empty() || total_weight <= 0.0 {
        return OracleVerdict {
            signal: 0.0,
            confidence: 0.0,
            explanation: format!("no usable patterns under {}", condition),
        };
    }

    let signal = votes
        .iter()
        .map(|v| v.weight.max(0.0) * v.direction.sign() * v.activation)
        .sum::<f64>()
        / total_weight;
    let mean_win_rate = votes.iter().map(|v| v.win_rate).sum::<f64>() / votes.len() as f64;
    let confidence = (signal.abs() * mean_win_rate).clamp(0.0, 1.0);

    let parts: Vec<String> = votes
        .iter()
        .map(|v| format!("{}:{:?}@{:.2}", short_id(&v.pattern_id), v.direction, v.activation))
        .collect();
    OracleVerdict {
        signal: signal.clamp(-1.0, 1.0),
        confidence,
        explanation: format!("weighted average of [{}] under {}", parts.join(", "), condition),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
