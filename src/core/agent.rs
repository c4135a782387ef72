//! Trading Agents
//!
//! An agent is an independent decision-maker: a personality, a genome of
//! numeric preferences, lifetime trade counters and a fitness score that
//! the agent arena maintains. Agents are never deleted; eliminated agents
//! stay in the registry for lineage and audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::pattern::PatternOrigin;
use super::regime::{MarketCondition, Tier, Trend};
use super::types::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Personality {
    Conservative,
    Aggressive,
    Contrarian,
    Momentum,
    MeanReversion,
    Balanced,
}

impl Personality {
    pub fn all() -> [Personality; 6] {
        [
            Personality::Conservative,
            Personality::Aggressive,
            Personality::Contrarian,
            Personality::Momentum,
            Personality::MeanReversion,
            Personality::Balanced,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Personality::Conservative => "conservative",
            Personality::Aggressive => "aggressive",
            Personality::Contrarian => "contrarian",
            Personality::Momentum => "momentum",
            Personality::MeanReversion => "mean_reversion",
            Personality::Balanced => "balanced",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::all().into_iter().find(|p| p.as_str() == s)
    }

    /// Starting risk tolerance for founders
    pub fn default_risk_tolerance(&self) -> f64 {
        match self {
            Personality::Conservative => 0.2,
            Personality::Aggressive => 0.9,
            Personality::Contrarian => 0.5,
            Personality::Momentum => 0.7,
            Personality::MeanReversion => 0.4,
            Personality::Balanced => 0.5,
        }
    }

    /// Every other personality, used when a clone mutates
    pub fn others(&self) -> Vec<Personality> {
        Self::all().into_iter().filter(|p| p != self).collect()
    }

    /// Pattern-selection bias for a pattern of `direction` and `origin`
    /// under `condition`. 1.0 is neutral.
    pub fn bias(&self, condition: &MarketCondition, direction: Direction, origin: PatternOrigin) -> f64 {
        let with_trend = match (condition.trend, direction) {
            (Trend::Up, Direction::Long) | (Trend::Down, Direction::Short) => Some(true),
            (Trend::Up, Direction::Short) | (Trend::Down, Direction::Long) => Some(false),
            (Trend::Flat, _) => None,
        };

        match self {
            Personality::Conservative => {
                let vol = match condition.volatility {
                    Tier::High => 0.6,
                    Tier::Normal => 1.0,
                    Tier::Low => 1.2,
                };
                let origin = match origin {
                    PatternOrigin::LiteratureDerived => 1.2,
                    PatternOrigin::TechnicalRule => 1.1,
                    PatternOrigin::RandomDiscovery => 0.8,
                };
                vol * origin
            }
            Personality::Aggressive => {
                let vol = match condition.volatility {
                    Tier::High => 1.3,
                    Tier::Normal => 1.0,
                    Tier::Low => 0.9,
                };
                let origin = if origin == PatternOrigin::RandomDiscovery { 1.2 } else { 1.0 };
                vol * origin
            }
            Personality::Contrarian => match with_trend {
                Some(true) => 0.7,
                Some(false) => 1.4,
                None => 1.0,
            },
            Personality::Momentum => {
                let trend = match with_trend {
                    Some(true) => 1.4,
                    Some(false) => 0.6,
                    None => 0.9,
                };
                let volume = if condition.volume == Tier::High { 1.1 } else { 1.0 };
                trend * volume
            }
            Personality::MeanReversion => match (condition.trend, with_trend) {
                (Trend::Flat, _) => 1.3,
                (_, Some(false)) => 1.1,
                _ => 0.8,
            },
            Personality::Balanced => 1.0,
        }
    }
}

impl std::fmt::Display for Personality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    Active,
    Eliminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Eliminated => "eliminated",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AgentStatus::Active),
            "eliminated" => Some(AgentStatus::Eliminated),
            _ => None,
        }
    }
}

/// Numeric traits inherited (and perturbed) by clones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genome {
    /// Sizing appetite in [0.05, 1]
    pub risk_tolerance: f64,
    /// Per-pattern preference in [-1, 1]
    #[serde(default)]
    pub pattern_weights: BTreeMap<String, f64>,
}

impl Genome {
    pub fn for_personality(personality: Personality) -> Self {
        Self {
            risk_tolerance: personality.default_risk_tolerance(),
            pattern_weights: BTreeMap::new(),
        }
    }

    pub fn weight(&self, pattern_id: &str) -> f64 {
        self.pattern_weights.get(pattern_id).copied().unwrap_or(0.0)
    }

    /// How many patterns to combine, within [min_k, max_k]
    pub fn top_k(&self, min_k: usize, max_k: usize) -> usize {
        let span = max_k.saturating_sub(min_k) as f64;
        let k = min_k + (self.risk_tolerance.clamp(0.0, 1.0) * span).round() as usize;
        k.clamp(min_k, max_k.max(min_k))
    }

    /// Position size multiplier applied to simulated returns
    pub fn leverage(&self) -> f64 {
        0.5 + self.risk_tolerance
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub personality: Personality,
    /// 0 = founder
    pub generation: i64,
    pub fitness: f64,
    pub total_trades: i64,
    pub winning_trades: i64,
    pub avg_roi_per_trade: f64,
    pub status: AgentStatus,
    pub genome: Genome,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn founder(personality: Personality, index: usize) -> Self {
        Self {
            id: format!("founder-{}-{}", personality.as_str(), index),
            personality,
            generation: 0,
            fitness: 0.0,
            total_trades: 0,
            winning_trades: 0,
            avg_roi_per_trade: 0.0,
            status: AgentStatus::Active,
            genome: Genome::for_personality(personality),
            parent_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.winning_trades as f64 / self.total_trades as f64
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

/// Fitness descending, then generation ascending, then id for a total order
pub fn rank_agents(agents: &mut [Agent]) {
    agents.sort_by(|a, b| {
        b.fitness
            .partial_cmp(&a.fitness)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.generation.cmp(&b.generation))
            .then(a.id.cmp(&b.id))
    });
}
