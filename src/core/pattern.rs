//! Trading Patterns
//!
//! A pattern is a structured condition (all-of predicates over indicator
//! features) plus a direction and holding horizon. Its lifetime counters
//! are owned by the store; this module only defines the shape, how a
//! pattern is scored on a segment, and the status transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::indicators::{Feature, IndicatorSnapshot};
use super::types::{Direction, Segment};
use crate::error::{EngineError, EngineResult};

/// Where a pattern came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternOrigin {
    RandomDiscovery,
    LiteratureDerived,
    TechnicalRule,
}

impl PatternOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternOrigin::RandomDiscovery => "random_discovery",
            PatternOrigin::LiteratureDerived => "literature_derived",
            PatternOrigin::TechnicalRule => "technical_rule",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "random_discovery" => Some(PatternOrigin::RandomDiscovery),
            "literature_derived" => Some(PatternOrigin::LiteratureDerived),
            "technical_rule" => Some(PatternOrigin::TechnicalRule),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternStatus {
    Testing,
    Winning,
    /// Terminal; patterns are never deleted
    Retired,
}

impl PatternStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternStatus::Testing => "testing",
            PatternStatus::Winning => "winning",
            PatternStatus::Retired => "retired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "testing" => Some(PatternStatus::Testing),
            "winning" => Some(PatternStatus::Winning),
            "retired" => Some(PatternStatus::Retired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Above,
    Below,
}

/// One typed test over an indicator feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub feature: Feature,
    pub comparator: Comparator,
    pub threshold: f64,
}

impl Predicate {
    pub fn new(feature: Feature, comparator: Comparator, threshold: f64) -> Self {
        Self { feature, comparator, threshold }
    }

    pub fn holds(&self, snap: &IndicatorSnapshot) -> bool {
        let value = snap.value(self.feature);
        match self.comparator {
            Comparator::Above => value > self.threshold,
            Comparator::Below => value < self.threshold,
        }
    }

    pub fn describe(&self) -> String {
        let op = match self.comparator {
            Comparator::Above => ">",
            Comparator::Below => "<",
        };
        format!("{} {} {:.4}", self.feature.as_str(), op, self.threshold)
    }
}

/// Structured entry condition of a pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub predicates: Vec<Predicate>,
    pub direction: Direction,
    /// Bars held after entry
    pub horizon: usize,
}

impl Condition {
    pub fn holds(&self, snap: &IndicatorSnapshot) -> bool {
        snap.ready && !self.predicates.is_empty() && self.predicates.iter().all(|p| p.holds(snap))
    }

    /// 1.0 when the condition fires, otherwise half the satisfied fraction
    pub fn activation(&self, snap: &IndicatorSnapshot) -> f64 {
        if !snap.ready || self.predicates.is_empty() {
            return 0.0;
        }
        let satisfied = self.predicates.iter().filter(|p| p.holds(snap)).count();
        if satisfied == self.predicates.len() {
            1.0
        } else {
            0.5 * satisfied as f64 / self.predicates.len() as f64
        }
    }

    pub fn describe(&self) -> String {
        let preds: Vec<String> = self.predicates.iter().map(Predicate::describe).collect();
        format!(
            "{:?} when {} for {} bars",
            self.direction,
            preds.join(" && "),
            self.horizon
        )
    }
}

/// A simulated trade triggered by a pattern inside a segment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub entry_index: usize,
    /// Signed return in the pattern's direction
    pub signed_return: f64,
}

impl Episode {
    pub fn profitable(&self) -> bool {
        self.signed_return > 0.0
    }
}

/// Outcome of scoring a pattern over one segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub episodes: Vec<Episode>,
    /// Mean signed return in percent; 0 when nothing triggered
    pub raw_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub name: String,
    pub condition: Condition,
    pub origin: PatternOrigin,
    pub runs: i64,
    pub wins: i64,
    pub losses: i64,
    pub votes: i64,
    pub sample_size: i64,
    /// Recency-weighted fraction of profitable outcomes
    pub win_rate: f64,
    pub status: PatternStatus,
    pub created_at: DateTime<Utc>,
}

impl Pattern {
    pub fn new(name: &str, condition: Condition, origin: PatternOrigin) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            condition,
            origin,
            runs: 0,
            wins: 0,
            losses: 0,
            votes: 0,
            sample_size: 0,
            win_rate: 0.5,
            status: PatternStatus::Testing,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status != PatternStatus::Retired
    }

    /// Replay the condition over a segment
    pub fn evaluate(&self, segment: &Segment) -> EngineResult<Evaluation> {
        let horizon = self.condition.horizon.max(1);
        let needed = super::indicators::WARMUP_BARS + horizon + 1;
        if segment.len() < needed {
            return Err(EngineError::InsufficientData {
                pattern_id: self.id.clone(),
                bars: segment.len(),
            });
        }

        let sign = self.condition.direction.sign();
        let mut episodes = Vec::new();
        let mut i = super::indicators::WARMUP_BARS - 1;
        while i + horizon < segment.len() {
            if self.condition.holds(&segment.indicators[i]) {
                if let Some(ret) = segment.forward_return(i, i + horizon) {
                    episodes.push(Episode { entry_index: i, signed_return: sign * ret });
                }
                // One open trade at a time
                i += horizon;
            } else {
                i += 1;
            }
        }

        let raw_score = if episodes.is_empty() {
            0.0
        } else {
            100.0 * episodes.iter().map(|e| e.signed_return).sum::<f64>() / episodes.len() as f64
        };
        Ok(Evaluation { episodes, raw_score })
    }
}

/// Thresholds governing status transitions
#[derive(Debug, Clone, Copy)]
pub struct LifecycleRules {
    pub min_runs_before_retire: i64,
    pub retire_vote_floor: i64,
    pub promote_vote_threshold: i64,
}

impl LifecycleRules {
    /// Status a pattern should hold given its counters. Retired never reverts.
    pub fn next_status(&self, current: PatternStatus, runs: i64, votes: i64) -> PatternStatus {
        if current == PatternStatus::Retired {
            return PatternStatus::Retired;
        }
        if runs >= self.min_runs_before_retire && votes < self.retire_vote_floor {
            return PatternStatus::Retired;
        }
        if votes >= self.promote_vote_threshold && runs >= self.min_runs_before_retire / 2 {
            PatternStatus::Winning
        } else {
            PatternStatus::Testing
        }
    }
}
