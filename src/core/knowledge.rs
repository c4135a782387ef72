//! Agent Knowledge
//!
//! Knowledge items are an agent's private, confidence-weighted beliefs about
//! patterns under a market-condition bucket. They are created by the agent's
//! own reflection or adopted from a teacher, and only the owning agent's
//! later trade outcomes move their counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Weight of the creation-time confidence in later estimates
const PRIOR_WEIGHT: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KnowledgeKind {
    /// Prefer (or shun) a pattern in a bucket
    PatternPreference,
    /// Two patterns that worked together
    CombinationRule,
    /// Stay cautious with a pattern in a bucket
    AvoidCondition,
}

impl KnowledgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeKind::PatternPreference => "pattern_preference",
            KnowledgeKind::CombinationRule => "combination_rule",
            KnowledgeKind::AvoidCondition => "avoid_condition",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pattern_preference" => Some(KnowledgeKind::PatternPreference),
            "combination_rule" => Some(KnowledgeKind::CombinationRule),
            "avoid_condition" => Some(KnowledgeKind::AvoidCondition),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: String,
    pub agent_id: String,
    pub kind: KnowledgeKind,
    pub pattern_id: Option<String>,
    pub condition_bucket: String,
    /// [-1, 1]; sign is the implied direction of the belief
    pub strength: f64,
    /// [0, 1]
    pub confidence: f64,
    /// Confidence the item started with
    pub base_confidence: f64,
    pub times_validated: i64,
    pub times_contradicted: i64,
    /// Free-form detail, e.g. the partner pattern of a combination rule
    pub detail: String,
    /// Teacher agent when adopted through the knowledge network
    pub adopted_from: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What one outcome did to one knowledge item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDelta {
    pub knowledge_id: String,
    pub kind: KnowledgeKind,
    pub pattern_id: Option<String>,
    pub created: bool,
    pub validated: bool,
    pub strength_before: f64,
    pub strength_after: f64,
    pub confidence_after: f64,
}

impl KnowledgeItem {
    pub fn new(
        agent_id: &str,
        kind: KnowledgeKind,
        pattern_id: Option<&str>,
        condition_bucket: &str,
        strength: f64,
        confidence: f64,
    ) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            kind,
            pattern_id: pattern_id.map(str::to_string),
            condition_bucket: condition_bucket.to_string(),
            strength: strength.clamp(-1.0, 1.0),
            confidence,
            base_confidence: confidence,
            times_validated: 0,
            times_contradicted: 0,
            detail: String::new(),
            adopted_from: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the item expects its pattern to help
    pub fn expects_help(&self) -> bool {
        match self.kind {
            KnowledgeKind::AvoidCondition => false,
            _ => self.strength >= 0.0,
        }
    }

    /// Fold one trade outcome into the item
    pub fn apply_outcome(&mut self, helped: bool, learning_rate: f64) -> KnowledgeDelta {
        let before = self.strength;
        let validated = self.expects_help() == helped;
        if validated {
            self.times_validated += 1;
        } else {
            self.times_contradicted += 1;
        }

        let push = if helped { learning_rate } else { -learning_rate };
        self.strength = match self.kind {
            // Avoidance only ever weakens or strengthens its caution
            KnowledgeKind::AvoidCondition => (self.strength + push).clamp(-1.0, 0.0),
            _ => (self.strength + push).clamp(-1.0, 1.0),
        };
        self.confidence = self.estimate_confidence();

        KnowledgeDelta {
            knowledge_id: self.id.clone(),
            kind: self.kind,
            pattern_id: self.pattern_id.clone(),
            created: false,
            validated,
            strength_before: before,
            strength_after: self.strength,
            confidence_after: self.confidence,
        }
    }

    /// Prior-blended validation rate
    pub fn estimate_confidence(&self) -> f64 {
        let v = self.times_validated as f64;
        let c = self.times_contradicted as f64;
        ((self.base_confidence * PRIOR_WEIGHT + v) / (PRIOR_WEIGHT + v + c)).clamp(0.0, 1.0)
    }

    /// Multiplier this item applies to a pattern's selection score
    pub fn selection_factor(&self) -> f64 {
        match self.kind {
            KnowledgeKind::PatternPreference => 1.0 + self.strength * self.confidence,
            KnowledgeKind::CombinationRule => 1.0 + 0.25 * self.strength.max(0.0) * self.confidence,
            KnowledgeKind::AvoidCondition => (1.0 - self.strength.abs() * self.confidence).max(0.1),
        }
    }

    /// Validation-to-contradiction ratio; infinite with no contradictions
    pub fn validation_ratio(&self) -> f64 {
        if self.times_contradicted == 0 {
            if self.times_validated > 0 { f64::INFINITY } else { 0.0 }
        } else {
            self.times_validated as f64 / self.times_contradicted as f64
        }
    }

    /// Copy for a student at discounted confidence with fresh counters
    pub fn adopted_copy(&self, student_id: &str, discount: f64) -> Self {
        let mut copy = KnowledgeItem::new(
            student_id,
            self.kind,
            self.pattern_id.as_deref(),
            &self.condition_bucket,
            self.strength,
            self.confidence * discount,
        );
        copy.detail = self.detail.clone();
        copy.adopted_from = Some(self.agent_id.clone());
        copy
    }

    pub fn created_delta(&self) -> KnowledgeDelta {
        KnowledgeDelta {
            knowledge_id: self.id.clone(),
            kind: self.kind,
            pattern_id: self.pattern_id.clone(),
            created: true,
            validated: false,
            strength_before: 0.0,
            strength_after: self.strength,
            confidence_after: self.confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preference(strength: f64) -> KnowledgeItem {
        KnowledgeItem::new("a1", KnowledgeKind::PatternPreference, Some("p1"), "b", strength, 0.5)
    }

    #[test]
    fn test_validated_when_outcome_matches() {
        let mut item = preference(0.2);
        let delta = item.apply_outcome(true, 0.1);
        assert!(delta.validated);
        assert_eq!(item.times_validated, 1);
        assert_eq!(item.times_contradicted, 0);
        assert!((item.strength - 0.3).abs() < 1e-12);
        // (0.5*2 + 1) / 3
        assert!((item.confidence - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_contradicted_when_outcome_differs() {
        let mut item = preference(0.2);
        let delta = item.apply_outcome(false, 0.1);
        assert!(!delta.validated);
        assert_eq!(item.times_contradicted, 1);
        assert!(item.confidence < 0.5);
    }

    #[test]
    fn test_negative_preference_validated_by_loss() {
        let mut item = preference(-0.3);
        assert!(!item.expects_help());
        assert!(item.apply_outcome(false, 0.1).validated);
    }

    #[test]
    fn test_avoid_stays_non_positive() {
        let mut item = KnowledgeItem::new("a1", KnowledgeKind::AvoidCondition, Some("p1"), "b", -0.05, 0.5);
        item.apply_outcome(true, 0.5);
        assert!(item.strength <= 0.0);
        assert_eq!(item.times_contradicted, 1);
    }

    #[test]
    fn test_adopted_copy_discounts_and_resets() {
        let mut teacher = preference(0.6);
        teacher.confidence = 0.75;
        teacher.times_validated = 9;
        teacher.times_contradicted = 1;
        let copy = teacher.adopted_copy("student", 0.8);
        assert!((copy.confidence - 0.6).abs() < 1e-12);
        assert_eq!(copy.times_validated, 0);
        assert_eq!(copy.times_contradicted, 0);
        assert_eq!(copy.agent_id, "student");
        assert_eq!(copy.adopted_from.as_deref(), Some("a1"));
        assert_ne!(copy.id, teacher.id);
        // Fresh estimate stays at the adopted prior
        assert!((copy.estimate_confidence() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_validation_ratio() {
        let mut item = preference(0.1);
        assert_eq!(item.validation_ratio(), 0.0);
        item.times_validated = 3;
        assert!(item.validation_ratio().is_infinite());
        item.times_contradicted = 2;
        assert!((item.validation_ratio() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_selection_factor() {
        let item = preference(0.5);
        assert!((item.selection_factor() - 1.25).abs() < 1e-12);
        let avoid = KnowledgeItem::new("a", KnowledgeKind::AvoidCondition, Some("p"), "b", -1.0, 1.0);
        assert!((avoid.selection_factor() - 0.1).abs() < 1e-12);
    }
}
