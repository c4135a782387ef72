//! Knowledge Network
//!
//! Runs once per evolution cycle, on the post-pass registry:
//! 1. Validate adoptions old enough to judge (student fitness now vs. at
//!    adoption), writing each outcome exactly once
//! 2. Teachers (top fraction by fitness) offer their proven items to
//!    students (bottom fraction); a student that already holds knowledge
//!    about the pattern declines, and the offer is recorded unadopted
//! 3. Snapshot population-level learning metrics
//!
//! The metrics row doubles as the ledger: a cycle without one still owes
//! its network pass, so a failed pass is picked up by the next tick.
//!
//! Adopted items start at a discounted confidence with zeroed counters;
//! the student has to re-earn them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::agent::Agent;
use super::knowledge::KnowledgeItem;
use crate::config::KnowledgeConfig;
use crate::data::{EvolutionStore, Records};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationOutcome {
    Pending,
    Helped,
    Hurt,
    Neutral,
}

impl ValidationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationOutcome::Pending => "pending",
            ValidationOutcome::Helped => "helped",
            ValidationOutcome::Hurt => "hurt",
            ValidationOutcome::Neutral => "neutral",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ValidationOutcome::Pending),
            "helped" => Some(ValidationOutcome::Helped),
            "hurt" => Some(ValidationOutcome::Hurt),
            "neutral" => Some(ValidationOutcome::Neutral),
            _ => None,
        }
    }

    /// Terminal outcome for a fitness change since adoption
    pub fn classify(fitness_delta: f64, threshold: f64) -> Self {
        if fitness_delta > threshold {
            ValidationOutcome::Helped
        } else if fitness_delta < -threshold {
            ValidationOutcome::Hurt
        } else {
            ValidationOutcome::Neutral
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharingRecord {
    pub id: i64,
    pub teacher_id: String,
    pub student_id: String,
    pub teacher_knowledge_id: String,
    pub student_knowledge_id: Option<String>,
    /// Teacher's item as it was when shared
    pub snapshot: KnowledgeItem,
    pub created_cycle: i64,
    pub created_at: DateTime<Utc>,
    pub adopted: bool,
    pub student_fitness_at_adoption: f64,
    pub outcome: ValidationOutcome,
    pub fitness_delta: Option<f64>,
    pub validated_cycle: Option<i64>,
    pub validated_at: Option<DateTime<Utc>>,
}

/// Population-level learning snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub cycle: i64,
    pub active_agents: i64,
    pub avg_fitness: f64,
    pub top_fitness: f64,
    pub total_knowledge: i64,
    pub successful_adoptions: i64,
    pub failed_adoptions: i64,
    pub neutral_adoptions: i64,
    pub pending_adoptions: i64,
    pub created_at: DateTime<Utc>,
}

impl NetworkStats {
    /// Helped share of judged adoptions
    pub fn adoption_success_rate(&self) -> f64 {
        let judged = self.successful_adoptions + self.failed_adoptions + self.neutral_adoptions;
        if judged == 0 {
            0.0
        } else {
            self.successful_adoptions as f64 / judged as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkReport {
    pub cycle: i64,
    pub shared: usize,
    pub adopted: usize,
    pub validated: Vec<(i64, ValidationOutcome)>,
    pub stats: Option<NetworkStats>,
}

/// Teachers best first, students worst last; never overlapping
pub fn partition(ranked: &[Agent], config: &KnowledgeConfig) -> (Vec<String>, Vec<String>) {
    let n = ranked.len();
    if n < 2 {
        return (Vec::new(), Vec::new());
    }
    let teachers = ((n as f64 * config.teacher_fraction.clamp(0.0, 1.0)).floor() as usize).clamp(1, n);
    let students = (n as f64 * config.student_fraction.clamp(0.0, 1.0)).floor() as usize;
    let teacher_ids: Vec<String> = ranked[..teachers].iter().map(|a| a.id.clone()).collect();
    let student_ids = ranked[n - students.min(n)..]
        .iter()
        .filter(|a| !teacher_ids.contains(&a.id))
        .map(|a| a.id.clone())
        .collect();
    (teacher_ids, student_ids)
}

/// Items a teacher may share, best first
pub fn shareable(items: &[KnowledgeItem], config: &KnowledgeConfig) -> Vec<KnowledgeItem> {
    let mut eligible: Vec<KnowledgeItem> = items
        .iter()
        .filter(|k| {
            k.pattern_id.is_some()
                && k.confidence >= config.min_confidence
                && k.times_validated >= config.min_validations
                && k.validation_ratio() > config.min_ratio
        })
        .cloned()
        .collect();
    eligible.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.times_validated.cmp(&a.times_validated))
            .then_with(|| a.id.cmp(&b.id))
    });
    eligible.truncate(config.max_items_per_teacher);
    eligible
}

/// Judge every adoption at least `validation_delay_rounds` old
pub fn validate_pending(r: &Records<'_>, cycle: i64, config: &KnowledgeConfig) -> EngineResult<Vec<(i64, ValidationOutcome)>> {
    let mut judged = Vec::new();
    for rec in r.pending_sharing(cycle - config.validation_delay_rounds)? {
        let Some(student) = r.get_agent(&rec.student_id)? else {
            warn!(sharing = rec.id, student = %rec.student_id, "student missing, validation skipped");
            continue;
        };
        let delta = student.fitness - rec.student_fitness_at_adoption;
        let outcome = ValidationOutcome::classify(delta, config.outcome_threshold);
        match r.validate_sharing(rec.id, outcome, delta, cycle) {
            Ok(()) => {
                debug!(sharing = rec.id, student = %rec.student_id, delta, outcome = outcome.as_str(), "adoption validated");
                judged.push((rec.id, outcome));
            }
            Err(e @ EngineError::InvariantViolation { .. }) => {
                warn!(sharing = rec.id, cause = %e, "validation skipped");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(judged)
}

/// Offer proven items from teachers to students; returns (shared, adopted)
pub fn share(r: &Records<'_>, cycle: i64, config: &KnowledgeConfig) -> EngineResult<(usize, usize)> {
    let ranked = r.active_agents()?;
    let (teachers, students) = partition(&ranked, config);
    let fitness_of = |id: &str| ranked.iter().find(|a| a.id == id).map(|a| a.fitness).unwrap_or(0.0);
    let (mut shared, mut adopted) = (0, 0);

    for teacher in &teachers {
        let items = shareable(&r.knowledge_for_agent(teacher)?, config);
        for item in &items {
            let Some(pattern_id) = item.pattern_id.as_deref() else {
                continue;
            };
            for student in &students {
                let copy = item.adopted_copy(student, config.confidence_discount);
                let inserted = !r.agent_has_pattern_knowledge(student, pattern_id)?
                    && r.insert_knowledge_if_absent(&copy)?;
                r.insert_sharing(&SharingRecord {
                    id: 0,
                    teacher_id: teacher.clone(),
                    student_id: student.clone(),
                    teacher_knowledge_id: item.id.clone(),
                    student_knowledge_id: inserted.then(|| copy.id.clone()),
                    snapshot: item.clone(),
                    created_cycle: cycle,
                    created_at: Utc::now(),
                    adopted: inserted,
                    student_fitness_at_adoption: fitness_of(student),
                    outcome: ValidationOutcome::Pending,
                    fitness_delta: None,
                    validated_cycle: None,
                    validated_at: None,
                })?;
                shared += 1;
                if inserted {
                    adopted += 1;
                    debug!(teacher = %teacher, student = %student, pattern = pattern_id, confidence = copy.confidence, "knowledge adopted");
                } else {
                    debug!(teacher = %teacher, student = %student, pattern = pattern_id, "student already informed, offer declined");
                }
            }
        }
    }
    Ok((shared, adopted))
}

pub fn collect_stats(r: &Records<'_>, cycle: i64) -> EngineResult<NetworkStats> {
    let agents = r.active_agents()?;
    let n = agents.len();
    let avg_fitness = if n == 0 { 0.0 } else { agents.iter().map(|a| a.fitness).sum::<f64>() / n as f64 };
    let top_fitness = agents.first().map(|a| a.fitness).unwrap_or(0.0);

    let mut stats = NetworkStats {
        cycle,
        active_agents: n as i64,
        avg_fitness,
        top_fitness,
        total_knowledge: r.count_knowledge()?,
        successful_adoptions: 0,
        failed_adoptions: 0,
        neutral_adoptions: 0,
        pending_adoptions: 0,
        created_at: Utc::now(),
    };
    for (outcome, count) in r.sharing_outcome_counts()? {
        match outcome {
            ValidationOutcome::Helped => stats.successful_adoptions = count,
            ValidationOutcome::Hurt => stats.failed_adoptions = count,
            ValidationOutcome::Neutral => stats.neutral_adoptions = count,
            ValidationOutcome::Pending => stats.pending_adoptions = count,
        }
    }
    Ok(stats)
}

/// Validate, share and snapshot for `cycle` inside the caller's transaction
pub fn run_cycle(r: &Records<'_>, cycle: i64, config: &KnowledgeConfig) -> EngineResult<NetworkReport> {
    let validated = validate_pending(r, cycle, config)?;
    let (shared, adopted) = share(r, cycle, config)?;
    let stats = collect_stats(r, cycle)?;
    r.append_network_metrics(&stats)?;
    Ok(NetworkReport { cycle, shared, adopted, validated, stats: Some(stats) })
}

pub struct KnowledgeNetwork {
    store: Arc<EvolutionStore>,
    config: KnowledgeConfig,
}

impl KnowledgeNetwork {
    pub fn new(store: Arc<EvolutionStore>, config: KnowledgeConfig) -> Self {
        Self { store, config }
    }

    /// Network pass for the latest evolution cycle, unless that cycle
    /// already has one. None when nothing is owed.
    pub async fn run(&self) -> EngineResult<Option<NetworkReport>> {
        let config = self.config.clone();
        let report = self
            .store
            .write_async(|r| {
                let Some(cycle) = r.last_evolution_cycle()? else {
                    return Ok(None);
                };
                if r.network_metrics_exist(cycle)? {
                    return Ok(None);
                }
                run_cycle(r, cycle, &config).map(Some)
            })
            .await?;

        let Some(report) = report else {
            debug!("no network pass owed");
            return Ok(None);
        };
        if let Some(stats) = &report.stats {
            info!(
                cycle = report.cycle,
                shared = report.shared,
                adopted = report.adopted,
                validated = report.validated.len(),
                active = stats.active_agents,
                avg_fitness = stats.avg_fitness,
                top_fitness = stats.top_fitness,
                success_rate = stats.adoption_success_rate(),
                "knowledge network pass"
            );
        }
        Ok(Some(report))
    }
}
