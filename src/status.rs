//! Status file for sharing state between processes
//!
//! The daemon rewrites the snapshot after ticks; `colosseum status` reads it
//! back, or rebuilds one straight from the store when no daemon is running.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::{Agent, HealthStatus, LineageEdge, NetworkStats, SharingRecord, TickHealthSnapshot};
use crate::data::EvolutionStore;
use crate::error::EngineResult;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternSummary {
    pub id: String,
    pub name: String,
    pub votes: i64,
    pub runs: i64,
    pub win_rate: f64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSummary {
    pub id: String,
    pub personality: String,
    pub generation: i64,
    pub fitness: f64,
    pub total_trades: i64,
    pub win_rate: f64,
}

impl From<&Agent> for AgentSummary {
    fn from(a: &Agent) -> Self {
        Self {
            id: a.id.clone(),
            personality: a.personality.as_str().to_string(),
            generation: a.generation,
            fitness: a.fitness,
            total_trades: a.total_trades,
            win_rate: a.win_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemStatus {
    pub running: bool,
    pub updated_at: i64,
    pub testing_patterns: i64,
    pub winning_patterns: i64,
    pub retired_patterns: i64,
    pub top_patterns: Vec<PatternSummary>,
    pub active_agents: i64,
    pub eliminated_agents: i64,
    pub max_generation: i64,
    pub avg_fitness: f64,
    pub top_fitness: f64,
    pub leaders: Vec<AgentSummary>,
    pub knowledge_items: i64,
    pub decisions: i64,
    /// (outcome, count) over adopted transfers
    pub sharing: Vec<(String, i64)>,
    pub pattern_rounds: i64,
    pub agent_rounds: i64,
    pub ingest_rounds: i64,
    pub network: Option<NetworkStats>,
    pub health: Vec<TickHealthSnapshot>,
}

impl SystemStatus {
    /// Snapshot of the store; `health` comes from the caller's scheduler
    pub fn collect(store: &EvolutionStore, health: Vec<TickHealthSnapshot>) -> EngineResult<Self> {
        store.read(|r| {
            let mut status = SystemStatus {
                running: !health.is_empty(),
                updated_at: chrono::Utc::now().timestamp(),
                health: health.clone(),
                ..Default::default()
            };
            for (s, n) in r.pattern_status_counts()? {
                match s {
                    crate::core::PatternStatus::Testing => status.testing_patterns = n,
                    crate::core::PatternStatus::Winning => status.winning_patterns = n,
                    crate::core::PatternStatus::Retired => status.retired_patterns = n,
                }
            }
            status.top_patterns = r
                .top_patterns(10)?
                .into_iter()
                .map(|p| PatternSummary {
                    id: p.id,
                    name: p.name,
                    votes: p.votes,
                    runs: p.runs,
                    win_rate: p.win_rate,
                    status: p.status.as_str().to_string(),
                })
                .collect();

            let active = r.active_agents()?;
            status.active_agents = active.len() as i64;
            status.eliminated_agents = r.count_agents(crate::core::AgentStatus::Eliminated)?;
            status.max_generation = r.max_generation()?;
            if !active.is_empty() {
                status.avg_fitness = active.iter().map(|a| a.fitness).sum::<f64>() / active.len() as f64;
            }
            status.top_fitness = active.first().map(|a| a.fitness).unwrap_or(0.0);
            status.leaders = active.iter().take(5).map(AgentSummary::from).collect();

            status.knowledge_items = r.count_knowledge()?;
            status.decisions = r.count_decisions()?;
            status.sharing = r
                .sharing_outcome_counts()?
                .into_iter()
                .map(|(o, n)| (o.as_str().to_string(), n))
                .collect();
            status.pattern_rounds = r.counter("pattern_rounds")?;
            status.agent_rounds = r.counter("agent_rounds")?;
            status.ingest_rounds = r.counter("ingest_rounds")?;
            status.network = r.latest_network_metrics()?;
            Ok(status)
        })
    }

    /// Task kinds currently failing
    pub fn failing_tasks(&self) -> Vec<&str> {
        self.health
            .iter()
            .filter(|h| matches!(h.status, HealthStatus::Failing { .. }))
            .map(|h| h.kind.as_str())
            .collect()
    }

    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            if let Ok(contents) = fs::read_to_string(path) {
                if let Ok(status) = serde_json::from_str(&contents) {
                    return status;
                }
            }
        }
        Self::default()
    }
}

/// Lineage and sharing history, exported for offline analysis
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditExport {
    pub exported_at: i64,
    pub lineage: Vec<LineageEdge>,
    pub sharing: Vec<SharingRecord>,
}

impl AuditExport {
    pub fn collect(store: &EvolutionStore) -> EngineResult<Self> {
        store.read(|r| {
            Ok(AuditExport {
                exported_at: chrono::Utc::now().timestamp(),
                lineage: r.all_lineage()?,
                sharing: r.all_sharing()?,
            })
        })
    }

    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        fs::write(path, serde_json::to_string_pretty(self)?)
    }
}
