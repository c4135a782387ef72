//! Core evolution engine
//!
//! Two populations compete on historical market segments:
//!
//! - Patterns duel head-to-head in the arena; votes decide promotion and retirement
//! - Agents trade with the best patterns, learn from outcomes, and are scored by fitness
//! - Evolution removes the weakest agents and clones the strongest
//! - Survivors teach the students through the knowledge network

pub mod types;
pub mod indicators;
pub mod regime;
pub mod pattern;
pub mod discovery;
pub mod sampler;
pub mod arena;
pub mod agent;
pub mod knowledge;
pub mod oracle;
pub mod decision;
pub mod competition;
pub mod evolution;
pub mod network;
pub mod health;
pub mod scheduler;

// Re-export commonly used types
pub use agent::{Agent, AgentStatus, Genome, Personality};
pub use arena::{ArenaTickReport, MatchupRecord, PatternArena};
pub use competition::{AgentArena, CompetitionReport, FitnessWeights};
pub use decision::{DecisionEngine, DecisionRecord};
pub use evolution::{EvolutionController, EvolutionPass, LineageEdge};
pub use health::{HealthStatus, TickHealth, TickHealthSnapshot};
pub use knowledge::{KnowledgeItem, KnowledgeKind};
pub use network::{KnowledgeNetwork, NetworkReport, NetworkStats, SharingRecord, ValidationOutcome};
pub use oracle::{NoopOracle, OracleVerdict, PatternVote, ReasoningOracle};
pub use pattern::{LifecycleRules, Pattern, PatternOrigin, PatternStatus};
pub use regime::MarketCondition;
pub use sampler::{IngestReport, TradeSampler};
pub use scheduler::{Engine, Scheduler, TaskKind, TickOutcome};
pub use types::{Candle, Direction, Segment, Timeframe};
