//! Configuration loader
//!
//! Every section is optional; a missing key takes its default, so an empty
//! file is a valid configuration. Fitness weights and the personality
//! mutation rate live here rather than in code.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::core::competition::FitnessWeights;
use crate::core::pattern::LifecycleRules;
use crate::core::scheduler::TaskKind;
use crate::data::RetryPolicy;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub arena: ArenaConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub fitness: FitnessConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_status_file")]
    pub status_file: String,
    /// Root seed for every random draw in the engine
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_name() -> String {
    "colosseum".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database() -> String {
    "colosseum.db".to_string()
}

fn default_status_file() -> String {
    "colosseum_status.json".to_string()
}

fn default_seed() -> u64 {
    42
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            database: default_database(),
            status_file: default_status_file(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    /// Directory of `<SYMBOL>.csv` files; synthetic prices when unset
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Bars per arena / sampler segment
    #[serde(default = "default_segment_bars")]
    pub segment_bars: usize,
}

fn default_symbols() -> Vec<String> {
    vec!["EURUSD".to_string(), "BTCUSD".to_string(), "SPY".to_string()]
}

fn default_segment_bars() -> usize {
    200
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            data_dir: None,
            segment_bars: default_segment_bars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LibraryConfig {
    /// Active patterns the ingestion tick tops the library up to
    #[serde(default = "default_target_size")]
    pub target_size: usize,
    #[serde(default = "default_min_runs_before_retire")]
    pub min_runs_before_retire: i64,
    #[serde(default = "default_retire_vote_floor")]
    pub retire_vote_floor: i64,
    #[serde(default = "default_promote_vote_threshold")]
    pub promote_vote_threshold: i64,
}

fn default_target_size() -> usize {
    40
}

fn default_min_runs_before_retire() -> i64 {
    20
}

fn default_retire_vote_floor() -> i64 {
    -5
}

fn default_promote_vote_threshold() -> i64 {
    5
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            target_size: default_target_size(),
            min_runs_before_retire: default_min_runs_before_retire(),
            retire_vote_floor: default_retire_vote_floor(),
            promote_vote_threshold: default_promote_vote_threshold(),
        }
    }
}

impl LibraryConfig {
    pub fn lifecycle_rules(&self) -> LifecycleRules {
        LifecycleRules {
            min_runs_before_retire: self.min_runs_before_retire,
            retire_vote_floor: self.retire_vote_floor,
            promote_vote_threshold: self.promote_vote_threshold,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArenaConfig {
    #[serde(default = "default_matchups_per_tick")]
    pub matchups_per_tick: usize,
    /// Draws allowed per matchup before giving up on the slot
    #[serde(default = "default_max_redraws")]
    pub max_redraws: usize,
}

fn default_matchups_per_tick() -> usize {
    10
}

fn default_max_redraws() -> usize {
    5
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            matchups_per_tick: default_matchups_per_tick(),
            max_redraws: default_max_redraws(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_founders_per_personality")]
    pub founders_per_personality: usize,
    #[serde(default = "default_top_k_min")]
    pub top_k_min: usize,
    #[serde(default = "default_top_k_max")]
    pub top_k_max: usize,
    /// Chance per slot of picking a random non-top pattern
    #[serde(default = "default_explore_rate")]
    pub explore_rate: f64,
    /// Bars observed before a decision
    #[serde(default = "default_lookback_bars")]
    pub lookback_bars: usize,
    /// Bars a simulated trade is held
    #[serde(default = "default_horizon_bars")]
    pub horizon_bars: usize,
    /// Step applied to knowledge strength per outcome
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

fn default_founders_per_personality() -> usize {
    2
}

fn default_top_k_min() -> usize {
    2
}

fn default_top_k_max() -> usize {
    4
}

fn default_explore_rate() -> f64 {
    0.1
}

fn default_lookback_bars() -> usize {
    60
}

fn default_horizon_bars() -> usize {
    10
}

fn default_learning_rate() -> f64 {
    0.1
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            founders_per_personality: default_founders_per_personality(),
            top_k_min: default_top_k_min(),
            top_k_max: default_top_k_max(),
            explore_rate: default_explore_rate(),
            lookback_bars: default_lookback_bars(),
            horizon_bars: default_horizon_bars(),
            learning_rate: default_learning_rate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FitnessConfig {
    #[serde(default = "default_win_rate_weight")]
    pub win_rate_weight: f64,
    #[serde(default = "default_roi_weight")]
    pub roi_weight: f64,
    #[serde(default = "default_experience_weight")]
    pub experience_weight: f64,
    #[serde(default = "default_sharpe_weight")]
    pub sharpe_weight: f64,
    /// Trades at which the experience term saturates
    #[serde(default = "default_experience_threshold")]
    pub experience_threshold: i64,
    /// Trades per agent per competition round
    #[serde(default = "default_batch_trades")]
    pub batch_trades: usize,
}

fn default_win_rate_weight() -> f64 {
    50.0
}

fn default_roi_weight() -> f64 {
    10.0
}

fn default_experience_weight() -> f64 {
    20.0
}

fn default_sharpe_weight() -> f64 {
    10.0
}

fn default_experience_threshold() -> i64 {
    100
}

fn default_batch_trades() -> usize {
    5
}

impl Default for FitnessConfig {
    fn default() -> Self {
        Self {
            win_rate_weight: default_win_rate_weight(),
            roi_weight: default_roi_weight(),
            experience_weight: default_experience_weight(),
            sharpe_weight: default_sharpe_weight(),
            experience_threshold: default_experience_threshold(),
            batch_trades: default_batch_trades(),
        }
    }
}

impl FitnessConfig {
    pub fn weights(&self) -> FitnessWeights {
        FitnessWeights {
            win_rate: self.win_rate_weight,
            roi: self.roi_weight,
            experience: self.experience_weight,
            sharpe: self.sharpe_weight,
            experience_threshold: self.experience_threshold,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvolutionConfig {
    /// Agent-arena rounds between passes
    #[serde(default = "default_every_rounds")]
    pub every_rounds: i64,
    #[serde(default = "default_eliminate_fraction")]
    pub eliminate_fraction: f64,
    #[serde(default = "default_clone_fraction")]
    pub clone_fraction: f64,
    #[serde(default = "default_min_population")]
    pub min_population: usize,
    #[serde(default = "default_personality_mutation_rate")]
    pub personality_mutation_rate: f64,
    /// Stddev of the Gaussian nudge on numeric genome weights
    #[serde(default = "default_weight_sigma")]
    pub weight_sigma: f64,
}

fn default_every_rounds() -> i64 {
    50
}

fn default_eliminate_fraction() -> f64 {
    0.2
}

fn default_clone_fraction() -> f64 {
    0.2
}

fn default_min_population() -> usize {
    6
}

fn default_personality_mutation_rate() -> f64 {
    0.3
}

fn default_weight_sigma() -> f64 {
    0.05
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            every_rounds: default_every_rounds(),
            eliminate_fraction: default_eliminate_fraction(),
            clone_fraction: default_clone_fraction(),
            min_population: default_min_population(),
            personality_mutation_rate: default_personality_mutation_rate(),
            weight_sigma: default_weight_sigma(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default = "default_teacher_fraction")]
    pub teacher_fraction: f64,
    #[serde(default = "default_student_fraction")]
    pub student_fraction: f64,
    #[serde(default = "default_max_items_per_teacher")]
    pub max_items_per_teacher: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_min_validations")]
    pub min_validations: i64,
    #[serde(default = "default_min_ratio")]
    pub min_ratio: f64,
    #[serde(default = "default_confidence_discount")]
    pub confidence_discount: f64,
    /// Agent-arena rounds before an adoption is judged
    #[serde(default = "default_validation_delay_rounds")]
    pub validation_delay_rounds: i64,
    #[serde(default = "default_outcome_threshold")]
    pub outcome_threshold: f64,
}

fn default_teacher_fraction() -> f64 {
    0.2
}

fn default_student_fraction() -> f64 {
    0.5
}

fn default_max_items_per_teacher() -> usize {
    5
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_min_validations() -> i64 {
    3
}

fn default_min_ratio() -> f64 {
    2.0
}

fn default_confidence_discount() -> f64 {
    0.8
}

fn default_validation_delay_rounds() -> i64 {
    25
}

fn default_outcome_threshold() -> f64 {
    0.1
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            teacher_fraction: default_teacher_fraction(),
            student_fraction: default_student_fraction(),
            max_items_per_teacher: default_max_items_per_teacher(),
            min_confidence: default_min_confidence(),
            min_validations: default_min_validations(),
            min_ratio: default_min_ratio(),
            confidence_discount: default_confidence_discount(),
            validation_delay_rounds: default_validation_delay_rounds(),
            outcome_threshold: default_outcome_threshold(),
        }
    }
}

/// Interval and time budget of one task kind
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TaskTiming {
    pub interval_secs: u64,
    pub budget_secs: u64,
}

impl TaskTiming {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_ingest")]
    pub ingest: TaskTiming,
    #[serde(default = "default_pattern_arena")]
    pub pattern_arena: TaskTiming,
    #[serde(default = "default_decisions")]
    pub decisions: TaskTiming,
    #[serde(default = "default_agent_arena")]
    pub agent_arena: TaskTiming,
    #[serde(default = "default_evolution")]
    pub evolution: TaskTiming,
    /// A lease outlives its holder by at most this long
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

fn default_ingest() -> TaskTiming {
    TaskTiming { interval_secs: 5, budget_secs: 30 }
}

fn default_pattern_arena() -> TaskTiming {
    TaskTiming { interval_secs: 15, budget_secs: 30 }
}

fn default_decisions() -> TaskTiming {
    TaskTiming { interval_secs: 60, budget_secs: 60 }
}

fn default_agent_arena() -> TaskTiming {
    TaskTiming { interval_secs: 300, budget_secs: 120 }
}

fn default_evolution() -> TaskTiming {
    TaskTiming { interval_secs: 900, budget_secs: 300 }
}

fn default_lease_ttl_secs() -> u64 {
    600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ingest: default_ingest(),
            pattern_arena: default_pattern_arena(),
            decisions: default_decisions(),
            agent_arena: default_agent_arena(),
            evolution: default_evolution(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn timing(&self, kind: TaskKind) -> TaskTiming {
        match kind {
            TaskKind::Ingest => self.ingest,
            TaskKind::PatternArena => self.pattern_arena,
            TaskKind::Decisions => self.decisions,
            TaskKind::AgentArena => self.agent_arena,
            TaskKind::Evolution => self.evolution,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    25
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl StoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
        let config: Config = toml::from_str(&contents).with_context(|| format!("parsing {}", path))?;
        config.validate().with_context(|| format!("validating {}", path))?;
        Ok(config)
    }

    /// Reject values the engine cannot act on
    pub fn validate(&self) -> Result<()> {
        let fractions = [
            ("agents.explore_rate", self.agents.explore_rate),
            ("evolution.eliminate_fraction", self.evolution.eliminate_fraction),
            ("evolution.clone_fraction", self.evolution.clone_fraction),
            ("evolution.personality_mutation_rate", self.evolution.personality_mutation_rate),
            ("knowledge.teacher_fraction", self.knowledge.teacher_fraction),
            ("knowledge.student_fraction", self.knowledge.student_fraction),
            ("knowledge.confidence_discount", self.knowledge.confidence_discount),
        ];
        for (key, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                bail!("{} must be within [0, 1], got {}", key, value);
            }
        }
        if self.agents.top_k_min > self.agents.top_k_max {
            bail!(
                "agents.top_k_min ({}) exceeds agents.top_k_max ({})",
                self.agents.top_k_min,
                self.agents.top_k_max
            );
        }
        Ok(())
    }
}
