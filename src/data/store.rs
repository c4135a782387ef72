//! Evolution Store - SQLite-backed durable state
//!
//! The pattern library and the agent registry are the only shared mutable
//! state in the engine. Every component reads and writes them through this
//! store:
//! - One table per entity (patterns, agents, knowledge, decisions, lineage, sharing)
//! - Audit tables (matchups, evolution passes, network metrics)
//! - Round clocks (counters) and single-flight leases (task_leases)
//!
//! Each unit of work runs in one `BEGIN IMMEDIATE` transaction, so a
//! matchup, decision or evolution pass is committed whole or not at all.

use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::records::Records;
use crate::error::{EngineError, EngineResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    condition TEXT NOT NULL,
    origin TEXT NOT NULL,
    runs INTEGER NOT NULL DEFAULT 0,
    wins INTEGER NOT NULL DEFAULT 0,
    losses INTEGER NOT NULL DEFAULT 0,
    votes INTEGER NOT NULL DEFAULT 0,
    sample_size INTEGER NOT NULL DEFAULT 0,
    win_rate REAL NOT NULL DEFAULT 0.5,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_patterns_status ON patterns(status);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    personality TEXT NOT NULL,
    generation INTEGER NOT NULL,
    fitness REAL NOT NULL DEFAULT 0,
    total_trades INTEGER NOT NULL DEFAULT 0,
    winning_trades INTEGER NOT NULL DEFAULT 0,
    avg_roi_per_trade REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    genome TEXT NOT NULL,
    parent_id TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agents_status_fitness ON agents(status, fitness DESC);

CREATE TABLE IF NOT EXISTS knowledge (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    pattern_id TEXT,
    condition_bucket TEXT NOT NULL,
    strength REAL NOT NULL,
    confidence REAL NOT NULL,
    base_confidence REAL NOT NULL,
    times_validated INTEGER NOT NULL DEFAULT 0,
    times_contradicted INTEGER NOT NULL DEFAULT 0,
    detail TEXT NOT NULL DEFAULT '',
    adopted_from TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(agent_id, kind, pattern_id, condition_bucket)
);
CREATE INDEX IF NOT EXISTS idx_knowledge_agent_pattern ON knowledge(agent_id, pattern_id);

CREATE TABLE IF NOT EXISTS decisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL,
    round INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    condition_bucket TEXT NOT NULL,
    pattern_ids TEXT NOT NULL,
    signal REAL NOT NULL,
    confidence REAL NOT NULL,
    explanation TEXT NOT NULL,
    used_oracle INTEGER NOT NULL,
    roi REAL NOT NULL,
    profitable INTEGER NOT NULL,
    reflection TEXT NOT NULL,
    knowledge_deltas TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_decisions_agent ON decisions(agent_id);

CREATE TABLE IF NOT EXISTS lineage (
    descendant_id TEXT PRIMARY KEY,
    ancestor_id TEXT NOT NULL,
    generation_gap INTEGER NOT NULL,
    cycle INTEGER NOT NULL,
    mutation TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_lineage_ancestor ON lineage(ancestor_id);

CREATE TABLE IF NOT EXISTS sharing (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    teacher_id TEXT NOT NULL,
    student_id TEXT NOT NULL,
    teacher_knowledge_id TEXT NOT NULL,
    student_knowledge_id TEXT,
    snapshot TEXT NOT NULL,
    created_cycle INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    adopted INTEGER NOT NULL,
    student_fitness_at_adoption REAL NOT NULL,
    outcome TEXT NOT NULL DEFAULT 'pending',
    fitness_delta REAL,
    validated_cycle INTEGER,
    validated_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_sharing_outcome ON sharing(outcome);

CREATE TABLE IF NOT EXISTS matchups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    round INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    segment_start TEXT NOT NULL,
    pattern_a TEXT NOT NULL,
    pattern_b TEXT NOT NULL,
    score_a REAL NOT NULL,
    score_b REAL NOT NULL,
    winner TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS evolution_passes (
    cycle INTEGER PRIMARY KEY,
    eliminated INTEGER NOT NULL,
    cloned INTEGER NOT NULL,
    spared INTEGER NOT NULL,
    median_fitness REAL NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS network_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cycle INTEGER NOT NULL UNIQUE,
    active_agents INTEGER NOT NULL,
    avg_fitness REAL NOT NULL,
    top_fitness REAL NOT NULL,
    total_knowledge INTEGER NOT NULL,
    helped INTEGER NOT NULL,
    hurt INTEGER NOT NULL,
    neutral INTEGER NOT NULL,
    pending INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS task_leases (
    kind TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
";

/// Retry policy for busy/locked transactions
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(25),
        }
    }
}

/// Durable store for patterns, agents and everything they produce
pub struct EvolutionStore {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

impl EvolutionStore {
    /// Create or open the store database
    pub fn open(path: &str, retry: RetryPolicy) -> EngineResult<Self> {
        let exists = path != ":memory:" && Path::new(path).exists();
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.busy_timeout(Duration::from_millis(250))?;
        conn.execute_batch(SCHEMA)?;

        if exists {
            info!(path, "opened existing evolution store");
        } else {
            info!(path, "created evolution store");
        }

        Ok(Self {
            conn: Mutex::new(conn),
            retry,
        })
    }

    /// Fresh in-memory store, used by tests and dry runs
    pub fn in_memory() -> EngineResult<Self> {
        Self::open(":memory:", RetryPolicy::default())
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::invariant("store", "connection mutex poisoned"))
    }

    /// Run read-only queries against a consistent connection
    pub fn read<T>(&self, f: impl FnOnce(&Records<'_>) -> EngineResult<T>) -> EngineResult<T> {
        let conn = self.lock()?;
        f(&Records::new(&conn))
    }

    /// Run `f` inside one immediate transaction, committed only if it
    /// returns Ok. Busy/locked failures are retried with exponential backoff.
    ///
    /// The backoff parks the calling thread; async callers use
    /// [`write_async`](Self::write_async).
    pub fn write<T>(&self, mut f: impl FnMut(&Records<'_>) -> EngineResult<T>) -> EngineResult<T> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_write(&mut f) {
                Ok(value) => return Ok(value),
                Err(e) => std::thread::sleep(self.retry_delay(attempt, e)?),
            }
        }
    }

    /// Same contract as [`write`](Self::write), backing off on the tokio
    /// timer so a busy store never stalls a runtime worker.
    pub async fn write_async<T>(&self, mut f: impl FnMut(&Records<'_>) -> EngineResult<T>) -> EngineResult<T> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let delay = match self.try_write(&mut f) {
                Ok(value) => return Ok(value),
                Err(e) => self.retry_delay(attempt, e)?,
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// Backoff before the next attempt, or the error to surface
    fn retry_delay(&self, attempt: u32, e: EngineError) -> EngineResult<Duration> {
        if !e.is_retryable() {
            return Err(e);
        }
        if attempt > self.retry.max_retries {
            warn!(attempts = attempt, cause = %e, "store conflict, giving up");
            return Err(EngineError::StoreConflict { attempts: attempt });
        }
        let backoff = self.retry.base_backoff * 2u32.pow(attempt - 1);
        debug!(attempt, backoff_ms = backoff.as_millis() as u64, cause = %e, "store busy, retrying");
        Ok(backoff)
    }

    fn try_write<T>(&self, f: &mut impl FnMut(&Records<'_>) -> EngineResult<T>) -> EngineResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&Records::new(&tx))?;
        tx.commit()?;
        Ok(value)
    }
}
