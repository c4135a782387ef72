//! Per-entity record access
//!
//! `Records` wraps a connection (or an open transaction) and exposes the
//! CRUD surface the engine needs. Counter mutations are single
//! `UPDATE … SET x = x + ?` statements and creations use
//! `INSERT OR IGNORE`, so every write is atomic per record.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use crate::core::agent::{Agent, AgentStatus, Genome, Personality};
use crate::core::arena::MatchupRecord;
use crate::core::decision::DecisionRecord;
use crate::core::evolution::{EvolutionPass, LineageEdge};
use crate::core::knowledge::{KnowledgeItem, KnowledgeKind};
use crate::core::network::{NetworkStats, SharingRecord, ValidationOutcome};
use crate::core::pattern::{Pattern, PatternOrigin, PatternStatus};
use crate::core::types::Timeframe;
use crate::error::{EngineError, EngineResult};

/// Minimum EWMA step so old outcomes keep fading
const MIN_WIN_RATE_ALPHA: f64 = 0.05;

const PATTERN_COLUMNS: &str = "id, name, condition, origin, runs, wins, losses, votes,
    sample_size, win_rate, status, created_at";

const AGENT_COLUMNS: &str = "id, personality, generation, fitness, total_trades, winning_trades,
    avg_roi_per_trade, status, genome, parent_id, created_at";

const KNOWLEDGE_COLUMNS: &str = "id, agent_id, kind, pattern_id, condition_bucket, strength,
    confidence, base_confidence, times_validated, times_contradicted, detail, adopted_from, created_at";

const SHARING_COLUMNS: &str = "id, teacher_id, student_id, teacher_knowledge_id, student_knowledge_id,
    snapshot, created_cycle, created_at, adopted, student_fitness_at_adoption, outcome,
    fitness_delta, validated_cycle, validated_at";

/// Fixed-width UTC so stored timestamps compare correctly as text
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn enum_col<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown value '{}'", raw).into(),
        )
    })
}

fn pattern_from_row(row: &Row<'_>) -> rusqlite::Result<Pattern> {
    Ok(Pattern {
        id: row.get(0)?,
        name: row.get(1)?,
        condition: json_col(row, 2)?,
        origin: enum_col(row, 3, PatternOrigin::from_str)?,
        runs: row.get(4)?,
        wins: row.get(5)?,
        losses: row.get(6)?,
        votes: row.get(7)?,
        sample_size: row.get(8)?,
        win_rate: row.get(9)?,
        status: enum_col(row, 10, PatternStatus::from_str)?,
        created_at: parse_time(&row.get::<_, String>(11)?),
    })
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        personality: enum_col(row, 1, Personality::from_str)?,
        generation: row.get(2)?,
        fitness: row.get(3)?,
        total_trades: row.get(4)?,
        winning_trades: row.get(5)?,
        avg_roi_per_trade: row.get(6)?,
        status: enum_col(row, 7, AgentStatus::from_str)?,
        genome: json_col::<Genome>(row, 8)?,
        parent_id: row.get(9)?,
        created_at: parse_time(&row.get::<_, String>(10)?),
    })
}

fn knowledge_from_row(row: &Row<'_>) -> rusqlite::Result<KnowledgeItem> {
    Ok(KnowledgeItem {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        kind: enum_col(row, 2, KnowledgeKind::from_str)?,
        pattern_id: row.get(3)?,
        condition_bucket: row.get(4)?,
        strength: row.get(5)?,
        confidence: row.get(6)?,
        base_confidence: row.get(7)?,
        times_validated: row.get(8)?,
        times_contradicted: row.get(9)?,
        detail: row.get(10)?,
        adopted_from: row.get(11)?,
        created_at: parse_time(&row.get::<_, String>(12)?),
    })
}

fn sharing_from_row(row: &Row<'_>) -> rusqlite::Result<SharingRecord> {
    Ok(SharingRecord {
        id: row.get(0)?,
        teacher_id: row.get(1)?,
        student_id: row.get(2)?,
        teacher_knowledge_id: row.get(3)?,
        student_knowledge_id: row.get(4)?,
        snapshot: json_col(row, 5)?,
        created_cycle: row.get(6)?,
        created_at: parse_time(&row.get::<_, String>(7)?),
        adopted: row.get::<_, i64>(8)? != 0,
        student_fitness_at_adoption: row.get(9)?,
        outcome: enum_col(row, 10, ValidationOutcome::from_str)?,
        fitness_delta: row.get(11)?,
        validated_cycle: row.get(12)?,
        validated_at: row.get::<_, Option<String>>(13)?.map(|s| parse_time(&s)),
    })
}

/// Record-level access over a connection or transaction
pub struct Records<'c> {
    conn: &'c Connection,
}

impl<'c> Records<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    // =========================================================================
    // PATTERNS
    // =========================================================================

    /// Insert unless a pattern with the same id or name exists
    pub fn insert_pattern_if_absent(&self, p: &Pattern) -> EngineResult<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO patterns
             (id, name, condition, origin, runs, wins, losses, votes, sample_size, win_rate, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                p.id,
                p.name,
                serde_json::to_string(&p.condition)?,
                p.origin.as_str(),
                p.runs,
                p.wins,
                p.losses,
                p.votes,
                p.sample_size,
                p.win_rate,
                p.status.as_str(),
                ts(&p.created_at),
            ],
        )?;
        Ok(n > 0)
    }

    pub fn get_pattern(&self, id: &str) -> EngineResult<Option<Pattern>> {
        let sql = format!("SELECT {} FROM patterns WHERE id = ?1", PATTERN_COLUMNS);
        Ok(self.conn.query_row(&sql, [id], pattern_from_row).optional()?)
    }

    /// Non-retired patterns ordered by id
    pub fn active_patterns(&self) -> EngineResult<Vec<Pattern>> {
        let sql = format!(
            "SELECT {} FROM patterns WHERE status != 'retired' ORDER BY id",
            PATTERN_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], pattern_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn all_patterns(&self) -> EngineResult<Vec<Pattern>> {
        let sql = format!("SELECT {} FROM patterns ORDER BY id", PATTERN_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], pattern_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Winner gets +1 vote and a win, loser -1 and a loss, both a run
    pub fn record_matchup_win(&self, winner: &str, loser: &str) -> EngineResult<()> {
        let w = self.conn.execute(
            "UPDATE patterns SET runs = runs + 1, wins = wins + 1, votes = votes + 1 WHERE id = ?1",
            [winner],
        )?;
        let l = self.conn.execute(
            "UPDATE patterns SET runs = runs + 1, losses = losses + 1, votes = votes - 1 WHERE id = ?1",
            [loser],
        )?;
        if w == 0 || l == 0 {
            return Err(EngineError::invariant(
                format!("matchup:{}:{}", winner, loser),
                "pattern missing",
            ));
        }
        Ok(())
    }

    /// A tie only counts the run
    pub fn record_matchup_tie(&self, a: &str, b: &str) -> EngineResult<()> {
        let n = self.conn.execute(
            "UPDATE patterns SET runs = runs + 1 WHERE id IN (?1, ?2)",
            params![a, b],
        )?;
        if n != 2 {
            return Err(EngineError::invariant(format!("matchup:{}:{}", a, b), "pattern missing"));
        }
        Ok(())
    }

    pub fn set_pattern_status(&self, id: &str, status: PatternStatus) -> EngineResult<()> {
        // Retired is terminal
        self.conn.execute(
            "UPDATE patterns SET status = ?2 WHERE id = ?1 AND status != 'retired'",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    /// Fold one trade outcome into sample size and recency-weighted win rate
    pub fn record_pattern_outcome(&self, id: &str, profitable: bool) -> EngineResult<()> {
        let outcome = if profitable { 1.0 } else { 0.0 };
        self.conn.execute(
            "UPDATE patterns SET
                win_rate = win_rate + MAX(1.0 / (sample_size + 1), ?2) * (?3 - win_rate),
                sample_size = sample_size + 1
             WHERE id = ?1",
            params![id, MIN_WIN_RATE_ALPHA, outcome],
        )?;
        Ok(())
    }

    pub fn pattern_status_counts(&self) -> EngineResult<Vec<(PatternStatus, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM patterns GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |row| Ok((enum_col(row, 0, PatternStatus::from_str)?, row.get(1)?)))?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn top_patterns(&self, limit: i64) -> EngineResult<Vec<Pattern>> {
        let sql = format!(
            "SELECT {} FROM patterns WHERE status != 'retired'
             ORDER BY votes DESC, runs DESC, id LIMIT ?1",
            PATTERN_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([limit], pattern_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn append_matchup(&self, m: &MatchupRecord) -> EngineResult<i64> {
        self.conn.execute(
            "INSERT INTO matchups
             (round, symbol, timeframe, segment_start, pattern_a, pattern_b, score_a, score_b, winner, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                m.round,
                m.symbol,
                m.timeframe.as_str(),
                ts(&m.segment_start),
                m.pattern_a,
                m.pattern_b,
                m.score_a,
                m.score_b,
                m.winner,
                ts(&Utc::now()),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn matchups_for_pattern(&self, id: &str) -> EngineResult<Vec<MatchupRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT round, symbol, timeframe, segment_start, pattern_a, pattern_b, score_a, score_b, winner
             FROM matchups WHERE pattern_a = ?1 OR pattern_b = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([id], |row| {
            Ok(MatchupRecord {
                round: row.get(0)?,
                symbol: row.get(1)?,
                timeframe: enum_col(row, 2, Timeframe::from_str)?,
                segment_start: parse_time(&row.get::<_, String>(3)?),
                pattern_a: row.get(4)?,
                pattern_b: row.get(5)?,
                score_a: row.get(6)?,
                score_b: row.get(7)?,
                winner: row.get(8)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // =========================================================================
    // AGENTS
    // =========================================================================

    pub fn insert_agent_if_absent(&self, a: &Agent) -> EngineResult<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO agents
             (id, personality, generation, fitness, total_trades, winning_trades, avg_roi_per_trade,
              status, genome, parent_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                a.id,
                a.personality.as_str(),
                a.generation,
                a.fitness,
                a.total_trades,
                a.winning_trades,
                a.avg_roi_per_trade,
                a.status.as_str(),
                serde_json::to_string(&a.genome)?,
                a.parent_id,
                ts(&a.created_at),
            ],
        )?;
        Ok(n > 0)
    }

    pub fn get_agent(&self, id: &str) -> EngineResult<Option<Agent>> {
        let sql = format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS);
        Ok(self.conn.query_row(&sql, [id], agent_from_row).optional()?)
    }

    /// Active agents in rank order: fitness desc, generation asc, id
    pub fn active_agents(&self) -> EngineResult<Vec<Agent>> {
        let sql = format!(
            "SELECT {} FROM agents WHERE status = 'active'
             ORDER BY fitness DESC, generation ASC, id ASC",
            AGENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], agent_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn all_agents(&self) -> EngineResult<Vec<Agent>> {
        let sql = format!("SELECT {} FROM agents ORDER BY generation, id", AGENT_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], agent_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn count_agents(&self, status: AgentStatus) -> EngineResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM agents WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?)
    }

    pub fn max_generation(&self) -> EngineResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COALESCE(MAX(generation), 0) FROM agents", [], |row| row.get(0))?)
    }

    /// Fold one trade into the lifetime counters
    pub fn record_agent_trade(&self, id: &str, roi: f64, profitable: bool) -> EngineResult<()> {
        let n = self.conn.execute(
            "UPDATE agents SET
                avg_roi_per_trade = (avg_roi_per_trade * total_trades + ?2) / (total_trades + 1),
                winning_trades = winning_trades + ?3,
                total_trades = total_trades + 1
             WHERE id = ?1",
            params![id, roi, profitable as i64],
        )?;
        if n == 0 {
            return Err(EngineError::invariant(format!("agent:{}", id), "agent missing"));
        }
        Ok(())
    }

    pub fn set_agent_fitness(&self, id: &str, fitness: f64) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE agents SET fitness = ?2 WHERE id = ?1",
            params![id, fitness],
        )?;
        Ok(())
    }

    /// Mark eliminated; false if the agent was not active
    pub fn eliminate_agent(&self, id: &str) -> EngineResult<bool> {
        let n = self.conn.execute(
            "UPDATE agents SET status = 'eliminated' WHERE id = ?1 AND status = 'active'",
            [id],
        )?;
        Ok(n > 0)
    }

    // =========================================================================
    // KNOWLEDGE
    // =========================================================================

    pub fn insert_knowledge_if_absent(&self, k: &KnowledgeItem) -> EngineResult<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO knowledge
             (id, agent_id, kind, pattern_id, condition_bucket, strength, confidence, base_confidence,
              times_validated, times_contradicted, detail, adopted_from, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                k.id,
                k.agent_id,
                k.kind.as_str(),
                k.pattern_id,
                k.condition_bucket,
                k.strength,
                k.confidence,
                k.base_confidence,
                k.times_validated,
                k.times_contradicted,
                k.detail,
                k.adopted_from,
                ts(&k.created_at),
            ],
        )?;
        Ok(n > 0)
    }

    /// Persist strength, confidence and counters after an outcome
    pub fn update_knowledge(&self, k: &KnowledgeItem) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE knowledge SET strength = ?2, confidence = ?3,
                times_validated = ?4, times_contradicted = ?5
             WHERE id = ?1",
            params![k.id, k.strength, k.confidence, k.times_validated, k.times_contradicted],
        )?;
        Ok(())
    }

    pub fn knowledge_for_agent(&self, agent_id: &str) -> EngineResult<Vec<KnowledgeItem>> {
        let sql = format!(
            "SELECT {} FROM knowledge WHERE agent_id = ?1 ORDER BY created_at, id",
            KNOWLEDGE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([agent_id], knowledge_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn agent_has_pattern_knowledge(&self, agent_id: &str, pattern_id: &str) -> EngineResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM knowledge WHERE agent_id = ?1 AND pattern_id = ?2",
            params![agent_id, pattern_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn count_knowledge(&self) -> EngineResult<i64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM knowledge", [], |row| row.get(0))?)
    }

    // =========================================================================
    // DECISIONS (append-only)
    // =========================================================================

    pub fn append_decision(&self, d: &DecisionRecord) -> EngineResult<i64> {
        self.conn.execute(
            "INSERT INTO decisions
             (agent_id, round, timestamp, symbol, timeframe, condition_bucket, pattern_ids, signal,
              confidence, explanation, used_oracle, roi, profitable, reflection, knowledge_deltas)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                d.agent_id,
                d.round,
                ts(&d.timestamp),
                d.symbol,
                d.timeframe.as_str(),
                d.condition_bucket,
                serde_json::to_string(&d.pattern_ids)?,
                d.signal,
                d.confidence,
                d.explanation,
                d.used_oracle as i64,
                d.roi,
                d.profitable as i64,
                d.reflection,
                serde_json::to_string(&d.knowledge_deltas)?,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn decisions_for_agent(&self, agent_id: &str, limit: i64) -> EngineResult<Vec<DecisionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, agent_id, round, timestamp, symbol, timeframe, condition_bucket, pattern_ids,
                    signal, confidence, explanation, used_oracle, roi, profitable, reflection, knowledge_deltas
             FROM decisions WHERE agent_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent_id, limit], |row| {
            Ok(DecisionRecord {
                id: row.get(0)?,
                agent_id: row.get(1)?,
                round: row.get(2)?,
                timestamp: parse_time(&row.get::<_, String>(3)?),
                symbol: row.get(4)?,
                timeframe: enum_col(row, 5, Timeframe::from_str)?,
                condition_bucket: row.get(6)?,
                pattern_ids: json_col(row, 7)?,
                signal: row.get(8)?,
                confidence: row.get(9)?,
                explanation: row.get(10)?,
                used_oracle: row.get::<_, i64>(11)? != 0,
                roi: row.get(12)?,
                profitable: row.get::<_, i64>(13)? != 0,
                reflection: row.get(14)?,
                knowledge_deltas: json_col(row, 15)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn count_decisions(&self) -> EngineResult<i64> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM decisions", [], |row| row.get(0))?)
    }

    // =========================================================================
    // LINEAGE (append-only)
    // =========================================================================

    /// One edge per descendant; re-inserting the same clone is a no-op
    pub fn insert_lineage_if_absent(&self, e: &LineageEdge) -> EngineResult<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO lineage
             (descendant_id, ancestor_id, generation_gap, cycle, mutation, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                e.descendant_id,
                e.ancestor_id,
                e.generation_gap,
                e.cycle,
                serde_json::to_string(&e.mutation)?,
                ts(&e.created_at),
            ],
        )?;
        Ok(n > 0)
    }

    pub fn all_lineage(&self) -> EngineResult<Vec<LineageEdge>> {
        let mut stmt = self.conn.prepare(
            "SELECT ancestor_id, descendant_id, generation_gap, cycle, mutation, created_at
             FROM lineage ORDER BY cycle, descendant_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(LineageEdge {
                ancestor_id: row.get(0)?,
                descendant_id: row.get(1)?,
                generation_gap: row.get(2)?,
                cycle: row.get(3)?,
                mutation: json_col(row, 4)?,
                created_at: parse_time(&row.get::<_, String>(5)?),
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // =========================================================================
    // SHARING
    // =========================================================================

    pub fn insert_sharing(&self, s: &SharingRecord) -> EngineResult<i64> {
        self.conn.execute(
            "INSERT INTO sharing
             (teacher_id, student_id, teacher_knowledge_id, student_knowledge_id, snapshot, created_cycle,
              created_at, adopted, student_fitness_at_adoption, outcome)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                s.teacher_id,
                s.student_id,
                s.teacher_knowledge_id,
                s.student_knowledge_id,
                serde_json::to_string(&s.snapshot)?,
                s.created_cycle,
                ts(&s.created_at),
                s.adopted as i64,
                s.student_fitness_at_adoption,
                ValidationOutcome::Pending.as_str(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Pending adopted records created at or before `cycle`
    pub fn pending_sharing(&self, created_before_or_at: i64) -> EngineResult<Vec<SharingRecord>> {
        let sql = format!(
            "SELECT {} FROM sharing
             WHERE outcome = 'pending' AND adopted = 1 AND created_cycle <= ?1 ORDER BY id",
            SHARING_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([created_before_or_at], sharing_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn all_sharing(&self) -> EngineResult<Vec<SharingRecord>> {
        let sql = format!("SELECT {} FROM sharing ORDER BY id", SHARING_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], sharing_from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Write the validation outcome exactly once
    pub fn validate_sharing(
        &self,
        id: i64,
        outcome: ValidationOutcome,
        fitness_delta: f64,
        cycle: i64,
    ) -> EngineResult<()> {
        if outcome == ValidationOutcome::Pending {
            return Err(EngineError::invariant(format!("sharing:{}", id), "cannot validate to pending"));
        }
        let n = self.conn.execute(
            "UPDATE sharing SET outcome = ?2, fitness_delta = ?3, validated_cycle = ?4, validated_at = ?5
             WHERE id = ?1 AND outcome = 'pending'",
            params![id, outcome.as_str(), fitness_delta, cycle, ts(&Utc::now())],
        )?;
        if n == 0 {
            return Err(EngineError::invariant(format!("sharing:{}", id), "already validated"));
        }
        Ok(())
    }

    pub fn sharing_outcome_counts(&self) -> EngineResult<Vec<(ValidationOutcome, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT outcome, COUNT(*) FROM sharing WHERE adopted = 1 GROUP BY outcome ORDER BY outcome")?;
        let rows = stmt.query_map([], |row| Ok((enum_col(row, 0, ValidationOutcome::from_str)?, row.get(1)?)))?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // =========================================================================
    // EVOLUTION PASSES / NETWORK METRICS
    // =========================================================================

    pub fn evolution_pass_exists(&self, cycle: i64) -> EngineResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM evolution_passes WHERE cycle = ?1",
            [cycle],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn record_evolution_pass(&self, pass: &EvolutionPass) -> EngineResult<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO evolution_passes (cycle, eliminated, cloned, spared, median_fitness, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                pass.cycle,
                pass.eliminated.len() as i64,
                pass.cloned.len() as i64,
                pass.spared.len() as i64,
                pass.median_fitness,
                ts(&Utc::now()),
            ],
        )?;
        Ok(n > 0)
    }

    /// Cycle of the most recent evolution pass, if any
    pub fn last_evolution_cycle(&self) -> EngineResult<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT MAX(cycle) FROM evolution_passes", [], |row| row.get(0))?)
    }

    /// Whether the network pass for `cycle` already left its snapshot
    pub fn network_metrics_exist(&self, cycle: i64) -> EngineResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM network_metrics WHERE cycle = ?1",
            [cycle],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn append_network_metrics(&self, m: &NetworkStats) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO network_metrics
             (cycle, active_agents, avg_fitness, top_fitness, total_knowledge, helped, hurt, neutral, pending, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                m.cycle,
                m.active_agents,
                m.avg_fitness,
                m.top_fitness,
                m.total_knowledge,
                m.successful_adoptions,
                m.failed_adoptions,
                m.neutral_adoptions,
                m.pending_adoptions,
                ts(&m.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn latest_network_metrics(&self) -> EngineResult<Option<NetworkStats>> {
        Ok(self
            .conn
            .query_row(
                "SELECT cycle, active_agents, avg_fitness, top_fitness, total_knowledge,
                        helped, hurt, neutral, pending, created_at
                 FROM network_metrics ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(NetworkStats {
                        cycle: row.get(0)?,
                        active_agents: row.get(1)?,
                        avg_fitness: row.get(2)?,
                        top_fitness: row.get(3)?,
                        total_knowledge: row.get(4)?,
                        successful_adoptions: row.get(5)?,
                        failed_adoptions: row.get(6)?,
                        neutral_adoptions: row.get(7)?,
                        pending_adoptions: row.get(8)?,
                        created_at: parse_time(&row.get::<_, String>(9)?),
                    })
                },
            )
            .optional()?)
    }

    // =========================================================================
    // COUNTERS / LEASES
    // =========================================================================

    pub fn counter(&self, name: &str) -> EngineResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT value FROM counters WHERE name = ?1", [name], |row| row.get(0))
            .optional()?
            .unwrap_or(0))
    }

    /// Atomically bump a counter and return its new value
    pub fn increment_counter(&self, name: &str) -> EngineResult<i64> {
        self.conn.execute(
            "INSERT INTO counters (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            [name],
        )?;
        self.counter(name)
    }

    /// Take the lease for `kind` if it is free or expired. A live lease is
    /// never re-entered, not even by its own holder.
    pub fn try_acquire_lease(
        &self,
        kind: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let n = self.conn.execute(
            "INSERT INTO task_leases (kind, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(kind) DO UPDATE SET holder = ?2, expires_at = ?3
             WHERE task_leases.expires_at <= ?4",
            params![kind, holder, ts(&expires_at), ts(&now)],
        )?;
        Ok(n > 0)
    }

    pub fn release_lease(&self, kind: &str, holder: &str) -> EngineResult<()> {
        self.conn.execute(
            "DELETE FROM task_leases WHERE kind = ?1 AND holder = ?2",
            params![kind, holder],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::discovery;
    use crate::core::evolution::MutationDetails;
    use crate::data::EvolutionStore;
    use std::collections::BTreeMap;

    fn store_with_patterns() -> (EvolutionStore, Vec<String>) {
        let store = EvolutionStore::in_memory().unwrap();
        let ids = store
            .write(|r| {
                let mut ids = Vec::new();
                for p in discovery::literature_catalogue() {
                    r.insert_pattern_if_absent(&p)?;
                    ids.push(p.id.clone());
                }
                Ok(ids)
            })
            .unwrap();
        (store, ids)
    }

    #[test]
    fn test_pattern_insert_is_idempotent() {
        let (store, _) = store_with_patterns();
        let again = store
            .write(|r| {
                let mut inserted = 0;
                for p in discovery::literature_catalogue() {
                    if r.insert_pattern_if_absent(&p)? {
                        inserted += 1;
                    }
                }
                Ok(inserted)
            })
            .unwrap();
        assert_eq!(again, 0);
        assert_eq!(store.read(|r| r.all_patterns()).unwrap().len(), 8);
    }

    #[test]
    fn test_matchup_accounting() {
        let (store, ids) = store_with_patterns();
        store
            .write(|r| {
                r.record_matchup_win(&ids[0], &ids[1])?;
                r.record_matchup_win(&ids[0], &ids[1])?;
                r.record_matchup_tie(&ids[0], &ids[1])
            })
            .unwrap();
        let (a, b) = store
            .read(|r| Ok((r.get_pattern(&ids[0])?.unwrap(), r.get_pattern(&ids[1])?.unwrap())))
            .unwrap();
        assert_eq!((a.runs, a.wins, a.losses, a.votes), (3, 2, 0, 2));
        assert_eq!((b.runs, b.wins, b.losses, b.votes), (3, 0, 2, -2));
    }

    #[test]
    fn test_matchup_with_missing_pattern_rolls_back() {
        let (store, ids) = store_with_patterns();
        let err = store.write(|r| r.record_matchup_win(&ids[0], "ghost")).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation { .. }));
        let a = store.read(|r| r.get_pattern(&ids[0])).unwrap().unwrap();
        assert_eq!(a.runs, 0);
        assert_eq!(a.votes, 0);
    }

    #[test]
    fn test_outcomes_leave_votes_alone() {
        let (store, ids) = store_with_patterns();
        store
            .write(|r| {
                r.record_pattern_outcome(&ids[0], true)?;
                r.record_pattern_outcome(&ids[0], false)
            })
            .unwrap();
        let p = store.read(|r| r.get_pattern(&ids[0])).unwrap().unwrap();
        assert_eq!(p.sample_size, 2);
        assert_eq!(p.votes, 0);
        assert_eq!(p.runs, 0);
        // 0.5 -> 1.0 on the first sample, halfway back on the second
        assert!((p.win_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_retired_is_terminal() {
        let (store, ids) = store_with_patterns();
        store
            .write(|r| {
                r.set_pattern_status(&ids[0], PatternStatus::Retired)?;
                r.set_pattern_status(&ids[0], PatternStatus::Winning)
            })
            .unwrap();
        let p = store.read(|r| r.get_pattern(&ids[0])).unwrap().unwrap();
        assert_eq!(p.status, PatternStatus::Retired);
        assert_eq!(store.read(|r| r.active_patterns()).unwrap().len(), 7);
    }

    #[test]
    fn test_agent_trade_running_average() {
        let store = EvolutionStore::in_memory().unwrap();
        let agent = Agent::founder(Personality::Conservative, 0);
        store
            .write(|r| {
                r.insert_agent_if_absent(&agent)?;
                r.record_agent_trade(&agent.id, 0.03, true)?;
                r.record_agent_trade(&agent.id, -0.01, false)
            })
            .unwrap();
        let a = store.read(|r| r.get_agent(&agent.id)).unwrap().unwrap();
        assert_eq!(a.total_trades, 2);
        assert_eq!(a.winning_trades, 1);
        assert!((a.avg_roi_per_trade - 0.01).abs() < 1e-12);

        assert!(store.write(|r| r.eliminate_agent(&agent.id)).unwrap());
        assert!(!store.write(|r| r.eliminate_agent(&agent.id)).unwrap());
        assert_eq!(store.read(|r| r.count_agents(AgentStatus::Eliminated)).unwrap(), 1);
        assert!(store.read(|r| r.active_agents()).unwrap().is_empty());
    }

    #[test]
    fn test_knowledge_round_trip() {
        let store = EvolutionStore::in_memory().unwrap();
        let mut item = KnowledgeItem::new("agent-1", KnowledgeKind::PatternPreference, Some("p1"), "normal/up/high", 0.4, 0.7);
        store.write(|r| r.insert_knowledge_if_absent(&item)).unwrap();
        item.strength = 0.6;
        item.times_validated = 1;
        store.write(|r| r.update_knowledge(&item)).unwrap();

        let items = store.read(|r| r.knowledge_for_agent("agent-1")).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].strength, 0.6);
        assert_eq!(items[0].times_validated, 1);
        assert!(store.read(|r| r.agent_has_pattern_knowledge("agent-1", "p1")).unwrap());
        assert!(!store.read(|r| r.agent_has_pattern_knowledge("agent-2", "p1")).unwrap());
    }

    #[test]
    fn test_lineage_insert_or_ignore() {
        let store = EvolutionStore::in_memory().unwrap();
        let edge = LineageEdge {
            ancestor_id: "parent".to_string(),
            descendant_id: "child".to_string(),
            generation_gap: 1,
            cycle: 50,
            mutation: MutationDetails {
                personality_from: Personality::Aggressive,
                personality_to: Personality::Aggressive,
                risk_tolerance_from: 0.7,
                risk_tolerance_to: 0.72,
                weight_deltas: BTreeMap::new(),
                knowledge_copied: 3,
            },
            created_at: Utc::now(),
        };
        assert!(store.write(|r| r.insert_lineage_if_absent(&edge)).unwrap());
        assert!(!store.write(|r| r.insert_lineage_if_absent(&edge)).unwrap());
        let all = store.read(|r| r.all_lineage()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].mutation, edge.mutation);
    }

    #[test]
    fn test_counters() {
        let store = EvolutionStore::in_memory().unwrap();
        assert_eq!(store.read(|r| r.counter("agent_rounds")).unwrap(), 0);
        assert_eq!(store.write(|r| r.increment_counter("agent_rounds")).unwrap(), 1);
        assert_eq!(store.write(|r| r.increment_counter("agent_rounds")).unwrap(), 2);
        assert_eq!(store.read(|r| r.counter("pattern_rounds")).unwrap(), 0);
    }

    #[test]
    fn test_lease_single_flight() {
        let store = EvolutionStore::in_memory().unwrap();
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(60);
        assert!(store.write(|r| r.try_acquire_lease("evolution", "a", now, later)).unwrap());
        assert!(!store.write(|r| r.try_acquire_lease("evolution", "b", now, later)).unwrap());
        // Not even the holder gets in twice
        assert!(!store.write(|r| r.try_acquire_lease("evolution", "a", now, later)).unwrap());

        // An expired lease is up for grabs
        let after = later + chrono::Duration::seconds(1);
        let far = after + chrono::Duration::seconds(60);
        assert!(store.write(|r| r.try_acquire_lease("evolution", "b", after, far)).unwrap());

        store.write(|r| r.release_lease("evolution", "b")).unwrap();
        assert!(store.write(|r| r.try_acquire_lease("evolution", "c", now, later)).unwrap());
    }

    #[test]
    fn test_evolution_pass_ledger() {
        let store = EvolutionStore::in_memory().unwrap();
        assert_eq!(store.read(|r| r.last_evolution_cycle()).unwrap(), None);
        let pass = EvolutionPass { cycle: 50, ..Default::default() };
        assert!(store.write(|r| r.record_evolution_pass(&pass)).unwrap());
        assert!(!store.write(|r| r.record_evolution_pass(&pass)).unwrap());
        assert!(store.read(|r| r.evolution_pass_exists(50)).unwrap());
        assert_eq!(store.read(|r| r.last_evolution_cycle()).unwrap(), Some(50));
    }
}
