//! Persistent state management for runs, steps, stories, events and
//! medic checks.
//!
//! The store is the single process-wide owner of the SQLite database. All
//! mutating operations are compound transactions; engines and the medic never
//! touch the database except through them. Claims and step advancement use
//! guarded compare-and-swap updates (`… WHERE id = ? AND status = ?`) so that
//! two racing callers resolve to exactly one winner and one clean loser.

pub mod models;

pub use models::*;

use crate::error::{Error, Result};
use crate::workflow::LoopSpec;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Outcome of completing a step (or draining a loop) and advancing the
/// run's cursor.
#[derive(Debug, Clone)]
pub enum StepAdvance {
    /// The completed step was the last one; the run is done.
    RunDone,
    /// The next step is now pending (stories seeded when it is a loop).
    Activated(StepRecord),
    /// The next step was a loop with zero stories; it is already done and
    /// the caller must advance past it in turn.
    LoopDrained(StepRecord),
    /// Lost the race: the unit was no longer in the expected state.
    AlreadyApplied,
}

/// Outcome of an agent-reported failure.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Unit returned to `pending` for another attempt.
    Retrying { retry_count: i64 },
    /// Retry budget reached; unit and run are now failed.
    Exhausted,
    /// Unit was not in a failable state.
    AlreadyApplied,
}

/// Outcome of a medic-initiated reset.
#[derive(Debug, Clone)]
pub enum ResetOutcome {
    /// Unit returned to `pending`; abandon counter bumped.
    Reset { abandoned_count: i64 },
    /// Abandon bound reached: step failed (and run with it) or story skipped.
    Terminal,
    /// Unit was not in a resettable state.
    AlreadyApplied,
}

/// Full materialized view of one run, for the JSON-per-run archive.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunSnapshot {
    pub run: RunRecord,
    pub steps: Vec<StepRecord>,
    pub stories: Vec<StoryRecord>,
}

/// Claim candidate with the FIFO ordering key `(run.created_at, run.id,
/// step_index, story_index)`; steps sort before the stories of later steps
/// via `story_index = -1`.
#[derive(Debug, Clone)]
pub struct ClaimCandidate {
    pub unit_id: String,
    pub is_story: bool,
    pub run_created_at: DateTime<Utc>,
    pub run_id: String,
    pub step_index: i64,
    pub story_index: i64,
}

impl ClaimCandidate {
    pub fn ordering_key(&self) -> (DateTime<Utc>, String, i64, i64) {
        (
            self.run_created_at,
            self.run_id.clone(),
            self.step_index,
            self.story_index,
        )
    }
}

/// Handle on the embedded database.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id          TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    task        TEXT NOT NULL,
    status      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    meta        TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS steps (
    id               TEXT PRIMARY KEY,
    run_id           TEXT NOT NULL REFERENCES runs(id),
    step_index       INTEGER NOT NULL,
    step_id          TEXT NOT NULL,
    agent_id         TEXT NOT NULL,
    step_type        TEXT NOT NULL,
    status           TEXT NOT NULL,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    abandoned_count  INTEGER NOT NULL DEFAULT 0,
    updated_at       TEXT NOT NULL,
    input            TEXT NOT NULL DEFAULT '',
    output           TEXT,
    outputs          TEXT NOT NULL DEFAULT '[]',
    loop_config      TEXT,
    current_story_id TEXT,
    UNIQUE (run_id, step_index)
);

CREATE TABLE IF NOT EXISTS stories (
    id              TEXT PRIMARY KEY,
    run_id          TEXT NOT NULL REFERENCES runs(id),
    loop_step_id    TEXT NOT NULL REFERENCES steps(id),
    story_id        TEXT NOT NULL,
    story_index     INTEGER NOT NULL,
    title           TEXT NOT NULL DEFAULT '',
    input           TEXT NOT NULL DEFAULT '',
    status          TEXT NOT NULL,
    phase           TEXT NOT NULL DEFAULT 'work',
    output          TEXT,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    abandoned_count INTEGER NOT NULL DEFAULT 0,
    updated_at      TEXT NOT NULL,
    UNIQUE (loop_step_id, story_index)
);

CREATE TABLE IF NOT EXISTS events (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    ts      TEXT NOT NULL,
    kind    TEXT NOT NULL,
    run_id  TEXT NOT NULL,
    step_id TEXT,
    detail  TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS medic_checks (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    checked_at    TEXT NOT NULL,
    issues_found  INTEGER NOT NULL,
    actions_taken INTEGER NOT NULL,
    summary       TEXT NOT NULL,
    findings      TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_steps_run ON steps (run_id, step_index);
CREATE INDEX IF NOT EXISTS idx_steps_status ON steps (status, agent_id);
CREATE INDEX IF NOT EXISTS idx_stories_step ON stories (loop_step_id, story_index);
CREATE INDEX IF NOT EXISTS idx_stories_status ON stories (status);
CREATE INDEX IF NOT EXISTS idx_events_run ON events (run_id, id);
"#;

impl Store {
    /// Open (creating if necessary) the database at `path` and apply the
    /// schema. A single pooled connection serialises all writers in-process;
    /// `busy_timeout` covers claims racing from concurrent CLI invocations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        Self::connect(options).await
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(Error::Database)?
            .foreign_keys(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        debug!("store ready");
        Ok(Self { pool })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    /// All runs, newest first.
    pub async fn list_runs(&self, limit: i64) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query("SELECT * FROM runs ORDER BY created_at DESC, id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn runs_with_status(&self, status: RunStatus) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query("SELECT * FROM runs WHERE status = ? ORDER BY created_at ASC, id ASC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn count_running_runs_for_workflow(&self, workflow_id: &str) -> Result<i64> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM runs WHERE workflow_id = ? AND status = 'running'")
                .bind(workflow_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.try_get("n")?)
    }

    /// Distinct workflow ids that still have a running run.
    pub async fn workflows_with_running_runs(&self) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT DISTINCT workflow_id FROM runs WHERE status = 'running' ORDER BY workflow_id")
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("workflow_id").map_err(Error::from))
            .collect()
    }

    pub async fn step(&self, step_row_id: &str) -> Result<Option<StepRecord>> {
        let row = sqlx::query("SELECT * FROM steps WHERE id = ?")
            .bind(step_row_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| step_from_row(&r)).transpose()
    }

    pub async fn steps_for_run(&self, run_id: &str) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query("SELECT * FROM steps WHERE run_id = ? ORDER BY step_index ASC")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(step_from_row).collect()
    }

    /// Steps currently `running` whose run is also `running` (medic scan).
    pub async fn running_steps(&self) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(
            "SELECT s.* FROM steps s JOIN runs r ON r.id = s.run_id \
             WHERE s.status = 'running' AND r.status = 'running'",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(step_from_row).collect()
    }

    pub async fn story(&self, story_row_id: &str) -> Result<Option<StoryRecord>> {
        let row = sqlx::query("SELECT * FROM stories WHERE id = ?")
            .bind(story_row_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| story_from_row(&r)).transpose()
    }

    pub async fn stories_for_step(&self, loop_step_id: &str) -> Result<Vec<StoryRecord>> {
        let rows =
            sqlx::query("SELECT * FROM stories WHERE loop_step_id = ? ORDER BY story_index ASC")
                .bind(loop_step_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(story_from_row).collect()
    }

    pub async fn stories_for_run(&self, run_id: &str) -> Result<Vec<StoryRecord>> {
        let rows = sqlx::query("SELECT * FROM stories WHERE run_id = ? ORDER BY story_index ASC")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(story_from_row).collect()
    }

    /// Stories currently `running` whose run is also `running` (medic scan).
    pub async fn running_stories(&self) -> Result<Vec<StoryRecord>> {
        let rows = sqlx::query(
            "SELECT st.* FROM stories st JOIN runs r ON r.id = st.run_id \
             WHERE st.status = 'running' AND r.status = 'running'",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(story_from_row).collect()
    }

    pub async fn events_for_run(&self, run_id: &str, limit: i64) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query("SELECT * FROM events WHERE run_id = ? ORDER BY id ASC LIMIT ?")
            .bind(run_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn medic_checks(&self, limit: i64) -> Result<Vec<MedicCheckRecord>> {
        let rows = sqlx::query("SELECT * FROM medic_checks ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(medic_check_from_row).collect()
    }

    pub async fn snapshot_run(&self, run_id: &str) -> Result<Option<RunSnapshot>> {
        let Some(run) = self.run(run_id).await? else {
            return Ok(None);
        };
        Ok(Some(RunSnapshot {
            steps: self.steps_for_run(run_id).await?,
            stories: self.stories_for_run(run_id).await?,
            run,
        }))
    }

    // ------------------------------------------------------------------
    // Claim selection
    // ------------------------------------------------------------------

    const ELIGIBLE_STEP_SQL: &'static str =
        "SELECT s.id AS unit_id, s.run_id, s.step_index, r.created_at AS run_created_at \
         FROM steps s JOIN runs r ON r.id = s.run_id \
         WHERE s.status = 'pending' AND s.step_type = 'single' \
           AND s.agent_id = ?1 AND r.status = 'running' \
         ORDER BY r.created_at ASC, r.id ASC, s.step_index ASC \
         LIMIT 1";

    const ELIGIBLE_STORY_SQL: &'static str =
        "SELECT st.id AS unit_id, st.run_id, st.story_index, s.step_index, \
                r.created_at AS run_created_at \
         FROM stories st \
         JOIN steps s ON s.id = st.loop_step_id \
         JOIN runs r ON r.id = st.run_id \
         WHERE st.status = 'pending' AND r.status = 'running' AND ( \
               (st.phase = 'work' AND s.agent_id = ?1) \
            OR (st.phase = 'verify' \
                AND json_extract(s.loop_config, '$.verify.agent') = ?1)) \
         ORDER BY r.created_at ASC, r.id ASC, s.step_index ASC, st.story_index ASC \
         LIMIT 1";

    /// Pure read behind `peek`: is there any unclaimed unit for this role?
    pub async fn has_work_for_role(&self, role: &str) -> Result<bool> {
        Ok(self.next_eligible_unit(role).await?.is_some())
    }

    /// Highest-priority eligible unit for a role, FIFO over runs and
    /// deterministic within a run. Selection is a read; the caller must
    /// follow up with [`Store::claim_step`] / [`Store::claim_story`] and
    /// retry when the compare-and-swap loses.
    pub async fn next_eligible_unit(&self, role: &str) -> Result<Option<ClaimCandidate>> {
        let step = sqlx::query(Self::ELIGIBLE_STEP_SQL)
            .bind(role)
            .fetch_optional(&self.pool)
            .await?;
        let step = step
            .map(|r| -> Result<ClaimCandidate> {
                Ok(ClaimCandidate {
                    unit_id: r.try_get("unit_id")?,
                    is_story: false,
                    run_created_at: parse_ts(&r.try_get::<String, _>("run_created_at")?)?,
                    run_id: r.try_get("run_id")?,
                    step_index: r.try_get("step_index")?,
                    story_index: -1,
                })
            })
            .transpose()?;

        let story = sqlx::query(Self::ELIGIBLE_STORY_SQL)
            .bind(role)
            .fetch_optional(&self.pool)
            .await?;
        let story = story
            .map(|r| -> Result<ClaimCandidate> {
                Ok(ClaimCandidate {
                    unit_id: r.try_get("unit_id")?,
                    is_story: true,
                    run_created_at: parse_ts(&r.try_get::<String, _>("run_created_at")?)?,
                    run_id: r.try_get("run_id")?,
                    step_index: r.try_get("step_index")?,
                    story_index: r.try_get("story_index")?,
                })
            })
            .transpose()?;

        Ok(match (step, story) {
            (Some(a), Some(b)) => {
                if a.ordering_key() <= b.ordering_key() {
                    Some(a)
                } else {
                    Some(b)
                }
            }
            (a, b) => a.or(b),
        })
    }

    // ------------------------------------------------------------------
    // Compound transactions
    // ------------------------------------------------------------------

    /// Create a run with its steps; the first step starts `pending`, the
    /// rest `waiting`.
    pub async fn seed_run(
        &self,
        workflow_id: &str,
        task: &str,
        meta: BTreeMap<String, Value>,
        steps: Vec<NewStep>,
        now: DateTime<Utc>,
    ) -> Result<RunRecord> {
        let run_id = Uuid::new_v4().to_string();
        let ts = now.to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO runs (id, workflow_id, task, status, created_at, updated_at, meta) \
             VALUES (?, ?, ?, 'running', ?, ?, ?)",
        )
        .bind(&run_id)
        .bind(workflow_id)
        .bind(task)
        .bind(&ts)
        .bind(&ts)
        .bind(serde_json::to_string(&meta)?)
        .execute(&mut *tx)
        .await?;

        for step in &steps {
            let status = if step.step_index == 0 {
                StepStatus::Pending
            } else {
                StepStatus::Waiting
            };
            sqlx::query(
                "INSERT INTO steps (id, run_id, step_index, step_id, agent_id, step_type, \
                                    status, updated_at, input, outputs, loop_config) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&step.id)
            .bind(&run_id)
            .bind(step.step_index)
            .bind(&step.step_id)
            .bind(&step.agent_id)
            .bind(step.step_type.as_str())
            .bind(status.as_str())
            .bind(&ts)
            .bind(&step.input)
            .bind(serde_json::to_string(&step.outputs)?)
            .bind(
                step.loop_config
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            )
            .execute(&mut *tx)
            .await?;
        }

        append_event(&mut tx, now, "run.created", &run_id, None, workflow_id).await?;
        if let Some(first) = steps.first() {
            append_event(&mut tx, now, "step.pending", &run_id, Some(&first.step_id), "").await?;
        }
        tx.commit().await?;

        self.run(&run_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("seeded run {run_id} not found")))
    }

    /// Atomically mark a pending step `running` and store its resolved
    /// input. Returns false when the step was claimed or reset elsewhere in
    /// the meantime.
    pub async fn claim_step(
        &self,
        step_row_id: &str,
        resolved_input: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query(
            "UPDATE steps SET status = 'running', input = ?, updated_at = ? \
             WHERE id = ? AND status = 'pending' AND step_type = 'single'",
        )
        .bind(resolved_input)
        .bind(now.to_rfc3339())
        .bind(step_row_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if changed != 1 {
            return Ok(false);
        }
        let (run_id, step_id) = step_identity(&mut tx, step_row_id).await?;
        append_event(&mut tx, now, "step.claimed", &run_id, Some(&step_id), "").await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Atomically mark a pending story `running`. The stored input stays the
    /// story's seed instruction; the resolved prompt handed to the agent is
    /// rebuilt on every claim.
    pub async fn claim_story(&self, story_row_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query(
            "UPDATE stories SET status = 'running', updated_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now.to_rfc3339())
        .bind(story_row_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if changed != 1 {
            return Ok(false);
        }
        let story = fetch_story(&mut tx, story_row_id).await?;
        sqlx::query("UPDATE steps SET current_story_id = ?, updated_at = ? WHERE id = ?")
            .bind(&story.id)
            .bind(now.to_rfc3339())
            .bind(&story.loop_step_id)
            .execute(&mut *tx)
            .await?;
        append_event(
            &mut tx,
            now,
            "story.claimed",
            &story.run_id,
            Some(&story.story_id),
            story.phase.as_str(),
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Complete a running single step and advance the cursor, all in one
    /// transaction. `next_stories` carries the parsed `STORIES_JSON` records
    /// when the next step is a loop (None when parsing failed; the caller
    /// then walks the loop step through its failure cycle).
    pub async fn complete_step_and_advance(
        &self,
        step_row_id: &str,
        raw_output: &str,
        next_stories: Option<Vec<NewStory>>,
        now: DateTime<Utc>,
    ) -> Result<StepAdvance> {
        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query(
            "UPDATE steps SET status = 'done', output = ?, updated_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(raw_output)
        .bind(now.to_rfc3339())
        .bind(step_row_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if changed != 1 {
            return Ok(StepAdvance::AlreadyApplied);
        }
        let step = fetch_step(&mut tx, step_row_id).await?;
        append_event(&mut tx, now, "step.completed", &step.run_id, Some(&step.step_id), "").await?;
        let advance = advance_tail(&mut tx, &step, next_stories, now).await?;
        tx.commit().await?;
        Ok(advance)
    }

    /// Advance past a step that is already `done` (a drained loop). Same
    /// tail as [`Store::complete_step_and_advance`] without the completion.
    pub async fn advance_past_step(
        &self,
        step_row_id: &str,
        next_stories: Option<Vec<NewStory>>,
        now: DateTime<Utc>,
    ) -> Result<StepAdvance> {
        let mut tx = self.pool.begin().await?;
        let step = fetch_step(&mut tx, step_row_id).await?;
        if step.status != StepStatus::Done {
            return Ok(StepAdvance::AlreadyApplied);
        }
        let advance = advance_tail(&mut tx, &step, next_stories, now).await?;
        tx.commit().await?;
        Ok(advance)
    }

    /// Agent-reported (or parse-induced) failure of a step. Below the retry
    /// budget the step returns to `pending`; at the budget the step and its
    /// run are failed.
    pub async fn fail_step(
        &self,
        step_row_id: &str,
        reason: &str,
        budget: u32,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        let mut tx = self.pool.begin().await?;
        let step = fetch_step(&mut tx, step_row_id).await?;
        if !matches!(step.status, StepStatus::Running | StepStatus::Pending) {
            return Ok(FailOutcome::AlreadyApplied);
        }
        let retry_count = step.retry_count + 1;
        let ts = now.to_rfc3339();
        let exhausted = retry_count >= i64::from(budget);
        let status = if exhausted {
            StepStatus::Failed
        } else {
            StepStatus::Pending
        };
        sqlx::query("UPDATE steps SET status = ?, retry_count = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(retry_count)
            .bind(&ts)
            .bind(step_row_id)
            .execute(&mut *tx)
            .await?;
        append_event(
            &mut tx,
            now,
            "step.fail",
            &step.run_id,
            Some(&step.step_id),
            &format!("attempt {retry_count}/{budget}: {reason}"),
        )
        .await?;
        if exhausted {
            fail_run(&mut tx, &step.run_id, &format!("step {} exhausted retries", step.step_id), now)
                .await?;
        }
        tx.commit().await?;
        Ok(if exhausted {
            FailOutcome::Exhausted
        } else {
            FailOutcome::Retrying { retry_count }
        })
    }

    /// A loop worker finished a story. With verification required the story
    /// moves to `pending`/`verify` for the verifier role; otherwise it is
    /// `verified` outright.
    pub async fn story_work_done(
        &self,
        story_row_id: &str,
        raw_output: &str,
        needs_verify: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let (status, phase) = if needs_verify {
            (StoryStatus::Pending, StoryPhase::Verify)
        } else {
            (StoryStatus::Verified, StoryPhase::Work)
        };
        let changed = sqlx::query(
            "UPDATE stories SET status = ?, phase = ?, output = ?, updated_at = ? \
             WHERE id = ? AND status = 'running' AND phase = 'work'",
        )
        .bind(status.as_str())
        .bind(phase.as_str())
        .bind(raw_output)
        .bind(now.to_rfc3339())
        .bind(story_row_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if changed != 1 {
            return Ok(false);
        }
        let story = fetch_story(&mut tx, story_row_id).await?;
        clear_current_story(&mut tx, &story, now).await?;
        let kind = if needs_verify {
            "story.completed"
        } else {
            "story.verified"
        };
        append_event(&mut tx, now, kind, &story.run_id, Some(&story.story_id), "").await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Verifier accepted a story.
    pub async fn story_verified(&self, story_row_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query(
            "UPDATE stories SET status = 'verified', updated_at = ? \
             WHERE id = ? AND status = 'running' AND phase = 'verify'",
        )
        .bind(now.to_rfc3339())
        .bind(story_row_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if changed != 1 {
            return Ok(false);
        }
        let story = fetch_story(&mut tx, story_row_id).await?;
        clear_current_story(&mut tx, &story, now).await?;
        append_event(&mut tx, now, "story.verified", &story.run_id, Some(&story.story_id), "")
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Story failure from either phase: worker fail, verifier rejection, or
    /// missing required outputs. The story's own retry budget governs; at
    /// the bound the story, its loop step and the run are all failed.
    pub async fn fail_story(
        &self,
        story_row_id: &str,
        reason: &str,
        budget: u32,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        let mut tx = self.pool.begin().await?;
        let story = fetch_story(&mut tx, story_row_id).await?;
        if !matches!(story.status, StoryStatus::Running | StoryStatus::Pending) {
            return Ok(FailOutcome::AlreadyApplied);
        }
        let retry_count = story.retry_count + 1;
        let ts = now.to_rfc3339();
        let exhausted = retry_count >= i64::from(budget);
        if exhausted {
            sqlx::query(
                "UPDATE stories SET status = 'failed', retry_count = ?, updated_at = ? WHERE id = ?",
            )
            .bind(retry_count)
            .bind(&ts)
            .bind(story_row_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE stories SET status = 'pending', phase = 'work', retry_count = ?, \
                 updated_at = ? WHERE id = ?",
            )
            .bind(retry_count)
            .bind(&ts)
            .bind(story_row_id)
            .execute(&mut *tx)
            .await?;
        }
        clear_current_story(&mut tx, &story, now).await?;
        append_event(
            &mut tx,
            now,
            "story.fail",
            &story.run_id,
            Some(&story.story_id),
            &format!("attempt {retry_count}/{budget}: {reason}"),
        )
        .await?;
        if exhausted {
            let loop_step = fetch_step(&mut tx, &story.loop_step_id).await?;
            sqlx::query(
                "UPDATE steps SET status = 'failed', updated_at = ? \
                 WHERE id = ? AND status IN ('pending', 'running')",
            )
            .bind(&ts)
            .bind(&story.loop_step_id)
            .execute(&mut *tx)
            .await?;
            append_event(
                &mut tx,
                now,
                "step.fail",
                &story.run_id,
                Some(&loop_step.step_id),
                &format!("story {} exhausted retries", story.story_id),
            )
            .await?;
            fail_run(
                &mut tx,
                &story.run_id,
                &format!("story {} exhausted retries", story.story_id),
                now,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(if exhausted {
            FailOutcome::Exhausted
        } else {
            FailOutcome::Retrying { retry_count }
        })
    }

    /// Complete the loop step once every story is settled (`verified` or
    /// `skipped`) and advance the cursor. Returns None while stories remain
    /// or when another caller already finished the loop.
    pub async fn finish_loop_and_advance(
        &self,
        loop_step_row_id: &str,
        next_stories: Option<Vec<NewStory>>,
        now: DateTime<Utc>,
    ) -> Result<Option<StepAdvance>> {
        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query(
            "UPDATE steps SET status = 'done', current_story_id = NULL, updated_at = ? \
             WHERE id = ? AND status = 'pending' AND NOT EXISTS ( \
                 SELECT 1 FROM stories WHERE loop_step_id = ? \
                 AND status NOT IN ('verified', 'skipped'))",
        )
        .bind(now.to_rfc3339())
        .bind(loop_step_row_id)
        .bind(loop_step_row_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if changed != 1 {
            return Ok(None);
        }
        let step = fetch_step(&mut tx, loop_step_row_id).await?;
        append_event(&mut tx, now, "step.completed", &step.run_id, Some(&step.step_id), "").await?;
        let advance = advance_tail(&mut tx, &step, next_stories, now).await?;
        tx.commit().await?;
        Ok(Some(advance))
    }

    /// Medic: reset a stuck running step back to `pending`. At the abandon
    /// bound the step is failed instead (and the run with it). The retry
    /// counter is untouched; abandons are accounted separately.
    pub async fn reset_step(
        &self,
        step_row_id: &str,
        max_abandons: u32,
        now: DateTime<Utc>,
    ) -> Result<ResetOutcome> {
        let mut tx = self.pool.begin().await?;
        let step = fetch_step(&mut tx, step_row_id).await?;
        if step.status != StepStatus::Running {
            return Ok(ResetOutcome::AlreadyApplied);
        }
        let abandoned = step.abandoned_count + 1;
        let ts = now.to_rfc3339();
        let terminal = abandoned >= i64::from(max_abandons);
        let status = if terminal {
            StepStatus::Failed
        } else {
            StepStatus::Pending
        };
        sqlx::query("UPDATE steps SET status = ?, abandoned_count = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(abandoned)
            .bind(&ts)
            .bind(step_row_id)
            .execute(&mut *tx)
            .await?;
        append_event(
            &mut tx,
            now,
            "step.reset",
            &step.run_id,
            Some(&step.step_id),
            &format!("abandon {abandoned}/{max_abandons}"),
        )
        .await?;
        if terminal {
            fail_run(
                &mut tx,
                &step.run_id,
                &format!("step {} abandoned {abandoned} times", step.step_id),
                now,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(if terminal {
            ResetOutcome::Terminal
        } else {
            ResetOutcome::Reset {
                abandoned_count: abandoned,
            }
        })
    }

    /// Medic: reset an orphaned running story back to `pending` (same
    /// phase). At the abandon bound the story is skipped instead, removing
    /// it from the loop's work set.
    pub async fn reset_story(
        &self,
        story_row_id: &str,
        max_abandons: u32,
        now: DateTime<Utc>,
    ) -> Result<ResetOutcome> {
        let mut tx = self.pool.begin().await?;
        let story = fetch_story(&mut tx, story_row_id).await?;
        if story.status != StoryStatus::Running {
            return Ok(ResetOutcome::AlreadyApplied);
        }
        let abandoned = story.abandoned_count + 1;
        let ts = now.to_rfc3339();
        let terminal = abandoned >= i64::from(max_abandons);
        let status = if terminal {
            StoryStatus::Skipped
        } else {
            StoryStatus::Pending
        };
        sqlx::query(
            "UPDATE stories SET status = ?, abandoned_count = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(abandoned)
        .bind(&ts)
        .bind(story_row_id)
        .execute(&mut *tx)
        .await?;
        clear_current_story(&mut tx, &story, now).await?;
        let kind = if terminal { "story.skipped" } else { "story.reset" };
        append_event(
            &mut tx,
            now,
            kind,
            &story.run_id,
            Some(&story.story_id),
            &format!("abandon {abandoned}/{max_abandons}"),
        )
        .await?;
        tx.commit().await?;
        Ok(if terminal {
            ResetOutcome::Terminal
        } else {
            ResetOutcome::Reset {
                abandoned_count: abandoned,
            }
        })
    }

    /// Medic: a run declared running with nothing left to do is dead.
    pub async fn mark_run_failed(
        &self,
        run_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let failed = fail_run(&mut tx, run_id, reason, now).await?;
        tx.commit().await?;
        Ok(failed)
    }

    /// Medic: bring a failed run back. The lowest failed step returns to
    /// `pending` with a fresh retry budget; failed stories of that step are
    /// likewise revived. Resume bookkeeping lands in `meta`.
    pub async fn resume_run(&self, run_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let run = match fetch_run(&mut tx, run_id).await? {
            Some(run) => run,
            None => return Ok(false),
        };
        if run.status != RunStatus::Failed {
            return Ok(false);
        }
        let row = sqlx::query(
            "SELECT id, step_id FROM steps WHERE run_id = ? AND status = 'failed' \
             ORDER BY step_index ASC LIMIT 1",
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let step_row_id: String = row.try_get("id")?;
        let step_id: String = row.try_get("step_id")?;
        let ts = now.to_rfc3339();

        sqlx::query(
            "UPDATE steps SET status = 'pending', retry_count = 0, updated_at = ? WHERE id = ?",
        )
        .bind(&ts)
        .bind(&step_row_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE stories SET status = 'pending', phase = 'work', retry_count = 0, \
             updated_at = ? WHERE loop_step_id = ? AND status = 'failed'",
        )
        .bind(&ts)
        .bind(&step_row_id)
        .execute(&mut *tx)
        .await?;

        let mut meta = run.meta.clone();
        let resumes = run.meta_u32("resume_count") + 1;
        meta.insert("resume_count".into(), Value::from(resumes));
        meta.insert("last_resume_at".into(), Value::from(ts.clone()));
        sqlx::query("UPDATE runs SET status = 'running', meta = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&meta)?)
            .bind(&ts)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        append_event(
            &mut tx,
            now,
            "run.resumed",
            run_id,
            Some(&step_id),
            &format!("resume {resumes}"),
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Merge one key into a run's meta map (medic cooldown stamps).
    pub async fn set_run_meta(
        &self,
        run_id: &str,
        key: &str,
        value: Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let Some(run) = fetch_run(&mut tx, run_id).await? else {
            return Err(Error::NotFound(format!("run {run_id}")));
        };
        let mut meta = run.meta;
        meta.insert(key.to_string(), value);
        sqlx::query("UPDATE runs SET meta = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&meta)?)
            .bind(now.to_rfc3339())
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Standalone event append (transitions record theirs transactionally).
    pub async fn record_event(
        &self,
        kind: &str,
        run_id: &str,
        step_id: Option<&str>,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        append_event(&mut tx, now, kind, run_id, step_id, detail).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Append one medic audit row and prune to the retention bound.
    pub async fn record_medic_check(
        &self,
        issues_found: i64,
        actions_taken: i64,
        summary: &str,
        findings: &Value,
        retention: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO medic_checks (checked_at, issues_found, actions_taken, summary, findings) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(now.to_rfc3339())
        .bind(issues_found)
        .bind(actions_taken)
        .bind(summary)
        .bind(serde_json::to_string(findings)?)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM medic_checks WHERE id NOT IN \
             (SELECT id FROM medic_checks ORDER BY id DESC LIMIT ?)",
        )
        .bind(i64::from(retention))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
impl Store {
    /// Test-only escape hatch to fabricate drift (e.g. crash leftovers)
    /// that no store operation produces.
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Transaction helpers
// ----------------------------------------------------------------------

/// Activate the step after `step` (set it pending, seed loop stories),
/// or finish the run when `step` was the last. Runs inside the caller's
/// transaction.
async fn advance_tail(
    tx: &mut Transaction<'_, Sqlite>,
    step: &StepRecord,
    next_stories: Option<Vec<NewStory>>,
    now: DateTime<Utc>,
) -> Result<StepAdvance> {
    let ts = now.to_rfc3339();
    let next = sqlx::query("SELECT * FROM steps WHERE run_id = ? AND step_index = ?")
        .bind(&step.run_id)
        .bind(step.step_index + 1)
        .fetch_optional(&mut **tx)
        .await?;

    let Some(next) = next else {
        sqlx::query("UPDATE runs SET status = 'done', updated_at = ? WHERE id = ? AND status = 'running'")
            .bind(&ts)
            .bind(&step.run_id)
            .execute(&mut **tx)
            .await?;
        append_event(tx, now, "run.done", &step.run_id, None, "").await?;
        return Ok(StepAdvance::RunDone);
    };
    let next = step_from_row(&next)?;

    let changed = sqlx::query(
        "UPDATE steps SET status = 'pending', updated_at = ? WHERE id = ? AND status = 'waiting'",
    )
    .bind(&ts)
    .bind(&next.id)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    if changed != 1 {
        return Ok(StepAdvance::AlreadyApplied);
    }
    append_event(tx, now, "step.pending", &step.run_id, Some(&next.step_id), "").await?;

    if next.step_type == StepType::Loop {
        if let Some(stories) = next_stories {
            let count = stories.len();
            for (index, story) in stories.into_iter().enumerate() {
                sqlx::query(
                    "INSERT INTO stories (id, run_id, loop_step_id, story_id, story_index, \
                                          title, input, status, phase, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 'work', ?)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&step.run_id)
                .bind(&next.id)
                .bind(&story.story_id)
                .bind(index as i64)
                .bind(&story.title)
                .bind(&story.input)
                .bind(&ts)
                .execute(&mut **tx)
                .await?;
            }
            append_event(
                tx,
                now,
                "stories.seeded",
                &step.run_id,
                Some(&next.step_id),
                &count.to_string(),
            )
            .await?;
            if count == 0 {
                sqlx::query("UPDATE steps SET status = 'done', updated_at = ? WHERE id = ?")
                    .bind(&ts)
                    .bind(&next.id)
                    .execute(&mut **tx)
                    .await?;
                append_event(
                    tx,
                    now,
                    "step.completed",
                    &step.run_id,
                    Some(&next.step_id),
                    "empty loop",
                )
                .await?;
                let mut drained = next.clone();
                drained.status = StepStatus::Done;
                return Ok(StepAdvance::LoopDrained(drained));
            }
        }
    }

    let mut activated = next.clone();
    activated.status = StepStatus::Pending;
    Ok(StepAdvance::Activated(activated))
}

/// Fail a run in the caller's transaction; no-op when not running.
async fn fail_run(
    tx: &mut Transaction<'_, Sqlite>,
    run_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = sqlx::query(
        "UPDATE runs SET status = 'failed', updated_at = ? WHERE id = ? AND status = 'running'",
    )
    .bind(now.to_rfc3339())
    .bind(run_id)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    if changed == 1 {
        append_event(tx, now, "run.failed", run_id, None, reason).await?;
    }
    Ok(changed == 1)
}

/// Unpin the loop step's current story when it points at `story`.
async fn clear_current_story(
    tx: &mut Transaction<'_, Sqlite>,
    story: &StoryRecord,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE steps SET current_story_id = NULL, updated_at = ? \
         WHERE id = ? AND current_story_id = ?",
    )
    .bind(now.to_rfc3339())
    .bind(&story.loop_step_id)
    .bind(&story.id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn append_event(
    tx: &mut Transaction<'_, Sqlite>,
    now: DateTime<Utc>,
    kind: &str,
    run_id: &str,
    step_id: Option<&str>,
    detail: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO events (ts, kind, run_id, step_id, detail) VALUES (?, ?, ?, ?, ?)")
        .bind(now.to_rfc3339())
        .bind(kind)
        .bind(run_id)
        .bind(step_id)
        .bind(detail)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn fetch_run(tx: &mut Transaction<'_, Sqlite>, run_id: &str) -> Result<Option<RunRecord>> {
    let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
        .bind(run_id)
        .fetch_optional(&mut **tx)
        .await?;
    row.map(|r| run_from_row(&r)).transpose()
}

async fn fetch_step(tx: &mut Transaction<'_, Sqlite>, step_row_id: &str) -> Result<StepRecord> {
    let row = sqlx::query("SELECT * FROM steps WHERE id = ?")
        .bind(step_row_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("step {step_row_id}")))?;
    step_from_row(&row)
}

async fn fetch_story(tx: &mut Transaction<'_, Sqlite>, story_row_id: &str) -> Result<StoryRecord> {
    let row = sqlx::query("SELECT * FROM stories WHERE id = ?")
        .bind(story_row_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("story {story_row_id}")))?;
    story_from_row(&row)
}

async fn step_identity(
    tx: &mut Transaction<'_, Sqlite>,
    step_row_id: &str,
) -> Result<(String, String)> {
    let step = fetch_step(tx, step_row_id).await?;
    Ok((step.run_id, step.step_id))
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_meta(raw: &str) -> Result<BTreeMap<String, Value>> {
    serde_json::from_str(raw).map_err(|e| Error::Internal(format!("bad meta json: {e}")))
}

fn run_from_row(row: &SqliteRow) -> Result<RunRecord> {
    Ok(RunRecord {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        task: row.try_get("task")?,
        status: RunStatus::parse(&row.try_get::<String, _>("status")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
        meta: parse_meta(&row.try_get::<String, _>("meta")?)?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<StepRecord> {
    let loop_config: Option<String> = row.try_get("loop_config")?;
    let loop_config = loop_config
        .map(|raw| {
            serde_json::from_str::<LoopSpec>(&raw)
                .map_err(|e| Error::Internal(format!("bad loop config: {e}")))
        })
        .transpose()?;
    let outputs: String = row.try_get("outputs")?;
    let outputs: Vec<String> = serde_json::from_str(&outputs)
        .map_err(|e| Error::Internal(format!("bad outputs json: {e}")))?;
    Ok(StepRecord {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        step_index: row.try_get("step_index")?,
        step_id: row.try_get("step_id")?,
        agent_id: row.try_get("agent_id")?,
        step_type: StepType::parse(&row.try_get::<String, _>("step_type")?)?,
        status: StepStatus::parse(&row.try_get::<String, _>("status")?)?,
        retry_count: row.try_get("retry_count")?,
        abandoned_count: row.try_get("abandoned_count")?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
        input: row.try_get("input")?,
        output: row.try_get("output")?,
        outputs,
        loop_config,
        current_story_id: row.try_get("current_story_id")?,
    })
}

fn story_from_row(row: &SqliteRow) -> Result<StoryRecord> {
    Ok(StoryRecord {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        loop_step_id: row.try_get("loop_step_id")?,
        story_id: row.try_get("story_id")?,
        story_index: row.try_get("story_index")?,
        title: row.try_get("title")?,
        input: row.try_get("input")?,
        status: StoryStatus::parse(&row.try_get::<String, _>("status")?)?,
        phase: StoryPhase::parse(&row.try_get::<String, _>("phase")?)?,
        output: row.try_get("output")?,
        retry_count: row.try_get("retry_count")?,
        abandoned_count: row.try_get("abandoned_count")?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<EventRecord> {
    Ok(EventRecord {
        id: row.try_get("id")?,
        ts: parse_ts(&row.try_get::<String, _>("ts")?)?,
        kind: row.try_get("kind")?,
        run_id: row.try_get("run_id")?,
        step_id: row.try_get("step_id")?,
        detail: row.try_get("detail")?,
    })
}

fn medic_check_from_row(row: &SqliteRow) -> Result<MedicCheckRecord> {
    let findings: String = row.try_get("findings")?;
    Ok(MedicCheckRecord {
        id: row.try_get("id")?,
        checked_at: parse_ts(&row.try_get::<String, _>("checked_at")?)?,
        issues_found: row.try_get("issues_found")?,
        actions_taken: row.try_get("actions_taken")?,
        summary: row.try_get("summary")?,
        findings: serde_json::from_str(&findings)
            .map_err(|e| Error::Internal(format!("bad findings json: {e}")))?,
    })
}
