//! Persistent entity records and their state machines.
//!
//! Every status enum round-trips through the wire/database string form; an
//! unknown string coming back from the store is an invariant violation and
//! surfaces as `Error::Internal`.

use crate::error::{Error, Result};
use crate::workflow::LoopSpec;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Done,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "done" => Ok(RunStatus::Done),
            "failed" => Ok(RunStatus::Failed),
            other => Err(Error::Internal(format!("unknown run status {other:?}"))),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Waiting,
    Pending,
    Running,
    Done,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Waiting => "waiting",
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(StepStatus::Waiting),
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "done" => Ok(StepStatus::Done),
            "failed" => Ok(StepStatus::Failed),
            other => Err(Error::Internal(format!("unknown step status {other:?}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Single,
    Loop,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Single => "single",
            StepType::Loop => "loop",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "single" => Ok(StepType::Single),
            "loop" => Ok(StepType::Loop),
            other => Err(Error::Internal(format!("unknown step type {other:?}"))),
        }
    }
}

/// Story lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    Running,
    Verified,
    Failed,
    Skipped,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryStatus::Pending => "pending",
            StoryStatus::Running => "running",
            StoryStatus::Verified => "verified",
            StoryStatus::Failed => "failed",
            StoryStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(StoryStatus::Pending),
            "running" => Ok(StoryStatus::Running),
            "verified" => Ok(StoryStatus::Verified),
            "failed" => Ok(StoryStatus::Failed),
            "skipped" => Ok(StoryStatus::Skipped),
            other => Err(Error::Internal(format!("unknown story status {other:?}"))),
        }
    }

    /// Terminal states that count toward loop completion.
    pub fn is_settled(&self) -> bool {
        matches!(self, StoryStatus::Verified | StoryStatus::Skipped)
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which role a pending/running story is currently served to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryPhase {
    Work,
    Verify,
}

impl StoryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryPhase::Work => "work",
            StoryPhase::Verify => "verify",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "work" => Ok(StoryPhase::Work),
            "verify" => Ok(StoryPhase::Verify),
            other => Err(Error::Internal(format!("unknown story phase {other:?}"))),
        }
    }
}

/// An execution of one workflow against a task description.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub workflow_id: String,
    pub task: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Opaque key/value bookkeeping (medic resume counters, config snapshots).
    pub meta: BTreeMap<String, Value>,
}

impl RunRecord {
    pub fn meta_u32(&self, key: &str) -> u32 {
        self.meta
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }

    pub fn meta_time(&self, key: &str) -> Option<DateTime<Utc>> {
        let raw = self.meta.get(key)?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// One stage of a run.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub id: String,
    pub run_id: String,
    pub step_index: i64,
    pub step_id: String,
    pub agent_id: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub retry_count: i64,
    pub abandoned_count: i64,
    pub updated_at: DateTime<Utc>,
    /// Input template at seed time, overwritten with the resolved prompt on
    /// first claim.
    pub input: String,
    /// Raw text block returned by the agent.
    pub output: Option<String>,
    /// Required output keys snapshot from the workflow spec.
    pub outputs: Vec<String>,
    pub loop_config: Option<LoopSpec>,
    /// Story presently claimed by any worker (loop steps only).
    pub current_story_id: Option<String>,
}

/// A unit of work inside a loop step.
#[derive(Debug, Clone, Serialize)]
pub struct StoryRecord {
    pub id: String,
    pub run_id: String,
    pub loop_step_id: String,
    pub story_id: String,
    pub story_index: i64,
    pub title: String,
    pub input: String,
    pub status: StoryStatus,
    pub phase: StoryPhase,
    pub output: Option<String>,
    pub retry_count: i64,
    pub abandoned_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Append-only transition log entry.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub run_id: String,
    pub step_id: Option<String>,
    pub detail: String,
}

/// Audit row for one medic pass.
#[derive(Debug, Clone, Serialize)]
pub struct MedicCheckRecord {
    pub id: i64,
    pub checked_at: DateTime<Utc>,
    pub issues_found: i64,
    pub actions_taken: i64,
    pub summary: String,
    pub findings: Value,
}

/// Seed row for a step, prepared by the engine from the workflow spec.
#[derive(Debug, Clone)]
pub struct NewStep {
    pub id: String,
    pub step_index: i64,
    pub step_id: String,
    pub agent_id: String,
    pub step_type: StepType,
    pub input: String,
    pub outputs: Vec<String>,
    pub loop_config: Option<LoopSpec>,
}

/// Seed row for a story, extracted from a `STORIES_JSON` record.
#[derive(Debug, Clone)]
pub struct NewStory {
    pub story_id: String,
    pub title: String,
    pub input: String,
}
