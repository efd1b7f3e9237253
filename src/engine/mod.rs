//! Workflow execution engine
//!
//! The engine wires the claim protocol, step advancement and loop fan-out on
//! top of the store's compound transactions. It is constructed per command
//! invocation; all durable state lives in the store, so concurrent engine
//! instances (one per agent CLI call) coordinate purely through the
//! database's guarded transitions.

pub mod claim;
pub mod interpolate;
pub mod output;
pub mod step;
pub mod stories;

pub use claim::Claimed;
pub use output::{parse_stories, OutputMap};

use crate::app::Settings;
use crate::error::{Error, Result};
use crate::events;
use crate::storage::{RunRecord, RunStatus, Store};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::{info, warn};

/// Result of a `complete` call, as seen by the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum CompleteOutcome {
    /// Output accepted; the unit is terminal and the pipeline advanced.
    Accepted,
    /// Required output keys were missing; the failure cycle was applied.
    Rejected { reason: String },
    /// No-op: the unit was already terminal, its run is over, or another
    /// caller won the race. Reported as success to the agent.
    Ignored { reason: String },
}

pub struct Engine {
    store: Store,
    settings: Settings,
    runs_dir: Option<PathBuf>,
}

impl Engine {
    pub fn new(store: Store, settings: Settings) -> Self {
        Self {
            store,
            settings,
            runs_dir: None,
        }
    }

    /// Enable the JSON-per-run archive under `runs_dir`.
    pub fn with_runs_dir(mut self, runs_dir: PathBuf) -> Self {
        self.runs_dir = Some(runs_dir);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Pure read: is there an unclaimed unit for this role anywhere?
    pub async fn peek(&self, role: &str) -> Result<bool> {
        self.store.has_work_for_role(role).await
    }

    /// Report an agent's output for a claimed unit. Dispatches on the unit
    /// kind; completing an already-terminal unit is a logged no-op.
    pub async fn complete(
        &self,
        unit_id: &str,
        raw_output: &str,
        now: DateTime<Utc>,
    ) -> Result<CompleteOutcome> {
        if let Some(step_record) = self.store.step(unit_id).await? {
            return self.complete_step(step_record, raw_output, now).await;
        }
        if let Some(story) = self.store.story(unit_id).await? {
            return self.complete_story(story, raw_output, now).await;
        }
        Err(Error::NotFound(format!("unit {unit_id}")))
    }

    /// Report an agent-side failure for a claimed unit.
    pub async fn fail(&self, unit_id: &str, reason: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(step_record) = self.store.step(unit_id).await? {
            return self.fail_step(step_record, reason, now).await;
        }
        if let Some(story) = self.store.story(unit_id).await? {
            return self.fail_story(story, reason, now).await;
        }
        Err(Error::NotFound(format!("unit {unit_id}")))
    }

    /// Effective retry budget for a run (workflow override or default).
    pub(crate) fn budget_for(&self, run: &RunRecord) -> u32 {
        match run.meta_u32("retry_budget") {
            0 => self.settings.retry_budget,
            budget => budget,
        }
    }

    /// Guard shared by complete/fail paths: mutations against a run that is
    /// no longer running are accepted but ignored.
    pub(crate) async fn run_if_active(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let run = self
            .store
            .run(run_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("unit references unknown run {run_id}")))?;
        if run.status != RunStatus::Running {
            info!("ignoring report for run {run_id}: run is {}", run.status);
            return Ok(None);
        }
        Ok(Some(run))
    }

    /// Mirror a run that just reached a terminal state to the JSON archive.
    pub(crate) async fn archive_if_terminal(&self, run_id: &str) -> Result<()> {
        let Some(runs_dir) = &self.runs_dir else {
            return Ok(());
        };
        match self.store.snapshot_run(run_id).await? {
            Some(snapshot) if snapshot.run.status != RunStatus::Running => {
                events::archive_run(runs_dir, &snapshot);
            }
            Some(_) => {}
            None => warn!("cannot archive unknown run {run_id}"),
        }
        Ok(())
    }
}
