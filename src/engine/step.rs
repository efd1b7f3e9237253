//! Step engine: run seeding, completion, failure cycles and cursor
//! advancement.
//!
//! Advancement never skips a step. Completing step N activates step N+1 (and
//! seeds its stories when it is a loop); completing the last step finishes
//! the run. A loop activated with an unparseable `STORIES_JSON` source is
//! walked through its failure cycle on the spot, since retrying a
//! deterministic parse cannot succeed.

use super::{CompleteOutcome, Engine};
use crate::engine::output::{self, OutputMap};
use crate::error::{Error, Result};
use crate::storage::{
    FailOutcome, NewStep, NewStory, RunRecord, StepAdvance, StepRecord, StepStatus,
};
use crate::workflow::{StepKind, WorkflowSpec};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Stories prepared for the next step, when it is a loop.
pub(crate) enum NextStories {
    /// Next step is single (or the run is over): nothing to seed.
    NotLoop,
    /// Parsed story seeds, in declared order (possibly empty).
    Seeds(Vec<NewStory>),
    /// The source output could not be parsed; the loop step must fail.
    ParseFailed(String),
}

impl NextStories {
    pub(crate) fn into_parts(self) -> (Option<Vec<NewStory>>, Option<String>) {
        match self {
            NextStories::NotLoop => (None, None),
            NextStories::Seeds(seeds) => (Some(seeds), None),
            NextStories::ParseFailed(reason) => (None, Some(reason)),
        }
    }
}

impl Engine {
    /// Seed a run from a workflow spec: all steps `waiting` except the
    /// first, workflow overrides snapshotted into the run's meta so the run
    /// stays immutable under later spec edits.
    pub async fn start_run(
        &self,
        spec: &WorkflowSpec,
        task: &str,
        now: DateTime<Utc>,
    ) -> Result<RunRecord> {
        spec.validate()?;
        if task.trim().is_empty() {
            return Err(Error::BadInput("task description must not be empty".into()));
        }
        let steps = spec
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| NewStep {
                id: Uuid::new_v4().to_string(),
                step_index: index as i64,
                step_id: step.id.clone(),
                agent_id: step.agent.clone(),
                step_type: match step.kind {
                    StepKind::Single => crate::storage::StepType::Single,
                    StepKind::Loop(_) => crate::storage::StepType::Loop,
                },
                input: step.input.clone(),
                outputs: step.outputs.clone(),
                loop_config: step.loop_spec().cloned(),
            })
            .collect();

        let mut meta = BTreeMap::new();
        if let Some(budget) = spec.retry_budget {
            meta.insert("retry_budget".to_string(), Value::from(budget));
        }
        if let Some(timeout) = spec.max_role_timeout {
            meta.insert(
                "max_role_timeout_secs".to_string(),
                Value::from(timeout.as_secs()),
            );
        }

        let run = self.store().seed_run(&spec.id, task, meta, steps, now).await?;
        info!("started run {} of workflow {}", run.id, spec.id);
        Ok(run)
    }

    pub(crate) async fn complete_step(
        &self,
        step: StepRecord,
        raw_output: &str,
        now: DateTime<Utc>,
    ) -> Result<CompleteOutcome> {
        let Some(run) = self.run_if_active(&step.run_id).await? else {
            return Ok(CompleteOutcome::Ignored {
                reason: "run is no longer running".into(),
            });
        };
        if step.status.is_terminal() {
            // idempotent completion
            return Ok(CompleteOutcome::Ignored {
                reason: format!("step already {}", step.status),
            });
        }
        if step.status != StepStatus::Running {
            warn!(
                "completion for step {} in state {}; treating as conflict",
                step.step_id, step.status
            );
            return Ok(CompleteOutcome::Ignored {
                reason: format!("step is {}", step.status),
            });
        }

        let parsed = OutputMap::parse(raw_output);
        if let Err(e) = parsed.require(&step.outputs) {
            let reason = e.to_string();
            self.store()
                .fail_step(&step.id, &reason, self.budget_for(&run), now)
                .await?;
            self.archive_if_terminal(&step.run_id).await?;
            return Ok(CompleteOutcome::Rejected { reason });
        }

        let steps = self.store().steps_for_run(&step.run_id).await?;
        let next = self
            .prepare_next_stories(&steps, step.step_index, Some((&step.id, raw_output)))
            .await?;
        let (seeds, parse_failure) = next.into_parts();
        let advance = self
            .store()
            .complete_step_and_advance(&step.id, raw_output, seeds, now)
            .await?;
        self.handle_advance(&run, advance, parse_failure, now).await?;
        Ok(CompleteOutcome::Accepted)
    }

    pub(crate) async fn fail_step(
        &self,
        step: StepRecord,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(run) = self.run_if_active(&step.run_id).await? else {
            return Ok(());
        };
        let outcome = self
            .store()
            .fail_step(&step.id, reason, self.budget_for(&run), now)
            .await?;
        if matches!(outcome, FailOutcome::Exhausted) {
            self.archive_if_terminal(&step.run_id).await?;
        }
        Ok(())
    }

    /// Apply the result of an advancement, chaining past drained loops and
    /// walking a loop with a broken source through its failure cycle.
    pub(crate) async fn handle_advance(
        &self,
        run: &RunRecord,
        mut advance: StepAdvance,
        mut parse_failure: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        loop {
            match advance {
                StepAdvance::RunDone => {
                    self.archive_if_terminal(&run.id).await?;
                    return Ok(());
                }
                StepAdvance::AlreadyApplied => return Ok(()),
                StepAdvance::Activated(next) => {
                    if let Some(reason) = parse_failure {
                        self.exhaust_step(&next, &reason, run, now).await?;
                    }
                    return Ok(());
                }
                StepAdvance::LoopDrained(drained) => {
                    let steps = self.store().steps_for_run(&run.id).await?;
                    let next = self
                        .prepare_next_stories(&steps, drained.step_index, None)
                        .await?;
                    let (seeds, failure) = next.into_parts();
                    parse_failure = failure;
                    advance = self.store().advance_past_step(&drained.id, seeds, now).await?;
                }
            }
        }
    }

    /// Deterministic failures (unparseable `STORIES_JSON`) cannot be fixed
    /// by re-running the same step, so burn the whole retry budget at once,
    /// emitting one failure cycle per attempt.
    async fn exhaust_step(
        &self,
        step: &StepRecord,
        reason: &str,
        run: &RunRecord,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let budget = self.budget_for(run);
        loop {
            match self.store().fail_step(&step.id, reason, budget, now).await? {
                FailOutcome::Retrying { .. } => continue,
                FailOutcome::Exhausted => {
                    self.archive_if_terminal(&run.id).await?;
                    return Ok(());
                }
                FailOutcome::AlreadyApplied => return Ok(()),
            }
        }
    }

    /// When the step after `from_index` is a loop, extract its story seeds
    /// from the source step's output. `just_completed` supplies the output
    /// of the step being completed in this call, which is not yet visible
    /// in the store.
    pub(crate) async fn prepare_next_stories(
        &self,
        steps: &[StepRecord],
        from_index: i64,
        just_completed: Option<(&str, &str)>,
    ) -> Result<NextStories> {
        let Some(next) = steps.iter().find(|s| s.step_index == from_index + 1) else {
            return Ok(NextStories::NotLoop);
        };
        let Some(cfg) = &next.loop_config else {
            return Ok(NextStories::NotLoop);
        };
        let Some(source) = steps.iter().find(|s| s.step_id == cfg.source) else {
            return Ok(NextStories::ParseFailed(format!(
                "loop source step {:?} not found in run",
                cfg.source
            )));
        };
        let completed_output =
            just_completed.and_then(|(id, raw)| (id == source.id).then_some(raw));
        let raw = match completed_output.or(source.output.as_deref()) {
            Some(raw) => raw,
            None => {
                return Ok(NextStories::ParseFailed(format!(
                    "loop source step {:?} has no output",
                    cfg.source
                )));
            }
        };
        match output::parse_stories(raw) {
            Ok(seeds) => Ok(NextStories::Seeds(seeds)),
            Err(e) => Ok(NextStories::ParseFailed(e.to_string())),
        }
    }
}
