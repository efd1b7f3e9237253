//! Claim protocol: atomic select-and-mark of the next unit for a role.
//!
//! Selection is FIFO over runs and deterministic within a run; the actual
//! reservation is a guarded compare-and-swap in the store, so two
//! simultaneous claims for one role either get different units or one sees
//! `NO_WORK`. A lost swap simply re-runs the selection.

use super::Engine;
use crate::engine::{interpolate, output::OutputMap};
use crate::error::{Error, Result};
use crate::storage::{StepRecord, StepStatus, StoryPhase, StoryRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// Bound on select-then-swap retries within one claim call. Losing this many
/// races in a row just means the role is saturated; the agent exits and the
/// next cron tick tries again.
const CLAIM_ATTEMPTS: usize = 16;

/// Wire shape of a successful claim: `{stepId, runId, input}` for steps,
/// `{storyId, runId, input}` for stories. The id doubles as the unit id for
/// the later `complete`/`fail` call.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Claimed {
    #[serde(rename_all = "camelCase")]
    Step {
        step_id: String,
        run_id: String,
        input: String,
    },
    #[serde(rename_all = "camelCase")]
    Story {
        story_id: String,
        run_id: String,
        input: String,
    },
}

impl Engine {
    /// Atomically claim the highest-priority eligible unit for `role`,
    /// returning its fully resolved input. None means `NO_WORK`.
    pub async fn claim(&self, role: &str, now: DateTime<Utc>) -> Result<Option<Claimed>> {
        for _ in 0..CLAIM_ATTEMPTS {
            let Some(candidate) = self.store().next_eligible_unit(role).await? else {
                return Ok(None);
            };
            if candidate.is_story {
                let Some(story) = self.store().story(&candidate.unit_id).await? else {
                    continue;
                };
                let input = self.resolve_story_input(&story).await?;
                if self.store().claim_story(&story.id, now).await? {
                    debug!("claimed story {} for {role}", story.story_id);
                    return Ok(Some(Claimed::Story {
                        story_id: story.id,
                        run_id: story.run_id,
                        input,
                    }));
                }
            } else {
                let Some(step) = self.store().step(&candidate.unit_id).await? else {
                    continue;
                };
                let input = self.resolve_step_input(&step).await?;
                if self.store().claim_step(&step.id, &input, now).await? {
                    debug!("claimed step {} for {role}", step.step_id);
                    return Ok(Some(Claimed::Step {
                        step_id: step.id,
                        run_id: step.run_id,
                        input,
                    }));
                }
            }
            // lost the swap; select again
        }
        Ok(None)
    }

    /// Resolve a step's input template against run variables and the
    /// declared outputs of earlier completed steps.
    async fn resolve_step_input(&self, step: &StepRecord) -> Result<String> {
        let vars = self.collect_run_vars(&step.run_id, step.step_index).await?;
        Ok(interpolate::resolve(&step.input, &vars))
    }

    /// Resolve a story's prompt. Work phase wraps the story instruction in
    /// the loop step's template; verify phase uses the verifier template
    /// with the worker's declared outputs in scope.
    async fn resolve_story_input(&self, story: &StoryRecord) -> Result<String> {
        let step = self
            .store()
            .step(&story.loop_step_id)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!("story {} has no loop step", story.story_id))
            })?;
        let mut vars = self.collect_run_vars(&story.run_id, step.step_index).await?;
        vars.insert("STORY_ID".into(), story.story_id.clone());
        vars.insert("STORY_TITLE".into(), story.title.clone());
        vars.insert("STORY_INDEX".into(), story.story_index.to_string());
        vars.insert("STORY_INPUT".into(), story.input.clone());

        let template = match story.phase {
            StoryPhase::Work => non_empty_or(&step.input, "${STORY_INPUT}"),
            StoryPhase::Verify => {
                let verify = step
                    .loop_config
                    .as_ref()
                    .and_then(|cfg| cfg.verify.as_ref())
                    .ok_or_else(|| {
                        Error::Internal(format!(
                            "story {} awaits verification but the loop has no verify spec",
                            story.story_id
                        ))
                    })?;
                if let Some(raw) = &story.output {
                    vars.insert("STORY_OUTPUT".into(), raw.clone());
                    let parsed = OutputMap::parse(raw);
                    for key in &step.outputs {
                        if let Some(value) = parsed.get(key) {
                            vars.insert(key.clone(), value.to_string());
                        }
                    }
                }
                non_empty_or(&verify.input, "${STORY_OUTPUT}")
            }
        };
        Ok(interpolate::resolve(&template, &vars))
    }

    /// Run-level variables plus declared outputs of steps completed before
    /// `before_index`; later steps shadow earlier ones.
    async fn collect_run_vars(
        &self,
        run_id: &str,
        before_index: i64,
    ) -> Result<HashMap<String, String>> {
        let run = self
            .store()
            .run(run_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("unknown run {run_id}")))?;
        let mut vars = HashMap::new();
        vars.insert("TASK".into(), run.task.clone());
        vars.insert("RUN_ID".into(), run.id.clone());
        vars.insert("WORKFLOW_ID".into(), run.workflow_id.clone());

        for step in self.store().steps_for_run(run_id).await? {
            if step.step_index >= before_index || step.status != StepStatus::Done {
                continue;
            }
            let Some(raw) = &step.output else { continue };
            let parsed = OutputMap::parse(raw);
            for key in &step.outputs {
                if let Some(value) = parsed.get(key) {
                    vars.insert(key.clone(), value.to_string());
                }
            }
        }
        Ok(vars)
    }
}

fn non_empty_or(template: &str, fallback: &str) -> String {
    if template.trim().is_empty() {
        fallback.to_string()
    } else {
        template.to_string()
    }
}
