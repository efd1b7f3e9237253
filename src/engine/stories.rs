//! Loop engine: story lifecycle inside a loop step.
//!
//! A loop step stays `pending` while its stories are dispatched, so the
//! claim protocol can serve several worker processes in parallel; the step
//! itself is never handed to an agent. With `verify_each` a story makes two
//! trips through the claim protocol: the worker role produces the work, the
//! verifier role accepts or rejects it. Rejection sends the story back to
//! the worker and charges the story's retry budget.

use super::{CompleteOutcome, Engine};
use crate::engine::output::OutputMap;
use crate::error::{Error, Result};
use crate::storage::{FailOutcome, StepRecord, StoryPhase, StoryRecord, StoryStatus};
use crate::workflow::LoopSpec;
use chrono::{DateTime, Utc};
use tracing::warn;

impl Engine {
    pub(crate) async fn complete_story(
        &self,
        story: StoryRecord,
        raw_output: &str,
        now: DateTime<Utc>,
    ) -> Result<CompleteOutcome> {
        if self.run_if_active(&story.run_id).await?.is_none() {
            // e.g. a sibling step failed the run while this agent worked
            return Ok(CompleteOutcome::Ignored {
                reason: "run is no longer running".into(),
            });
        }
        if story.status.is_settled() || story.status == StoryStatus::Failed {
            return Ok(CompleteOutcome::Ignored {
                reason: format!("story already {}", story.status),
            });
        }
        if story.status != StoryStatus::Running {
            warn!(
                "completion for story {} in state {}; treating as conflict",
                story.story_id, story.status
            );
            return Ok(CompleteOutcome::Ignored {
                reason: format!("story is {}", story.status),
            });
        }

        let (loop_step, cfg) = self.loop_step_of(&story).await?;
        match story.phase {
            StoryPhase::Work => {
                let parsed = OutputMap::parse(raw_output);
                if let Err(e) = parsed.require(&loop_step.outputs) {
                    return self.reject_story(&story, e.to_string(), now).await;
                }
                let needs_verify = cfg.verify_each && cfg.verify.is_some();
                if !self
                    .store()
                    .story_work_done(&story.id, raw_output, needs_verify, now)
                    .await?
                {
                    return Ok(CompleteOutcome::Ignored {
                        reason: "story state changed underneath".into(),
                    });
                }
                if !needs_verify {
                    self.try_finish_loop(&loop_step, now).await?;
                }
                Ok(CompleteOutcome::Accepted)
            }
            StoryPhase::Verify => {
                let verify = cfg.verify.as_ref().ok_or_else(|| {
                    Error::Internal(format!(
                        "story {} awaits verification but the loop has no verify spec",
                        story.story_id
                    ))
                })?;
                let parsed = OutputMap::parse(raw_output);
                if let Err(e) = parsed.require(&verify.outputs) {
                    return self.reject_story(&story, e.to_string(), now).await;
                }
                if !self.store().story_verified(&story.id, now).await? {
                    return Ok(CompleteOutcome::Ignored {
                        reason: "story state changed underneath".into(),
                    });
                }
                self.try_finish_loop(&loop_step, now).await?;
                Ok(CompleteOutcome::Accepted)
            }
        }
    }

    pub(crate) async fn fail_story(
        &self,
        story: StoryRecord,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(run) = self.run_if_active(&story.run_id).await? else {
            return Ok(());
        };
        let outcome = self
            .store()
            .fail_story(&story.id, reason, self.budget_for(&run), now)
            .await?;
        if matches!(outcome, FailOutcome::Exhausted) {
            self.archive_if_terminal(&story.run_id).await?;
        }
        Ok(())
    }

    /// Missing required outputs behave exactly like an agent-reported fail.
    async fn reject_story(
        &self,
        story: &StoryRecord,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<CompleteOutcome> {
        let Some(run) = self.run_if_active(&story.run_id).await? else {
            return Ok(CompleteOutcome::Ignored {
                reason: "run is no longer running".into(),
            });
        };
        let outcome = self
            .store()
            .fail_story(&story.id, &reason, self.budget_for(&run), now)
            .await?;
        if matches!(outcome, FailOutcome::Exhausted) {
            self.archive_if_terminal(&story.run_id).await?;
        }
        Ok(CompleteOutcome::Rejected { reason })
    }

    /// Once every story is settled the loop step completes and the cursor
    /// advances; safe to call after every story transition.
    pub(crate) async fn try_finish_loop(
        &self,
        loop_step: &StepRecord,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(run) = self.store().run(&loop_step.run_id).await? else {
            return Ok(());
        };
        let steps = self.store().steps_for_run(&loop_step.run_id).await?;
        let next = self
            .prepare_next_stories(&steps, loop_step.step_index, None)
            .await?;
        let (seeds, parse_failure) = next.into_parts();
        if let Some(advance) = self
            .store()
            .finish_loop_and_advance(&loop_step.id, seeds, now)
            .await?
        {
            self.handle_advance(&run, advance, parse_failure, now).await?;
        }
        Ok(())
    }

    async fn loop_step_of(&self, story: &StoryRecord) -> Result<(StepRecord, LoopSpec)> {
        let step = self
            .store()
            .step(&story.loop_step_id)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!("story {} has no loop step", story.story_id))
            })?;
        let cfg = step.loop_config.clone().ok_or_else(|| {
            Error::Internal(format!(
                "step {} holds stories but has no loop config",
                step.step_id
            ))
        })?;
        Ok((step, cfg))
    }
}
