//! Medic: periodic reconciliation with policy-bounded auto-remediation.
//!
//! Each pass runs a fixed battery of checks against the store and the cron
//! gateway, remediates within the policy bounds, and records one audit row.
//! The medic acts only through store transactions and gateway calls. It
//! takes `now` explicitly so tests can advance the clock, and it tolerates
//! an unreachable scheduler: upstream failures become warning findings, the
//! database remains the source of truth.

use crate::cron::{self, CronGateway};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::storage::{
    ResetOutcome, RunRecord, RunStatus, StepStatus, StoryStatus,
};
use crate::workflow::WorkflowSpec;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    StuckStep,
    ClaimedButStuck,
    OrphanedStory,
    DeadRun,
    StalledRun,
    OrphanedCrons,
    StalledCrons,
    FailedRunResumable,
    GatewayUnreachable,
}

/// One issue found by a pass, with the action taken (if any).
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub check: CheckKind,
    pub severity: Severity,
    /// Action kind: `reset_step`, `skip_story`, `fail_run`, `resume_run`,
    /// `delete_jobs`, `restart_jobs`, or `none`.
    pub action: String,
    pub remediated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct MedicReport {
    pub findings: Vec<Finding>,
    pub actions_taken: usize,
    pub summary: String,
}

pub struct Medic<'a> {
    engine: &'a Engine,
    gateway: &'a dyn CronGateway,
    workflows_dir: PathBuf,
}

impl<'a> Medic<'a> {
    pub fn new(engine: &'a Engine, gateway: &'a dyn CronGateway, workflows_dir: PathBuf) -> Self {
        Self {
            engine,
            gateway,
            workflows_dir,
        }
    }

    /// One full reconciliation pass. Records a medic-check audit row.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<MedicReport> {
        let mut findings = Vec::new();

        self.check_stuck_steps(now, &mut findings).await?;
        self.check_orphaned_stories(now, &mut findings).await?;
        self.check_dead_runs(now, &mut findings).await?;
        self.check_stalled_runs(now, &mut findings).await?;
        self.check_resumable_runs(now, &mut findings).await?;

        // scheduler-side checks degrade gracefully when the gateway is down
        if let Err(e) = self.check_crons(now, &mut findings).await {
            match e {
                Error::Upstream(detail) => {
                    warn!("cron gateway unreachable during medic pass: {detail}");
                    findings.push(Finding {
                        check: CheckKind::GatewayUnreachable,
                        severity: Severity::Warning,
                        action: "none".into(),
                        remediated: false,
                        run_id: None,
                        workflow_id: None,
                        detail,
                    });
                }
                other => return Err(other),
            }
        }

        let actions_taken = findings.iter().filter(|f| f.remediated).count();
        let summary = if findings.is_empty() {
            "no issues".to_string()
        } else {
            format!("{} issues, {} remediated", findings.len(), actions_taken)
        };
        self.store()
            .record_medic_check(
                findings.len() as i64,
                actions_taken as i64,
                &summary,
                &serde_json::to_value(&findings)?,
                self.engine.settings().medic.check_retention,
                now,
            )
            .await?;
        info!("medic pass: {summary}");
        Ok(MedicReport {
            findings,
            actions_taken,
            summary,
        })
    }

    /// Crash recovery for the external scheduler: make sure cron jobs exist
    /// for every workflow that still has a running run.
    pub async fn restore_cron_jobs(&self) -> Result<u32> {
        let mut created = 0;
        for workflow_id in self.store().workflows_with_running_runs().await? {
            let spec = match WorkflowSpec::load(&self.workflows_dir, &workflow_id) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!("cannot restore crons for workflow {workflow_id}: {e}");
                    continue;
                }
            };
            created +=
                cron::sync_workflow_jobs(self.gateway, &spec, self.engine.settings()).await?;
        }
        Ok(created)
    }

    fn store(&self) -> &crate::storage::Store {
        self.engine.store()
    }

    /// Effective role timeout for a run (workflow override snapshot or the
    /// engine default).
    fn role_timeout(&self, run: &RunRecord) -> Duration {
        let secs = run
            .meta
            .get("max_role_timeout_secs")
            .and_then(Value::as_u64);
        match secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => self.engine.settings().max_role_timeout,
        }
    }

    async fn check_stuck_steps(
        &self,
        now: DateTime<Utc>,
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        let medic = &self.engine.settings().medic;
        for step in self.store().running_steps().await? {
            let Some(run) = self.store().run(&step.run_id).await? else {
                continue;
            };
            let timeout = self.role_timeout(&run);
            let age = now.signed_duration_since(step.updated_at);
            let (check, severity) = if older(age, timeout + medic.stuck_grace) {
                (CheckKind::StuckStep, Severity::Critical)
            } else if older(age, medic.claimed_stuck_after) && !older(age, timeout) {
                (CheckKind::ClaimedButStuck, Severity::Warning)
            } else {
                continue;
            };
            let outcome = self
                .store()
                .reset_step(&step.id, medic.max_abandons, now)
                .await?;
            let (action, detail) = match outcome {
                ResetOutcome::Reset { abandoned_count } => (
                    "reset_step",
                    format!(
                        "step {} idle {}m, reset ({abandoned_count} abandons)",
                        step.step_id,
                        age.num_minutes()
                    ),
                ),
                ResetOutcome::Terminal => {
                    self.engine.archive_if_terminal(&run.id).await?;
                    (
                        "fail_run",
                        format!("step {} hit the abandon bound, run failed", step.step_id),
                    )
                }
                ResetOutcome::AlreadyApplied => continue,
            };
            findings.push(Finding {
                check,
                severity,
                action: action.into(),
                remediated: true,
                run_id: Some(run.id.clone()),
                workflow_id: Some(run.workflow_id.clone()),
                detail,
            });
        }
        Ok(())
    }

    async fn check_orphaned_stories(
        &self,
        now: DateTime<Utc>,
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        let medic = &self.engine.settings().medic;
        for story in self.store().running_stories().await? {
            let age = now.signed_duration_since(story.updated_at);
            if !older(age, medic.orphaned_story_after) {
                continue;
            }
            let outcome = self
                .store()
                .reset_story(&story.id, medic.max_abandons, now)
                .await?;
            let (action, detail) = match outcome {
                ResetOutcome::Reset { abandoned_count } => (
                    "reset_story",
                    format!(
                        "story {} idle {}m, reset ({abandoned_count} abandons)",
                        story.story_id,
                        age.num_minutes()
                    ),
                ),
                ResetOutcome::Terminal => {
                    // the skip may have been the last missing story
                    if let Some(step) = self.store().step(&story.loop_step_id).await? {
                        self.engine.try_finish_loop(&step, now).await?;
                    }
                    (
                        "skip_story",
                        format!("story {} hit the abandon bound, skipped", story.story_id),
                    )
                }
                ResetOutcome::AlreadyApplied => continue,
            };
            findings.push(Finding {
                check: CheckKind::OrphanedStory,
                severity: Severity::Warning,
                action: action.into(),
                remediated: true,
                run_id: Some(story.run_id.clone()),
                workflow_id: None,
                detail,
            });
        }
        Ok(())
    }

    async fn check_dead_runs(
        &self,
        now: DateTime<Utc>,
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        for run in self.store().runs_with_status(RunStatus::Running).await? {
            let steps = self.store().steps_for_run(&run.id).await?;
            let alive = steps.iter().any(|s| {
                matches!(
                    s.status,
                    StepStatus::Waiting | StepStatus::Pending | StepStatus::Running
                )
            });
            if alive {
                continue;
            }
            let failed = self
                .store()
                .mark_run_failed(&run.id, "dead run: no live steps", now)
                .await?;
            if failed {
                self.engine.archive_if_terminal(&run.id).await?;
            }
            findings.push(Finding {
                check: CheckKind::DeadRun,
                severity: Severity::Critical,
                action: "fail_run".into(),
                remediated: failed,
                run_id: Some(run.id.clone()),
                workflow_id: Some(run.workflow_id.clone()),
                detail: "run was running with no step left to do".into(),
            });
        }
        Ok(())
    }

    /// Alert-only: a run with no step transition in twice the role timeout.
    async fn check_stalled_runs(
        &self,
        now: DateTime<Utc>,
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        for run in self.store().runs_with_status(RunStatus::Running).await? {
            let steps = self.store().steps_for_run(&run.id).await?;
            let Some(last_transition) = steps.iter().map(|s| s.updated_at).max() else {
                continue;
            };
            let age = now.signed_duration_since(last_transition);
            if older(age, self.role_timeout(&run) * 2) {
                findings.push(Finding {
                    check: CheckKind::StalledRun,
                    severity: Severity::Warning,
                    action: "none".into(),
                    remediated: false,
                    run_id: Some(run.id.clone()),
                    workflow_id: Some(run.workflow_id.clone()),
                    detail: format!("no step transition for {}m", age.num_minutes()),
                });
            }
        }
        Ok(())
    }

    async fn check_resumable_runs(
        &self,
        now: DateTime<Utc>,
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        let medic = &self.engine.settings().medic;
        for run in self.store().runs_with_status(RunStatus::Failed).await? {
            let stories = self.store().stories_for_run(&run.id).await?;
            if !stories.iter().any(|s| s.status == StoryStatus::Pending) {
                continue;
            }
            let resumes = run.meta_u32("resume_count");
            if resumes >= medic.max_resumes {
                findings.push(Finding {
                    check: CheckKind::FailedRunResumable,
                    severity: Severity::Info,
                    action: "none".into(),
                    remediated: false,
                    run_id: Some(run.id.clone()),
                    workflow_id: Some(run.workflow_id.clone()),
                    detail: format!("resume bound reached ({resumes})"),
                });
                continue;
            }
            if let Some(last) = run.meta_time("last_resume_at") {
                if !older(now.signed_duration_since(last), medic.resume_cooldown) {
                    continue;
                }
            }
            let resumed = self.store().resume_run(&run.id, now).await?;
            findings.push(Finding {
                check: CheckKind::FailedRunResumable,
                severity: Severity::Warning,
                action: "resume_run".into(),
                remediated: resumed,
                run_id: Some(run.id.clone()),
                workflow_id: Some(run.workflow_id.clone()),
                detail: format!("resume {} of {}", resumes + 1, medic.max_resumes),
            });
        }
        Ok(())
    }

    /// Scheduler-side checks: orphaned jobs, stalled jobs, startup restore.
    async fn check_crons(&self, now: DateTime<Utc>, findings: &mut Vec<Finding>) -> Result<()> {
        self.restore_cron_jobs().await?;
        self.check_orphaned_crons(findings).await?;
        self.check_stalled_crons(now, findings).await?;
        Ok(())
    }

    /// Jobs that outlived every running run of their workflow.
    async fn check_orphaned_crons(&self, findings: &mut Vec<Finding>) -> Result<()> {
        let jobs = self.gateway.list_jobs().await?;
        let mut workflow_ids: Vec<String> = jobs
            .iter()
            .filter_map(|job| job.name.strip_prefix("setfarm/"))
            .filter_map(|rest| rest.split('/').next())
            .map(String::from)
            .collect();
        workflow_ids.sort();
        workflow_ids.dedup();

        for workflow_id in workflow_ids {
            if self
                .store()
                .count_running_runs_for_workflow(&workflow_id)
                .await?
                > 0
            {
                continue;
            }
            let deleted = cron::teardown_workflow_jobs(self.gateway, &workflow_id).await?;
            findings.push(Finding {
                check: CheckKind::OrphanedCrons,
                severity: Severity::Warning,
                action: "delete_jobs".into(),
                remediated: deleted > 0,
                run_id: None,
                workflow_id: Some(workflow_id),
                detail: format!("{deleted} jobs with no running run"),
            });
        }
        Ok(())
    }

    /// Pending stories but no claim activity: assume the crons died and
    /// recreate them, at most once per cooldown window.
    async fn check_stalled_crons(
        &self,
        now: DateTime<Utc>,
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        let medic = &self.engine.settings().medic;
        for run in self.store().runs_with_status(RunStatus::Running).await? {
            let stories = self.store().stories_for_run(&run.id).await?;
            let has_pending = stories.iter().any(|s| s.status == StoryStatus::Pending);
            let has_running = stories.iter().any(|s| s.status == StoryStatus::Running);
            if !has_pending || has_running {
                continue;
            }
            let Some(last_activity) = stories.iter().map(|s| s.updated_at).max() else {
                continue;
            };
            if !older(now.signed_duration_since(last_activity), medic.stalled_claim_after) {
                continue;
            }
            if let Some(last) = run.meta_time("last_cron_restart_at") {
                if !older(now.signed_duration_since(last), medic.cron_restart_cooldown) {
                    continue;
                }
            }
            let spec = match WorkflowSpec::load(&self.workflows_dir, &run.workflow_id) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!("cannot restart crons for workflow {}: {e}", run.workflow_id);
                    continue;
                }
            };
            let created =
                cron::restart_workflow_jobs(self.gateway, &spec, self.engine.settings()).await?;
            self.store()
                .set_run_meta(
                    &run.id,
                    "last_cron_restart_at",
                    Value::from(now.to_rfc3339()),
                    now,
                )
                .await?;
            findings.push(Finding {
                check: CheckKind::StalledCrons,
                severity: Severity::Warning,
                action: "restart_jobs".into(),
                remediated: created > 0,
                run_id: Some(run.id.clone()),
                workflow_id: Some(run.workflow_id.clone()),
                detail: format!("no claim activity, recreated {created} jobs"),
            });
        }
        Ok(())
    }
}

/// Strictly older than a policy threshold.
fn older(age: chrono::Duration, threshold: Duration) -> bool {
    age.num_seconds() > threshold.as_secs() as i64
}

#[cfg(test)]
mod medic_tests;
