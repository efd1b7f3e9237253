//! Cron gateway: adapter to the external periodic scheduler.
//!
//! The scheduler is the engine's sole means of waking agents. The engine
//! drives it through four operations behind the [`CronGateway`] trait so
//! tests run against an in-memory recording fake. Jobs are addressed by a
//! naming convention (`setfarm/<workflow_id>/<role>[-<n>]`), which makes
//! creation idempotent and teardown a prefix delete.

pub mod command;
pub mod mock;

pub use command::CommandCronGateway;
pub use mock::RecordingCronGateway;

use crate::app::Settings;
use crate::error::Result;
use crate::workflow::WorkflowSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// A job to schedule: wake `agent_id` every `interval_ms`, offset by
/// `anchor_ms`, carrying the claim-protocol prompt as `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobSpec {
    pub name: String,
    pub interval_ms: u64,
    pub anchor_ms: u64,
    pub agent_id: String,
    pub payload: String,
    pub enabled: bool,
}

/// Scheduler-side job listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJobInfo {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait CronGateway: Send + Sync {
    /// Schedule a job; returns the scheduler-assigned id.
    async fn create_job(&self, job: CronJobSpec) -> Result<String>;

    async fn list_jobs(&self) -> Result<Vec<CronJobInfo>>;

    async fn delete_job(&self, id: &str) -> Result<()>;

    /// Delete every job whose name starts with `prefix`; returns how many.
    async fn delete_jobs_by_prefix(&self, prefix: &str) -> Result<u32> {
        let mut deleted = 0;
        for job in self.list_jobs().await? {
            if job.name.starts_with(prefix) {
                self.delete_job(&job.id).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Name prefix shared by all jobs of one workflow.
pub fn workflow_job_prefix(workflow_id: &str) -> String {
    format!("setfarm/{workflow_id}/")
}

fn job_name(workflow_id: &str, role: &str, shard: u32) -> String {
    if shard <= 1 {
        format!("setfarm/{workflow_id}/{role}")
    } else {
        format!("setfarm/{workflow_id}/{role}-{shard}")
    }
}

fn job_payload(workflow_id: &str, role: &str) -> String {
    format!(
        "You poll the setfarm queue for workflow {workflow_id} as role {role}. \
         Run `setfarm step peek {role}`; on NO_WORK stop immediately. Otherwise run \
         `setfarm step claim {role}`, perform exactly the work described in the returned \
         input, then report with `setfarm step complete <id>` (output on stdin) or \
         `setfarm step fail <id> <reason>`."
    )
}

/// Compute the full job set for a workflow: one job per single-step role,
/// `workers` staggered shards per loop role (worker and verifier alike).
/// Roles appearing in several steps get the widest shard count.
pub fn plan_jobs(spec: &WorkflowSpec, settings: &Settings) -> Vec<CronJobSpec> {
    let interval_ms = spec
        .interval
        .unwrap_or(settings.cron_interval)
        .as_millis() as u64;
    let stagger_ms = settings.worker_stagger.as_millis() as u64;

    // first-seen role order keeps the plan deterministic
    let mut roles: Vec<(String, u32)> = Vec::new();
    let mut widen = |role: &str, shards: u32| {
        match roles.iter_mut().find(|(r, _)| r == role) {
            Some((_, n)) => *n = (*n).max(shards),
            None => roles.push((role.to_string(), shards)),
        }
    };
    for step in &spec.steps {
        match step.loop_spec() {
            None => widen(&step.agent, 1),
            Some(cfg) => {
                widen(&step.agent, cfg.workers);
                if let Some(verify) = &cfg.verify {
                    widen(&verify.agent, cfg.workers);
                }
            }
        }
    }

    let mut jobs = Vec::new();
    for (role, shards) in roles {
        for shard in 1..=shards {
            jobs.push(CronJobSpec {
                name: job_name(&spec.id, &role, shard),
                interval_ms,
                anchor_ms: u64::from(shard - 1) * stagger_ms,
                agent_id: role.clone(),
                payload: job_payload(&spec.id, &role),
                enabled: true,
            });
        }
    }
    jobs
}

/// Ensure jobs exist for a workflow. Idempotent: when any job with the
/// workflow prefix already exists, nothing is created.
pub async fn sync_workflow_jobs(
    gateway: &dyn CronGateway,
    spec: &WorkflowSpec,
    settings: &Settings,
) -> Result<u32> {
    let prefix = workflow_job_prefix(&spec.id);
    let existing = gateway.list_jobs().await?;
    if existing.iter().any(|job| job.name.starts_with(&prefix)) {
        return Ok(0);
    }
    let jobs = plan_jobs(spec, settings);
    let mut created = 0;
    for job in jobs {
        gateway.create_job(job).await?;
        created += 1;
    }
    info!("created {created} cron jobs for workflow {}", spec.id);
    Ok(created)
}

/// Remove every job of a workflow (no runs left running).
pub async fn teardown_workflow_jobs(gateway: &dyn CronGateway, workflow_id: &str) -> Result<u32> {
    let deleted = gateway
        .delete_jobs_by_prefix(&workflow_job_prefix(workflow_id))
        .await?;
    if deleted > 0 {
        info!("deleted {deleted} cron jobs for workflow {workflow_id}");
    }
    Ok(deleted)
}

/// Delete and recreate a workflow's jobs (medic stalled-cron remediation).
pub async fn restart_workflow_jobs(
    gateway: &dyn CronGateway,
    spec: &WorkflowSpec,
    settings: &Settings,
) -> Result<u32> {
    teardown_workflow_jobs(gateway, &spec.id).await?;
    sync_workflow_jobs(gateway, spec, settings).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn two_role_spec() -> WorkflowSpec {
        WorkflowSpec::from_yaml(
            r#"
id: farm
interval: 2m
steps:
  - id: plan
    agent: farm/planner
    outputs: [STORIES_JSON]
  - id: build
    agent: farm/developer
    type: loop
    outputs: [RESULT]
    loop:
      source: plan
      workers: 3
      verify_each: true
      verify:
        agent: farm/verifier
        outputs: [VERDICT]
"#,
        )
        .expect("valid spec")
    }

    #[test]
    fn plan_covers_all_roles_with_shards_and_stagger() {
        let jobs = plan_jobs(&two_role_spec(), &Settings::default());
        let names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "setfarm/farm/farm/planner",
                "setfarm/farm/farm/developer",
                "setfarm/farm/farm/developer-2",
                "setfarm/farm/farm/developer-3",
                "setfarm/farm/farm/verifier",
                "setfarm/farm/farm/verifier-2",
                "setfarm/farm/farm/verifier-3",
            ]
        );
        // workflow interval override and 40s shard stagger
        assert!(jobs.iter().all(|j| j.interval_ms == 120_000));
        let dev2 = jobs.iter().find(|j| j.name.ends_with("developer-2")).unwrap();
        assert_eq!(dev2.anchor_ms, 40_000);
        assert_eq!(dev2.agent_id, "farm/developer");
        assert!(dev2.payload.contains("setfarm step claim farm/developer"));
    }

    #[test]
    fn default_interval_applies_without_override() {
        let spec = WorkflowSpec::from_yaml("id: x\nsteps:\n  - id: a\n    agent: p\n").unwrap();
        let settings = Settings {
            cron_interval: Duration::from_secs(300),
            ..Settings::default()
        };
        let jobs = plan_jobs(&spec, &settings);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].interval_ms, 300_000);
        assert_eq!(jobs[0].anchor_ms, 0);
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let gateway = RecordingCronGateway::default();
        let spec = two_role_spec();
        let settings = Settings::default();

        let created = sync_workflow_jobs(&gateway, &spec, &settings).await.unwrap();
        assert_eq!(created, 7);
        let created = sync_workflow_jobs(&gateway, &spec, &settings).await.unwrap();
        assert_eq!(created, 0);
        assert_eq!(gateway.jobs().len(), 7);
    }

    #[tokio::test]
    async fn teardown_deletes_only_matching_prefix() {
        let gateway = RecordingCronGateway::default();
        let settings = Settings::default();
        sync_workflow_jobs(&gateway, &two_role_spec(), &settings)
            .await
            .unwrap();
        let other = WorkflowSpec::from_yaml("id: other\nsteps:\n  - id: a\n    agent: p\n").unwrap();
        sync_workflow_jobs(&gateway, &other, &settings).await.unwrap();

        let deleted = teardown_workflow_jobs(&gateway, "farm").await.unwrap();
        assert_eq!(deleted, 7);
        let remaining = gateway.jobs();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].name.starts_with("setfarm/other/"));
    }

    #[tokio::test]
    async fn restart_recreates_jobs() {
        let gateway = RecordingCronGateway::default();
        let spec = two_role_spec();
        let settings = Settings::default();
        sync_workflow_jobs(&gateway, &spec, &settings).await.unwrap();
        let before = gateway.jobs();

        let created = restart_workflow_jobs(&gateway, &spec, &settings).await.unwrap();
        assert_eq!(created, 7);
        let after = gateway.jobs();
        // fresh scheduler ids prove a real delete + recreate
        assert!(before.iter().all(|b| after.iter().all(|a| a.id != b.id)));
    }
}
