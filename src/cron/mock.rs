//! Recording in-memory gateway for tests.

use super::{CronGateway, CronJobInfo, CronJobSpec};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingState {
    jobs: Vec<(CronJobInfo, CronJobSpec)>,
    calls: Vec<String>,
    next_id: u64,
    fail_all: bool,
}

/// In-memory [`CronGateway`] that records every call and serves the jobs it
/// was asked to create. `fail_all` turns every call into an upstream error
/// to exercise the fail-closed paths.
#[derive(Default, Clone)]
pub struct RecordingCronGateway {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingCronGateway {
    pub fn jobs(&self) -> Vec<CronJobInfo> {
        self.lock().jobs.iter().map(|(info, _)| info.clone()).collect()
    }

    pub fn job_specs(&self) -> Vec<CronJobSpec> {
        self.lock().jobs.iter().map(|(_, spec)| spec.clone()).collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Make every subsequent call fail with `Error::Upstream`.
    pub fn fail_all(&self, fail: bool) {
        self.lock().fail_all = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.lock().fail_all {
            Err(Error::Upstream("scheduler unavailable (mock)".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CronGateway for RecordingCronGateway {
    async fn create_job(&self, job: CronJobSpec) -> Result<String> {
        self.check_available()?;
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("job-{}", state.next_id);
        state.calls.push(format!("create {}", job.name));
        state.jobs.push((
            CronJobInfo {
                id: id.clone(),
                name: job.name.clone(),
            },
            job,
        ));
        Ok(id)
    }

    async fn list_jobs(&self) -> Result<Vec<CronJobInfo>> {
        self.check_available()?;
        let mut state = self.lock();
        state.calls.push("list".into());
        Ok(state.jobs.iter().map(|(info, _)| info.clone()).collect())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        state.calls.push(format!("delete {id}"));
        let before = state.jobs.len();
        state.jobs.retain(|(info, _)| info.id != id);
        if state.jobs.len() == before {
            return Err(Error::NotFound(format!("cron job {id}")));
        }
        Ok(())
    }
}
