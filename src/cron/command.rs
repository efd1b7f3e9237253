//! Scheduler CLI gateway.
//!
//! Production gateway that shells out to the external scheduler's CLI
//! (`openclaw cron …` by default). Every call carries a hard timeout and
//! fails closed: a timeout, a non-zero exit or unparseable output all
//! surface as `Error::Upstream`, which callers log and leave for the medic.
//! The database stays the source of truth either way.

use super::{CronGateway, CronJobInfo, CronJobSpec};
use crate::app::GatewaySettings;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

pub struct CommandCronGateway {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandCronGateway {
    pub fn new(settings: &GatewaySettings) -> Self {
        Self {
            argv: settings.command.clone(),
            timeout: settings.timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let (program, prefix) = self
            .argv
            .split_first()
            .ok_or_else(|| Error::Upstream("no scheduler command configured".into()))?;
        let mut command = Command::new(program);
        command
            .args(prefix)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("scheduler call: {program} {}", args.join(" "));

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                Error::Upstream(format!(
                    "scheduler call timed out after {:?}: {}",
                    self.timeout,
                    args.join(" ")
                ))
            })?
            .map_err(|e| Error::Upstream(format!("failed to spawn scheduler CLI: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Upstream(format!(
                "scheduler call failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl CronGateway for CommandCronGateway {
    async fn create_job(&self, job: CronJobSpec) -> Result<String> {
        let json = serde_json::to_string(&job)?;
        let stdout = self.run(&["add", "--json", &json]).await?;
        let created: CronJobInfo = serde_json::from_str(stdout.trim())
            .map_err(|e| Error::Upstream(format!("unparseable scheduler response: {e}")))?;
        Ok(created.id)
    }

    async fn list_jobs(&self) -> Result<Vec<CronJobInfo>> {
        let stdout = self.run(&["list", "--json"]).await?;
        serde_json::from_str(stdout.trim())
            .map_err(|e| Error::Upstream(format!("unparseable scheduler job list: {e}")))
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        self.run(&["rm", id]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_command_fails_closed() {
        let gateway = CommandCronGateway {
            argv: vec![],
            timeout: Duration::from_secs(1),
        };
        let err = gateway.list_jobs().await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
    }

    #[tokio::test]
    async fn missing_binary_maps_to_upstream_error() {
        let gateway = CommandCronGateway {
            argv: vec!["setfarm-no-such-scheduler-binary".into()],
            timeout: Duration::from_secs(1),
        };
        let err = gateway.list_jobs().await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)), "{err}");
    }
}
