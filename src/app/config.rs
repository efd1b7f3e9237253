//! Application configuration
//!
//! Resolves the state directory (`SETFARM_HOME` overrides the default
//! user-scoped `~/.setfarm`) and loads engine settings from an optional
//! `config.yaml` inside it. Every field has a default; a missing config
//! file is not an error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "SETFARM_HOME";

/// Application configuration structure
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Verbosity level for logging
    pub verbose: u8,
    /// Root of all persistent state (database, workflows, run archives)
    pub state_dir: PathBuf,
    /// Engine settings (timeouts, budgets, gateway command)
    pub settings: Settings,
}

impl AppConfig {
    /// Create a new application configuration, resolving the state directory
    /// and loading settings from `<state>/config.yaml` when present.
    pub fn new(verbose: u8) -> Result<Self> {
        let state_dir = resolve_state_dir()?;
        let settings = Settings::load(&state_dir)?;
        Ok(Self {
            verbose,
            state_dir,
            settings,
        })
    }

    /// Path of the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("state.db")
    }

    /// Directory holding workflow spec YAML files.
    pub fn workflows_dir(&self) -> PathBuf {
        self.state_dir.join("workflows")
    }

    /// Directory holding JSON-per-run archives (write-only).
    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    /// Get the log level string based on verbosity
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

fn resolve_state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".setfarm"))
}

/// Engine settings, all defaulted, overridable via `<state>/config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Failure cycles a step (or story) may go through before it is terminal.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Default wake interval for agent cron jobs.
    #[serde(with = "humantime_serde", default = "default_cron_interval")]
    pub cron_interval: Duration,

    /// Anchor offset between parallel shards of the same role.
    #[serde(with = "humantime_serde", default = "default_worker_stagger")]
    pub worker_stagger: Duration,

    /// Longest an agent is expected to hold a claim.
    #[serde(with = "humantime_serde", default = "default_max_role_timeout")]
    pub max_role_timeout: Duration,

    /// Watchdog thresholds and bounds.
    #[serde(default)]
    pub medic: MedicSettings,

    /// External scheduler gateway.
    #[serde(default)]
    pub gateway: GatewaySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            cron_interval: default_cron_interval(),
            worker_stagger: default_worker_stagger(),
            max_role_timeout: default_max_role_timeout(),
            medic: MedicSettings::default(),
            gateway: GatewaySettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from `<state>/config.yaml`, falling back to defaults
    /// when the file does not exist.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join("config.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }
}

/// Medic thresholds, mirroring the remediation policy table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicSettings {
    /// A claimed step older than this is suspicious even below the role timeout.
    #[serde(with = "humantime_serde", default = "default_claimed_stuck_after")]
    pub claimed_stuck_after: Duration,

    /// Grace added on top of `max_role_timeout` before a step counts as stuck.
    #[serde(with = "humantime_serde", default = "default_stuck_grace")]
    pub stuck_grace: Duration,

    /// A running story older than this is orphaned.
    #[serde(with = "humantime_serde", default = "default_orphaned_story_after")]
    pub orphaned_story_after: Duration,

    /// Medic resets of one unit before it is failed (step) or skipped (story).
    #[serde(default = "default_max_abandons")]
    pub max_abandons: u32,

    /// Pending stories with no claim activity for this long mean dead crons.
    #[serde(with = "humantime_serde", default = "default_stalled_claim_after")]
    pub stalled_claim_after: Duration,

    /// Minimum spacing between cron delete+recreate cycles per workflow.
    #[serde(with = "humantime_serde", default = "default_cron_restart_cooldown")]
    pub cron_restart_cooldown: Duration,

    /// Times a failed run may be auto-resumed.
    #[serde(default = "default_max_resumes")]
    pub max_resumes: u32,

    /// Minimum spacing between auto-resumes of one run.
    #[serde(with = "humantime_serde", default = "default_resume_cooldown")]
    pub resume_cooldown: Duration,

    /// Newest medic-check audit rows kept.
    #[serde(default = "default_check_retention")]
    pub check_retention: u32,
}

impl Default for MedicSettings {
    fn default() -> Self {
        Self {
            claimed_stuck_after: default_claimed_stuck_after(),
            stuck_grace: default_stuck_grace(),
            orphaned_story_after: default_orphaned_story_after(),
            max_abandons: default_max_abandons(),
            stalled_claim_after: default_stalled_claim_after(),
            cron_restart_cooldown: default_cron_restart_cooldown(),
            max_resumes: default_max_resumes(),
            resume_cooldown: default_resume_cooldown(),
            check_retention: default_check_retention(),
        }
    }
}

/// External scheduler CLI invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Argv prefix of the scheduler CLI, e.g. `["openclaw", "cron"]`.
    #[serde(default = "default_gateway_command")]
    pub command: Vec<String>,

    /// Hard timeout per gateway call; the gateway fails closed on expiry.
    #[serde(with = "humantime_serde", default = "default_gateway_timeout")]
    pub timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            command: default_gateway_command(),
            timeout: default_gateway_timeout(),
        }
    }
}

fn default_retry_budget() -> u32 {
    3
}

fn default_cron_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_worker_stagger() -> Duration {
    Duration::from_secs(40)
}

fn default_max_role_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_claimed_stuck_after() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_stuck_grace() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_orphaned_story_after() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_max_abandons() -> u32 {
    5
}

fn default_stalled_claim_after() -> Duration {
    Duration::from_secs(12 * 60)
}

fn default_cron_restart_cooldown() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_max_resumes() -> u32 {
    3
}

fn default_resume_cooldown() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_check_retention() -> u32 {
    500
}

fn default_gateway_command() -> Vec<String> {
    vec!["openclaw".to_string(), "cron".to_string()]
}

fn default_gateway_timeout() -> Duration {
    Duration::from_secs(15)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_default_matches_policy_table() {
        let s = Settings::default();
        assert_eq!(s.retry_budget, 3);
        assert_eq!(s.cron_interval, Duration::from_secs(300));
        assert_eq!(s.max_role_timeout, Duration::from_secs(1800));
        assert_eq!(s.medic.max_abandons, 5);
        assert_eq!(s.medic.max_resumes, 3);
        assert_eq!(s.medic.check_retention, 500);
        assert_eq!(s.gateway.timeout, Duration::from_secs(15));
    }

    #[test]
    fn settings_parse_partial_yaml() {
        let s: Settings = serde_yaml::from_str("retry_budget: 5\ncron_interval: 1m\n")
            .expect("partial settings should parse");
        assert_eq!(s.retry_budget, 5);
        assert_eq!(s.cron_interval, Duration::from_secs(60));
        // untouched fields keep their defaults
        assert_eq!(s.medic.max_abandons, 5);
    }

    #[test]
    fn gateway_command_default() {
        let g = GatewaySettings::default();
        assert_eq!(g.command, vec!["openclaw".to_string(), "cron".to_string()]);
    }
}
