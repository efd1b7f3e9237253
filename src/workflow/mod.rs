//! Workflow specification parsing
//!
//! Handles parsing of workflow YAML files into [`WorkflowSpec`] values and
//! validating them before a run is seeded. A workflow is an ordered pipeline
//! of steps; each step is assigned to a role (`agent`) and is either a
//! `single` step or a `loop` step fanning out over stories emitted by an
//! earlier step.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Output key a loop source step must declare to feed its loop.
pub const STORIES_KEY: &str = "STORIES_JSON";

/// A declarative pipeline specification.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSpec {
    /// Stable workflow identifier, also the cron job name segment.
    pub id: String,

    /// Human-readable name.
    #[serde(default)]
    pub name: Option<String>,

    /// Cron wake interval override (default 5m).
    #[serde(default, with = "humantime_serde::option")]
    pub interval: Option<Duration>,

    /// Role timeout override used by the medic staleness checks.
    #[serde(default, with = "humantime_serde::option")]
    pub max_role_timeout: Option<Duration>,

    /// Retry budget override for steps and stories.
    #[serde(default)]
    pub retry_budget: Option<u32>,

    /// Ordered pipeline stages.
    pub steps: Vec<StepSpec>,
}

/// One pipeline stage: shared header plus a per-variant payload.
#[derive(Debug, Clone)]
pub struct StepSpec {
    /// Spec-declared step name, unique within the workflow.
    pub id: String,

    /// Role identifier served by the cron gateway, e.g. `workflow/developer`.
    pub agent: String,

    /// Input template; `${KEY}` placeholders resolve from run variables and
    /// declared outputs of earlier steps.
    pub input: String,

    /// Output keys the agent must produce for the step to complete.
    pub outputs: Vec<String>,

    /// `single` (default) or `loop` with its fan-out configuration.
    pub kind: StepKind,
}

/// Tagged step variant.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Single,
    Loop(LoopSpec),
}

/// Raw YAML shape of a step: the variant is declared with `type:` and the
/// loop payload lives under a `loop:` block.
#[derive(Deserialize)]
struct RawStepSpec {
    id: String,
    agent: String,
    #[serde(default)]
    input: String,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(rename = "type", default)]
    step_type: RawStepType,
    #[serde(rename = "loop", default)]
    loop_config: Option<LoopSpec>,
}

#[derive(Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
enum RawStepType {
    #[default]
    Single,
    Loop,
}

impl<'de> Deserialize<'de> for StepSpec {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawStepSpec::deserialize(deserializer)?;
        let kind = match (raw.step_type, raw.loop_config) {
            (RawStepType::Single, None) => StepKind::Single,
            (RawStepType::Single, Some(_)) => {
                return Err(serde::de::Error::custom(format!(
                    "step {:?} has a loop block but is not declared `type: loop`",
                    raw.id
                )));
            }
            (RawStepType::Loop, Some(spec)) => StepKind::Loop(spec),
            (RawStepType::Loop, None) => {
                return Err(serde::de::Error::custom(format!(
                    "loop step {:?} is missing its loop block",
                    raw.id
                )));
            }
        };
        Ok(StepSpec {
            id: raw.id,
            agent: raw.agent,
            input: raw.input,
            outputs: raw.outputs,
            kind,
        })
    }
}

/// Fan-out configuration of a `loop` step. Persisted as JSON on the step row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    /// Step id whose `STORIES_JSON` output seeds the stories.
    pub source: String,

    /// Parallel cron shards per role.
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Require a verifier pass per story before it counts as done.
    #[serde(default)]
    pub verify_each: bool,

    /// Verifier sub-step, required when `verify_each` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifySpec>,
}

/// Verifier sub-step of a loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifySpec {
    /// Role that claims stories awaiting verification.
    pub agent: String,

    /// Input template for the verification turn.
    #[serde(default)]
    pub input: String,

    /// Output keys the verifier must produce.
    #[serde(default)]
    pub outputs: Vec<String>,
}

fn default_workers() -> u32 {
    3
}

impl StepSpec {
    /// Loop configuration, when this is a loop step.
    pub fn loop_spec(&self) -> Option<&LoopSpec> {
        match &self.kind {
            StepKind::Loop(spec) => Some(spec),
            StepKind::Single => None,
        }
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.kind, StepKind::Loop(_))
    }

    /// Wire name of the step type, as persisted in the store.
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            StepKind::Single => "single",
            StepKind::Loop(_) => "loop",
        }
    }
}

impl WorkflowSpec {
    /// Parse a workflow spec from YAML and validate it.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let spec: WorkflowSpec =
            serde_yaml::from_str(raw).map_err(|e| Error::Spec(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Load `<workflows_dir>/<id>.yaml`.
    pub fn load(workflows_dir: &Path, id: &str) -> Result<Self> {
        let path = workflows_dir.join(format!("{id}.yaml"));
        let raw = std::fs::read_to_string(&path)
            .map_err(|_| Error::NotFound(format!("workflow {id} ({})", path.display())))?;
        let spec = Self::from_yaml(&raw)?;
        if spec.id != id {
            return Err(Error::Spec(format!(
                "workflow file {} declares id {:?}",
                path.display(),
                spec.id
            )));
        }
        Ok(spec)
    }

    /// List workflow ids present in the workflows directory.
    pub fn list(workflows_dir: &Path) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(workflows_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Structural validation: non-empty pipeline, unique step ids, loop
    /// sources that exist earlier in the pipeline and declare `STORIES_JSON`,
    /// verifier present whenever `verify_each` is set.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Spec("workflow id must not be empty".into()));
        }
        if self.id.contains('/') {
            return Err(Error::Spec(format!(
                "workflow id {:?} must not contain '/'",
                self.id
            )));
        }
        if self.steps.is_empty() {
            return Err(Error::Spec(format!("workflow {} has no steps", self.id)));
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(Error::Spec(format!(
                    "workflow {} has a step with an empty id",
                    self.id
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(Error::Spec(format!(
                    "workflow {} declares step {:?} twice",
                    self.id, step.id
                )));
            }
            if step.agent.trim().is_empty() {
                return Err(Error::Spec(format!("step {:?} has no agent role", step.id)));
            }
        }

        for (index, step) in self.steps.iter().enumerate() {
            let Some(loop_spec) = step.loop_spec() else {
                continue;
            };
            let source_index = self.steps.iter().position(|s| s.id == loop_spec.source);
            match source_index {
                None => {
                    return Err(Error::Spec(format!(
                        "loop step {:?} references unknown source {:?}",
                        step.id, loop_spec.source
                    )));
                }
                Some(si) if si >= index => {
                    return Err(Error::Spec(format!(
                        "loop step {:?} source {:?} must come earlier in the pipeline",
                        step.id, loop_spec.source
                    )));
                }
                Some(si) => {
                    let source = &self.steps[si];
                    if !source.outputs.iter().any(|o| o == STORIES_KEY) {
                        return Err(Error::Spec(format!(
                            "loop source {:?} does not declare {STORIES_KEY}",
                            source.id
                        )));
                    }
                }
            }
            if loop_spec.workers == 0 {
                return Err(Error::Spec(format!(
                    "loop step {:?} needs at least one worker",
                    step.id
                )));
            }
            if loop_spec.verify_each && loop_spec.verify.is_none() {
                return Err(Error::Spec(format!(
                    "loop step {:?} sets verify_each without a verify block",
                    step.id
                )));
            }
        }
        Ok(())
    }

    /// Find a step by its spec-declared id.
    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}
