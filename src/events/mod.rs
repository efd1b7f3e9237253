//! Run archive mirror
//!
//! State transitions are recorded as append-only event rows by the store,
//! inside the transaction that makes them. This module covers the other half
//! of observability: mirroring a run (with its steps and stories) as pretty
//! JSON under `<state>/runs/<run_id>.json` for human inspection. The engine
//! treats these files as write-only and never reads them back; a failed
//! write is logged and ignored.

use crate::storage::RunSnapshot;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Write (or overwrite) the JSON archive for a run. Best effort.
pub fn archive_run(runs_dir: &Path, snapshot: &RunSnapshot) {
    if let Err(e) = try_archive_run(runs_dir, snapshot) {
        warn!("failed to archive run {}: {e}", snapshot.run.id);
    }
}

fn try_archive_run(runs_dir: &Path, snapshot: &RunSnapshot) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(runs_dir)?;
    let path = runs_dir.join(format!("{}.json", snapshot.run.id));
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(&path, json)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RunRecord, RunStatus};
    use chrono::Utc;
    use std::collections::BTreeMap;

    #[test]
    fn archive_writes_json_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let runs_dir = dir.path().join("runs");
        let snapshot = RunSnapshot {
            run: RunRecord {
                id: "r-1".into(),
                workflow_id: "wf".into(),
                task: "do things".into(),
                status: RunStatus::Done,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                meta: BTreeMap::new(),
            },
            steps: vec![],
            stories: vec![],
        };
        archive_run(&runs_dir, &snapshot);
        let raw = std::fs::read_to_string(runs_dir.join("r-1.json")).unwrap();
        assert!(raw.contains("\"workflow_id\": \"wf\""));
        assert!(raw.contains("\"status\": \"done\""));
    }
}
