use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::pipeline::PipelineRun;

pub const SNAPSHOT_VERSION: &str = "1.0";

/// A saved digest run, reloaded later for gap analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub run: PipelineRun,
}

impl RunSnapshot {
    pub fn new(run: PipelineRun) -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            created_at: run.generated_at,
            run,
        }
    }

    pub fn filename(&self) -> String {
        format!("run-{}.json", self.created_at.format("%Y-%m-%dT%H-%M-%S"))
    }
}

/// Get the default directory for storing run snapshots
pub fn get_default_runs_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .context("Could not determine local data directory")?
        .join("security-digest")
        .join("runs");

    fs::create_dir_all(&data_dir).context("Failed to create runs directory")?;

    Ok(data_dir)
}

/// Save a run snapshot as pretty JSON inside `dir`
pub fn save_snapshot(snapshot: &RunSnapshot, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create snapshot directory {}", dir.display()))?;
    let filepath = dir.join(snapshot.filename());

    let json = serde_json::to_string_pretty(snapshot).context("Failed to serialize run snapshot")?;

    fs::write(&filepath, json).context("Failed to write snapshot file")?;

    Ok(filepath)
}

/// Load a run snapshot from a JSON file
pub fn load_snapshot(filepath: &Path) -> Result<RunSnapshot> {
    if !filepath.exists() {
        anyhow::bail!("Snapshot file not found: {}", filepath.display());
    }

    let content = fs::read_to_string(filepath)
        .with_context(|| format!("Failed to read snapshot file: {}", filepath.display()))?;

    let snapshot: RunSnapshot = serde_json::from_str(&content).with_context(|| {
        format!(
            "Failed to parse snapshot JSON from {}. The file may be corrupted or not a run snapshot.",
            filepath.display()
        )
    })?;

    if snapshot.version != SNAPSHOT_VERSION {
        anyhow::bail!(
            "Unsupported snapshot version: {}. Expected {}. Re-run security-digest to create a new one.",
            snapshot.version,
            SNAPSHOT_VERSION
        );
    }

    validate_run(&snapshot.run)
        .with_context(|| format!("Snapshot {} is inconsistent", filepath.display()))?;

    Ok(snapshot)
}

/// Rejects runs whose groups or group ids could not have come from the pipeline.
fn validate_run(run: &PipelineRun) -> Result<()> {
    let ranked = run.ranked.iter().chain(&run.output);

    if let Some(pos) = run.groups.iter().position(|g| !g.is_well_formed()) {
        anyhow::bail!("group {} has no valid representative member", pos);
    }
    for entry in ranked {
        if entry.id >= run.groups.len() {
            anyhow::bail!("ranked group id {} is out of range", entry.id);
        }
        if !entry.group.is_well_formed() {
            anyhow::bail!("ranked group {} has no valid representative member", entry.id);
        }
    }

    Ok(())
}

/// All readable snapshots in `dir`, newest first
pub fn list_snapshots(dir: &Path) -> Result<Vec<(PathBuf, RunSnapshot)>> {
    let mut files = Vec::new();

    if dir.exists() {
        for entry in fs::read_dir(dir).context("Failed to read runs directory")? {
            let path = entry?.path();

            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                match load_snapshot(&path) {
                    Ok(snapshot) => files.push((path, snapshot)),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
                }
            }
        }
    }

    files.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));

    Ok(files)
}

/// The newest snapshot in `dir`, if any
pub fn latest_snapshot(dir: &Path) -> Result<Option<(PathBuf, RunSnapshot)>> {
    Ok(list_snapshots(dir)?.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DigestConfig;
    use crate::models::Article;
    use crate::pipeline::Pipeline;
    use chrono::{Duration, TimeZone};

    fn snapshot_at(hour: u32) -> RunSnapshot {
        let now = Utc.with_ymd_and_hms(2025, 2, 10, hour, 0, 0).unwrap();
        let fetched = vec![Article::new("https://a.com/1", "Story", "A").published(now - Duration::hours(1))];
        RunSnapshot::new(Pipeline::new(&DigestConfig::default()).run(fetched, false, now))
    }

    #[test]
    fn test_save_and_load_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = snapshot_at(8);
        let path = save_snapshot(&snapshot, dir.path()).unwrap();

        assert!(path.ends_with("run-2025-02-10T08-00-00.json"));
        assert_eq!(load_snapshot(&path).unwrap(), snapshot);
    }

    #[test]
    fn test_load_snapshot_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_snapshot(&dir.path().join("nope.json")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_load_snapshot_rejects_other_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut snapshot = snapshot_at(8);
        snapshot.version = "0.9".to_string();
        let path = save_snapshot(&snapshot, dir.path()).unwrap();

        let err = load_snapshot(&path).unwrap_err();
        assert!(err.to_string().contains("Unsupported snapshot version"));
    }

    #[test]
    fn test_load_snapshot_rejects_empty_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut snapshot = snapshot_at(8);
        snapshot.run.groups[0].members.clear();
        let path = save_snapshot(&snapshot, dir.path()).unwrap();

        let err = load_snapshot(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("no valid representative member"));
    }

    #[test]
    fn test_load_snapshot_rejects_dangling_group_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut snapshot = snapshot_at(8);
        snapshot.run.output[0].id = 7;
        let path = save_snapshot(&snapshot, dir.path()).unwrap();

        let err = load_snapshot(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("out of range"));
    }

    #[test]
    fn test_latest_snapshot_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        save_snapshot(&snapshot_at(8), dir.path()).unwrap();
        save_snapshot(&snapshot_at(10), dir.path()).unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();

        let (_, latest) = latest_snapshot(dir.path()).unwrap().unwrap();
        assert_eq!(latest.created_at.format("%H").to_string(), "10");
        assert_eq!(list_snapshots(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn test_latest_snapshot_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_snapshot(dir.path()).unwrap().is_none());
    }
}
