//! Append-only run history.
//!
//! Every finished run is appended as one JSON line. The log is the only
//! thing that outlives an AgentRun; there is no schema version guarantee
//! across releases, so loading skips lines it cannot parse.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::api::types::Message;
use crate::planner::TaskPlan;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub task: String,
    pub messages: Vec<Message>,
    /// Total tool calls executed.
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<TaskPlan>,
    pub status: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

pub struct RunHistoryStore {
    path: PathBuf,
}

impl RunHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shellpilot")
            .join("history.jsonl")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &RunRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating history dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening history log {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn load(&self) -> Result<Vec<RunRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let mut records = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("skipping unreadable history line: {}", e),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{create_plan, PlanStrategy, StepStatus, TaskStep};
    use tempfile::TempDir;

    fn sample_record(id: &str) -> RunRecord {
        let mut plan = create_plan(
            "check disks",
            vec![TaskStep::new("run df -h", "usage overview")],
            PlanStrategy::Default,
            None,
            None,
        )
        .unwrap();
        let step_id = plan.steps[0].id.clone();
        plan.update_step(&step_id, StepStatus::Completed).unwrap();

        RunRecord {
            run_id: id.to_string(),
            task: "check disks".into(),
            messages: vec![
                Message::system("prompt"),
                Message::user("check disks"),
                Message::assistant("done"),
            ],
            steps: 1,
            plan: Some(plan),
            status: "completed".into(),
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_append_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = RunHistoryStore::new(dir.path().join("history.jsonl"));

        let record = sample_record("run-1");
        store.append(&record).await.unwrap();
        store.append(&sample_record("run-2")).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].run_id, "run-1");
        // Messages and the plan's adjustment log survive the roundtrip.
        assert_eq!(loaded[0].messages, record.messages);
        assert_eq!(
            loaded[0].plan.as_ref().unwrap().adjustments.len(),
            record.plan.as_ref().unwrap().adjustments.len()
        );
    }

    #[tokio::test]
    async fn test_load_skips_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = RunHistoryStore::new(&path);
        store.append(&sample_record("run-1")).await.unwrap();
        tokio::fs::write(
            &path,
            format!(
                "{}not json at all\n",
                tokio::fs::read_to_string(&path).await.unwrap()
            ),
        )
        .await
        .unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = RunHistoryStore::new(dir.path().join("none.jsonl"));
        assert!(store.load().await.unwrap().is_empty());
    }
}
