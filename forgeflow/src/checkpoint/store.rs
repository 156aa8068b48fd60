//! On-disk task checkpoints.
//!
//! Layout: one directory per task id under the configured root, holding
//! `state.json` and `metadata.json`. Both files are replaced atomically
//! (write to a temp file, then rename). The state is written first so a
//! metadata record never points at a stage whose state is missing.

use super::metadata::{truncate_preview, TaskMetadata};
use super::serialize::{state_from_json, state_to_json};
use crate::core::{StageName, TaskStatus, WorkflowState};
use crate::errors::CheckpointError;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

const STATE_FILE: &str = "state.json";
const METADATA_FILE: &str = "metadata.json";
const MAX_RETENTION_HOURS: i64 = 24 * 365 * 100;

static TASK_ID_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$"));

fn default_enabled() -> bool {
    true
}

fn default_dir() -> PathBuf {
    PathBuf::from(".forgeflow/checkpoints")
}

fn default_retention_hours() -> u64 {
    168
}

fn default_task_preview_chars() -> usize {
    200
}

fn default_write_timeout_ms() -> u64 {
    2_000
}

/// Checkpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Whether checkpoints are written at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Root directory.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    /// Age after which terminal tasks are deleted.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Characters of task text kept in metadata.
    #[serde(default = "default_task_preview_chars")]
    pub task_preview_chars: usize,
    /// Upper bound on one checkpoint write, in milliseconds.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            dir: default_dir(),
            retention_hours: default_retention_hours(),
            task_preview_chars: default_task_preview_chars(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl CheckpointConfig {
    /// Creates a config rooted at `dir`.
    #[must_use]
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// Returns the write timeout.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Returns the retention age.
    #[must_use]
    pub fn retention(&self) -> chrono::Duration {
        let hours = i64::try_from(self.retention_hours)
            .unwrap_or(i64::MAX)
            .min(MAX_RETENTION_HOURS);
        chrono::Duration::hours(hours)
    }
}

/// Durable per-task snapshots.
#[derive(Debug, Clone)]
pub struct TaskCheckpointer {
    config: CheckpointConfig,
}

impl TaskCheckpointer {
    /// Creates a checkpointer without touching the filesystem.
    #[must_use]
    pub fn new(config: CheckpointConfig) -> Self {
        Self { config }
    }

    /// Creates the root directory and runs a cleanup pass.
    pub async fn open(config: CheckpointConfig) -> Result<Self, CheckpointError> {
        tokio::fs::create_dir_all(&config.dir).await?;
        let checkpointer = Self::new(config);
        let removed = checkpointer.cleanup().await?;
        tracing::info!(
            dir = %checkpointer.config.dir.display(),
            removed,
            "Checkpointer opened"
        );
        Ok(checkpointer)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Returns the root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    fn task_dir(&self, task_id: &str) -> Result<PathBuf, CheckpointError> {
        let valid = match &*TASK_ID_PATTERN {
            Ok(pattern) => pattern.is_match(task_id),
            Err(_) => false,
        };
        if valid {
            Ok(self.config.dir.join(task_id))
        } else {
            Err(CheckpointError::InvalidTaskId(task_id.to_string()))
        }
    }

    /// Persists the state after `stage` completed.
    pub async fn save(
        &self,
        state: &WorkflowState,
        stage: StageName,
    ) -> Result<TaskMetadata, CheckpointError> {
        let dir = self.task_dir(state.task_id())?;
        tokio::fs::create_dir_all(&dir).await?;

        let (record, minimal) = state_to_json(state);
        write_json_atomic(&dir.join(STATE_FILE), &record).await?;

        let now = Utc::now();
        let created_at = match self.load_metadata(state.task_id()).await {
            Ok(Some(existing)) => existing.created_at,
            _ => now,
        };
        let metadata = TaskMetadata {
            task_id: state.task_id().to_string(),
            task: truncate_preview(&state.task, self.config.task_preview_chars),
            created_at,
            updated_at: now,
            last_stage: Some(stage),
            status: TaskStatus::Running,
            iteration: state.iteration(),
            model: state.model.clone(),
        };
        write_json_atomic(&dir.join(METADATA_FILE), &serde_json::to_value(&metadata)?).await?;

        tracing::debug!(
            task_id = %state.task_id(),
            stage = %stage,
            iteration = state.iteration(),
            minimal,
            "Checkpoint written"
        );
        Ok(metadata)
    }

    /// Reads a task's metadata.
    pub async fn load_metadata(&self, task_id: &str) -> Result<Option<TaskMetadata>, CheckpointError> {
        let path = self.task_dir(task_id)?.join(METADATA_FILE);
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupted {
                task_id: task_id.to_string(),
                reason: format!("metadata: {e}"),
            })
    }

    /// Reads a task's metadata and state.
    pub async fn load(
        &self,
        task_id: &str,
    ) -> Result<Option<(TaskMetadata, WorkflowState)>, CheckpointError> {
        let Some(metadata) = self.load_metadata(task_id).await? else {
            return Ok(None);
        };

        let path = self.task_dir(task_id)?.join(STATE_FILE);
        let corrupted = |reason: String| CheckpointError::Corrupted {
            task_id: task_id.to_string(),
            reason,
        };

        let bytes = read_optional(&path)
            .await?
            .ok_or_else(|| corrupted("state record missing".to_string()))?;
        let record: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| corrupted(format!("state: {e}")))?;
        let mut state = state_from_json(record).map_err(|e| corrupted(e.to_string()))?;
        if state.task_id().is_empty() {
            state = state.with_task_id(task_id);
        }

        Ok(Some((metadata, state)))
    }

    async fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<(), CheckpointError> {
        let dir = self.task_dir(task_id)?;
        let Some(mut metadata) = self.load_metadata(task_id).await? else {
            tracing::debug!(task_id = %task_id, status = %status, "No checkpoint to update");
            return Ok(());
        };
        metadata.status = status;
        metadata.updated_at = Utc::now();
        write_json_atomic(&dir.join(METADATA_FILE), &serde_json::to_value(&metadata)?).await?;
        tracing::debug!(task_id = %task_id, status = %status, "Checkpoint status updated");
        Ok(())
    }

    /// Marks a task completed.
    pub async fn mark_completed(&self, task_id: &str) -> Result<(), CheckpointError> {
        self.set_status(task_id, TaskStatus::Completed).await
    }

    /// Marks a task failed.
    pub async fn mark_failed(&self, task_id: &str) -> Result<(), CheckpointError> {
        self.set_status(task_id, TaskStatus::Failed).await
    }

    /// Marks a task paused.
    pub async fn mark_paused(&self, task_id: &str) -> Result<(), CheckpointError> {
        self.set_status(task_id, TaskStatus::Paused).await
    }

    /// Marks a task running again.
    pub async fn mark_running(&self, task_id: &str) -> Result<(), CheckpointError> {
        self.set_status(task_id, TaskStatus::Running).await
    }

    /// Lists running and paused tasks, most recently updated first.
    pub async fn list_active(&self) -> Result<Vec<TaskMetadata>, CheckpointError> {
        let mut active: Vec<TaskMetadata> = self
            .scan()
            .await?
            .into_iter()
            .filter_map(|(_, metadata)| metadata)
            .filter(|m| m.status.is_active())
            .collect();
        active.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(active)
    }

    /// Deletes expired terminal tasks and directories without readable metadata.
    pub async fn cleanup(&self) -> Result<usize, CheckpointError> {
        let now = Utc::now();
        let retention = self.config.retention();
        let mut removed = 0;

        for (dir, metadata) in self.scan().await? {
            let expired = match &metadata {
                None => true,
                Some(m) => m.status.is_terminal() && m.age(now) > retention,
            };
            if !expired {
                continue;
            }

            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!(dir = %dir.display(), "Removed stale checkpoint");
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove checkpoint");
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Checkpoint cleanup finished");
        }
        Ok(removed)
    }

    /// Deletes one task's checkpoint. Returns false if none existed.
    pub async fn delete(&self, task_id: &str) -> Result<bool, CheckpointError> {
        let dir = self.task_dir(task_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // Every task directory with its metadata, `None` when missing or unreadable.
    async fn scan(&self) -> Result<Vec<(PathBuf, Option<TaskMetadata>)>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.config.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            let metadata = match read_optional(&path.join(METADATA_FILE)).await {
                Ok(Some(bytes)) => serde_json::from_slice::<TaskMetadata>(&bytes).ok(),
                Ok(None) | Err(_) => None,
            };
            found.push((path, metadata));
        }
        Ok(found)
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, CheckpointError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json_atomic(path: &Path, value: &serde_json::Value) -> Result<(), CheckpointError> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, buf).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ContextValue;
    use pretty_assertions::assert_eq;

    fn checkpointer(dir: &tempfile::TempDir) -> TaskCheckpointer {
        TaskCheckpointer::new(CheckpointConfig::at(dir.path()))
    }

    fn sample_state() -> WorkflowState {
        let mut state = WorkflowState::new("create a function that adds two numbers");
        state.plan = Some("1. define add".to_string());
        state.code = Some("fn add(a: i32, b: i32) -> i32 { a + b }".to_string());
        state.model = Some("coder-7b".to_string());
        state
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cp = checkpointer(&dir);
        let state = sample_state();

        let meta = cp.save(&state, StageName::GenerateCode).await.unwrap();
        assert_eq!(meta.last_stage, Some(StageName::GenerateCode));
        assert_eq!(meta.status, TaskStatus::Running);

        let (loaded_meta, loaded) = cp.load(state.task_id()).await.unwrap().unwrap();
        assert_eq!(loaded_meta, meta);
        assert_eq!(loaded.task_id(), state.task_id());
        assert_eq!(loaded.task, state.task);
        assert_eq!(loaded.plan, state.plan);
        assert_eq!(loaded.code, state.code);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join(state.task_id()))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_self_referential_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cp = checkpointer(&dir);
        let mut state = sample_state();

        let node = ContextValue::shared(ContextValue::Json(serde_json::Value::Null));
        *node.write() =
            ContextValue::object("Node", [("self".to_string(), ContextValue::Shared(node.clone()))]);
        state.extras.insert("node".to_string(), ContextValue::Shared(node));

        cp.save(&state, StageName::Plan).await.unwrap();
        let (_, loaded) = cp.load(state.task_id()).await.unwrap().unwrap();
        assert_eq!(loaded.code, state.code);
        assert!(loaded.extras.contains_key("node"));
    }

    #[tokio::test]
    async fn test_created_at_preserved_and_preview_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CheckpointConfig::at(dir.path());
        config.task_preview_chars = 10;
        let cp = TaskCheckpointer::new(config);
        let state = sample_state();

        let first = cp.save(&state, StageName::Intent).await.unwrap();
        let second = cp.save(&state, StageName::Plan).await.unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.task, "create ...");
    }

    #[tokio::test]
    async fn test_status_transitions_and_list_active() {
        let dir = tempfile::tempdir().unwrap();
        let cp = checkpointer(&dir);

        let a = sample_state().with_task_id("task-a");
        let b = sample_state().with_task_id("task-b");
        let c = sample_state().with_task_id("task-c");
        cp.save(&a, StageName::Plan).await.unwrap();
        cp.save(&b, StageName::Plan).await.unwrap();
        cp.save(&c, StageName::Plan).await.unwrap();

        cp.mark_completed("task-a").await.unwrap();
        cp.mark_paused("task-c").await.unwrap();

        let active: Vec<_> = cp
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.task_id)
            .collect();
        assert_eq!(active, vec!["task-c".to_string(), "task-b".to_string()]);

        let meta = cp.load_metadata("task-a").await.unwrap().unwrap();
        assert_eq!(meta.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_and_orphaned() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CheckpointConfig::at(dir.path());
        config.retention_hours = 0;
        let cp = TaskCheckpointer::new(config);

        let done = sample_state().with_task_id("done");
        let live = sample_state().with_task_id("live");
        cp.save(&done, StageName::Critique).await.unwrap();
        cp.save(&live, StageName::Plan).await.unwrap();
        cp.mark_completed("done").await.unwrap();
        std::fs::create_dir_all(dir.path().join("orphan")).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let removed = cp.cleanup().await.unwrap();

        assert_eq!(removed, 2);
        assert!(cp.load_metadata("done").await.unwrap().is_none());
        assert!(cp.load_metadata("live").await.unwrap().is_some());
        assert!(!dir.path().join("orphan").exists());
    }

    #[tokio::test]
    async fn test_open_runs_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();

        let cp = TaskCheckpointer::open(CheckpointConfig::at(dir.path())).await.unwrap();
        assert!(!cp.dir().join("broken").exists());
    }

    #[tokio::test]
    async fn test_invalid_task_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cp = checkpointer(&dir);
        let state = sample_state().with_task_id("../escape");

        let err = cp.save(&state, StageName::Plan).await.unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidTaskId(_)));
    }

    #[tokio::test]
    async fn test_missing_state_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let cp = checkpointer(&dir);
        let state = sample_state();
        cp.save(&state, StageName::Plan).await.unwrap();
        std::fs::remove_file(dir.path().join(state.task_id()).join(STATE_FILE)).unwrap();

        let err = cp.load(state.task_id()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupted { .. }));
    }

    #[tokio::test]
    async fn test_load_unknown_task() {
        let dir = tempfile::tempdir().unwrap();
        assert!(checkpointer(&dir).load("nope").await.unwrap().is_none());
        assert!(!checkpointer(&dir).delete("nope").await.unwrap());
    }
}
