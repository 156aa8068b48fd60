//! The small, always-written half of a checkpoint.

use crate::core::{StageName, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Listing record for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Task id.
    pub task_id: String,
    /// Task text, truncated.
    pub task: String,
    /// First checkpoint time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Most recently completed stage.
    #[serde(default)]
    pub last_stage: Option<StageName>,
    /// Lifecycle status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Repair iteration at the last checkpoint.
    #[serde(default)]
    pub iteration: u32,
    /// Model used by the last stage.
    #[serde(default)]
    pub model: Option<String>,
}

impl TaskMetadata {
    /// Returns the task's age since its last update.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }
}

/// Truncates to at most `max_chars` characters, marking the cut with "...".
#[must_use]
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_preview() {
        assert_eq!(truncate_preview("short", 10), "short");
        assert_eq!(truncate_preview("abcdefghij", 8), "abcde...");
        assert_eq!(truncate_preview("héllo wörld", 6), "hél...");
    }

    #[test]
    fn test_metadata_defaults_on_partial_record() {
        let json = serde_json::json!({
            "task_id": "t1",
            "task": "add",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-02T00:00:00Z"
        });
        let meta: TaskMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(meta.status, TaskStatus::Running);
        assert_eq!(meta.last_stage, None);
        assert_eq!(meta.iteration, 0);
    }
}
