//! Task: a named logical unit grouping Jobs

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Stable, client-chosen task identifier
pub type TaskId = String;

static TASK_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,128}$").expect("task id pattern"));

/// A named logical unit; container for Jobs sharing configuration
/// conventions and pool-matching.
///
/// Tasks are append-only in practice: they are created on first submission
/// and live as long as Jobs refer to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable, unique, client-chosen identifier
    pub task_id: TaskId,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last modified timestamp
    pub last_modified_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task record
    pub fn new(task_id: impl Into<TaskId>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            created_at: now,
            last_modified_at: now,
        }
    }

    /// Validate a client-supplied task identifier
    pub fn validate_id(task_id: &str) -> Result<()> {
        if TASK_ID_PATTERN.is_match(task_id) {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "invalid task id '{}': expected [A-Za-z0-9_.-], 1-128 chars",
                task_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_task_ids() {
        assert!(Task::validate_id("backup").is_ok());
        assert!(Task::validate_id("etl.daily-01_v2").is_ok());
    }

    #[test]
    fn test_invalid_task_ids() {
        assert!(Task::validate_id("").is_err());
        assert!(Task::validate_id("has space").is_err());
        assert!(Task::validate_id("slash/ed").is_err());
        assert!(Task::validate_id(&"x".repeat(200)).is_err());
    }
}
