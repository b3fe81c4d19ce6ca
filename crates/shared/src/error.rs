use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON error body returned by the backend alongside non-success statuses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiErrorBody {
    /// Best human-readable description carried by the body, if any.
    pub fn describe(&self) -> Option<&str> {
        self.message
            .as_deref()
            .or(self.error.as_deref())
            .filter(|text| !text.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("processed meetings {processed} exceed total meetings {total}")]
    ProgressOverflow { processed: u64, total: u64 },
}
