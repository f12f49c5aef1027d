use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fd_core::GenerationMode;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states are final; a handle never transitions out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Lifecycle token for one in-flight generation request.
#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub mode: GenerationMode,
    pub endpoint: String,
    pub submitted_at: DateTime<Utc>,
    pub status: JobStatus,
}
