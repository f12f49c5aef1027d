use uuid::Uuid;

use crate::remote::GeneratedImage;

/// What the background worker hands back to the foreground, exactly once
/// per job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Finished {
        job_id: Uuid,
        images: Vec<GeneratedImage>,
        saved_files: Vec<String>,
        seed: Option<i64>,
    },
    Failed {
        job_id: Uuid,
        error: String,
    },
}
