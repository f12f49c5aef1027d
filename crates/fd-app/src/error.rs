use thiserror::Error;

use fd_core::PayloadError;

#[derive(Error, Debug)]
pub enum AppError {
    /// A generation job is already in flight; the orchestrator holds a
    /// single pending slot.
    #[error("a generation job is already running")]
    Busy,

    #[error(transparent)]
    Payload(#[from] PayloadError),

    // Remote errors are shown to the user verbatim, so no prefix here.
    #[error("{0}")]
    Remote(String),

    #[error("{0}")]
    MalformedResponse(String),

    #[error("{0}")]
    Persistence(#[from] std::io::Error),
}
