use thiserror::Error;

#[derive(Debug, Error)]
pub enum HiveError {
    #[error("failed to acquire lock on {resource} after {retries} retries")]
    LockTimeout { resource: String, retries: u32 },

    #[error("invalid plan id '{0}': must be alphanumeric with '.', '_' or '-'")]
    InvalidPlanId(String),

    #[error("invalid branch name '{0}'")]
    InvalidBranch(String),

    #[error(
        "unknown status '{0}': must be pending, checking, building, merging, merged, conflict, build_failed, or merge_failed"
    )]
    InvalidStatus(String),

    #[error("unknown check result '{0}': must be pass or fail")]
    InvalidCheck(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HiveError>;
