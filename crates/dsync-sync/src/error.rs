use dsync_core::{JobId, JobStatus, UserId};
use dsync_providers::{NormalizeError, ProviderError};
use dsync_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("user {0} not found")]
    UserNotFound(UserId),
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("job {job_id} does not belong to user {user_id}")]
    Forbidden { job_id: JobId, user_id: UserId },
    #[error("user {user_id} already has a pending or running sync job")]
    Conflict { user_id: UserId },
    #[error("job {job_id} is {status} and can no longer be cancelled")]
    NotCancellable { job_id: JobId, status: JobStatus },
}

impl SyncError {
    /// Provider outages defer a record instead of spending an attempt.
    pub fn is_outage(&self) -> bool {
        matches!(self, Self::Provider(err) if err.is_outage())
    }
}
