use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dsync_core::{JobId, JobStatus, User};
use dsync_storage::Store;
use tracing::warn;

/// Cooperative stop request shared between the orchestrator and a running unit.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a phase needs to know about the job it runs under.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub user: User,
    store: Store,
    cancel: CancelFlag,
}

impl JobContext {
    pub fn new(job_id: JobId, user: User, store: Store, cancel: CancelFlag) -> Self {
        Self {
            job_id,
            user,
            store,
            cancel,
        }
    }

    /// True once this process raised the flag, or the job row was cancelled
    /// from elsewhere (another process sharing the database).
    pub async fn cancellation_requested(&self) -> bool {
        if self.cancel.is_set() {
            return true;
        }
        match self.store.job_status(self.job_id).await {
            Ok(Some(status)) => status == JobStatus::Cancelled,
            Ok(None) => true,
            Err(err) => {
                warn!(job_id = self.job_id, error = %err, "could not read job status");
                false
            }
        }
    }
}
