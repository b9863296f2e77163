use crate::errors::DeviceLinkError;
use crate::store::CodeStore;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Initialize and start the job scheduler with all background tasks
pub async fn init_scheduler(
    store: Arc<dyn CodeStore>,
    schedule: &str,
) -> Result<JobScheduler, DeviceLinkError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| DeviceLinkError::Other(format!("Failed to create job scheduler: {}", e)))?;

    // Lookups already hide expired codes; this only reclaims the rows
    let sweep_job = Job::new_async(schedule, move |_uuid, _l| {
        let store = store.clone();
        Box::pin(async move {
            run_sweep(store.as_ref()).await;
        })
    })
    .map_err(|e| DeviceLinkError::Other(format!("Failed to create sweep job: {}", e)))?;

    sched
        .add(sweep_job)
        .await
        .map_err(|e| DeviceLinkError::Other(format!("Failed to add sweep job: {}", e)))?;

    sched
        .start()
        .await
        .map_err(|e| DeviceLinkError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!(schedule, "Job scheduler started");

    Ok(sched)
}

/// Delete expired device codes once. Returns how many were removed.
pub async fn run_sweep(store: &dyn CodeStore) -> u64 {
    match store.purge_expired().await {
        Ok(count) => {
            if count > 0 {
                info!("Cleaned up {} expired device codes", count);
            }
            count
        }
        Err(e) => {
            error!("Failed to cleanup expired device codes: {}", e);
            0
        }
    }
}
