use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::queue::JobQueue;

use super::worker::Worker;

/// The single consumer loop. Jobs run strictly one after another.
pub fn run_worker_loop(worker: Worker, idle_poll: Duration) -> JoinHandle<()> {
    tracing::info!("Starting worker loop...");

    tokio::spawn(async move {
        loop {
            let result = AssertUnwindSafe(worker.run_once()).catch_unwind().await;

            match result {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    // No work available, sleep before checking again
                    tokio::time::sleep(idle_poll).await;
                }
                Ok(Err(e)) => {
                    tracing::error!("Worker loop error: {:?}", e);
                    tokio::time::sleep(idle_poll).await;
                }
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "Unknown panic".to_string());
                    tracing::error!("Worker loop panicked, recovering: {}", msg);
                }
            }
        }
    })
}

pub async fn recover_stale_jobs(job_queue: JobQueue) {
    match job_queue.recover_stale().await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Returned {} abandoned jobs to the queue", n),
        Err(e) => tracing::error!("Failed to recover stale jobs: {:?}", e),
    }
}

pub fn watch(job_queue: JobQueue, worker: Worker, every: Duration) -> JoinHandle<()> {
    let mut interval = interval(every);
    let mut now = std::time::Instant::now();
    let mut last_recorded = 0;
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            let processed = worker.stats().processed.load(Ordering::Relaxed);
            let diff = processed - last_recorded;
            let emails_per_second = diff as f64 / now.elapsed().as_secs_f64();
            now = std::time::Instant::now();
            last_recorded = processed;
            let limiter_status = job_queue.rate_limiters().get_status();

            match job_queue.counts().await {
                Ok(counts) => tracing::info!(
                    "Worker Status Update:\n{emails_per_second:.2} emails/s Bucket {limiter_status}\nwaiting {} active {} completed {} failed {} (retried {})",
                    counts.waiting,
                    counts.active,
                    counts.completed,
                    counts.failed,
                    worker.stats().retried.load(Ordering::Relaxed),
                ),
                Err(e) => tracing::error!("Could not read queue counts: {:?}", e),
            }
        }
    })
}
