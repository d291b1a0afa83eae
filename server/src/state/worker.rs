use std::panic::AssertUnwindSafe;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::anyhow;
use futures::FutureExt;

use crate::{
    db_core::prelude::*,
    email::{client::MailClientProvider, message::MessageFields},
    error::{AppError, AppResult},
    model::{category::CategoryCtrl, processed_email::ProcessedEmailCtrl},
    prompt::classify::ClassificationEngine,
    queue::{FailOutcome, JobQueue, PROCESS_EMAIL_JOB},
};

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub processed: AtomicU64,
    pub retried: AtomicU64,
    pub failed: AtomicU64,
}

/// Takes jobs off the queue one at a time and stores their classification.
#[derive(Clone)]
pub struct Worker {
    conn: DatabaseConnection,
    job_queue: JobQueue,
    mail_provider: Arc<dyn MailClientProvider>,
    engine: ClassificationEngine,
    stats: Arc<WorkerStats>,
}

impl Worker {
    pub fn new(
        conn: DatabaseConnection,
        job_queue: JobQueue,
        mail_provider: Arc<dyn MailClientProvider>,
        engine: ClassificationEngine,
    ) -> Self {
        Self {
            conn,
            job_queue,
            mail_provider,
            engine,
            stats: Arc::default(),
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Fetch, classify and persist one message. Only fetch and storage errors are returned.
    pub async fn process_job(&self, job: &sync_job::Model) -> AppResult<()> {
        if job.job_type != PROCESS_EMAIL_JOB {
            return Err(anyhow!("Unknown job type {}", job.job_type).into());
        }

        let client = self.mail_provider.get_client(job.user_id).await?;
        let message = client.get_message(&job.message_id).await?;
        let fields = MessageFields::from(&message);

        let categories = CategoryCtrl::list_for_user(&self.conn, job.user_id).await?;
        let result = self.engine.classify(&fields, &categories).await;

        ProcessedEmailCtrl::upsert(&self.conn, job.user_id, &job.message_id, &fields, &result)
            .await?;

        tracing::info!(
            "Processed message {} for user {} as {} ({:.2})",
            job.message_id,
            job.user_id,
            result.category,
            result.confidence
        );

        Ok(())
    }

    /// Runs at most one job. Returns false when nothing was due.
    pub async fn run_once(&self) -> AppResult<bool> {
        let Some(job) = self.job_queue.next_job().await? else {
            return Ok(false);
        };

        let result = AssertUnwindSafe(self.process_job(&job)).catch_unwind().await;
        let settled = match result {
            Ok(Ok(())) => self.job_queue.complete(&job).await.map(|()| None),
            Ok(Err(e)) => {
                if matches!(e, AppError::TooManyRequests) {
                    self.job_queue.rate_limiters().trigger_backoff();
                }
                self.job_queue.fail(&job, &e.to_string()).await.map(Some)
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "Unknown panic".to_string());
                tracing::error!("Job {} panicked: {}", job.id, msg);
                self.job_queue
                    .fail(&job, &format!("panic: {msg}"))
                    .await
                    .map(Some)
            }
        };
        // Spacing counts from here even when the job row could not be updated
        self.job_queue.rate_limiters().record_finished().await;

        match settled? {
            None => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Some(FailOutcome::Retrying { .. }) => {
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
            }
            Some(FailOutcome::Failed) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(true)
    }
}
