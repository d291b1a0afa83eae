use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    db_core::prelude::*,
    error::AppResult,
    model::sync_job::{NewSyncJob, SyncJobCtrl},
    rate_limiters::RateLimiters,
    server_config::QueueConfig,
};

pub const PROCESS_EMAIL_JOB: &str = "processEmail";

/// Work item payload: which message of which user to classify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEmailPayload {
    pub user_id: i32,
    pub message_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// What happened to a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { run_after_ms: i64 },
    Failed,
}

pub fn dedupe_key(user_id: i32, message_id: &str) -> String {
    let digest = Sha256::digest(format!("{user_id}:{message_id}").as_bytes());
    format!("{:x}", digest)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Durable, deduplicating job queue backed by the `sync_job` table
#[derive(Clone)]
pub struct JobQueue {
    conn: DatabaseConnection,
    rate_limiters: RateLimiters,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(conn: DatabaseConnection, rate_limiters: RateLimiters, config: QueueConfig) -> Self {
        Self {
            conn,
            rate_limiters,
            config,
        }
    }

    pub fn rate_limiters(&self) -> &RateLimiters {
        &self.rate_limiters
    }

    /// Returns true when the job was added, false when the key was already taken.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: &ProcessEmailPayload,
        dedupe_key: &str,
    ) -> AppResult<bool> {
        SyncJobCtrl::insert_if_absent(
            &self.conn,
            NewSyncJob {
                job_type,
                user_id: payload.user_id,
                message_id: &payload.message_id,
                dedupe_key,
            },
            now_ms(),
        )
        .await
    }

    pub async fn enqueue_message(&self, user_id: i32, message_id: &str) -> AppResult<bool> {
        let payload = ProcessEmailPayload {
            user_id,
            message_id: message_id.to_string(),
        };
        let key = dedupe_key(user_id, message_id);
        let added = self.enqueue(PROCESS_EMAIL_JOB, &payload, &key).await?;
        if !added {
            tracing::debug!(
                "Job for message {} of user {} already queued",
                message_id,
                user_id
            );
        }

        Ok(added)
    }

    /// Claims the oldest due job, if any. Losing a claim race just moves on to the next candidate.
    pub async fn claim_next(&self) -> AppResult<Option<sync_job::Model>> {
        loop {
            let now = now_ms();
            let Some(job) = SyncJobCtrl::find_next_pending(&self.conn, now).await? else {
                return Ok(None);
            };

            if SyncJobCtrl::try_claim(&self.conn, &job, now).await? {
                return Ok(Some(sync_job::Model {
                    status: JobStatus::Active,
                    attempts: job.attempts + 1,
                    updated_at_ms: now,
                    ..job
                }));
            }
        }
    }

    /// Waits for a dispatch slot, then claims a job.
    pub async fn next_job(&self) -> AppResult<Option<sync_job::Model>> {
        if !self.has_due_job().await? {
            return Ok(None);
        }
        self.rate_limiters.acquire_one().await;
        self.claim_next().await
    }

    async fn has_due_job(&self) -> AppResult<bool> {
        Ok(SyncJobCtrl::find_next_pending(&self.conn, now_ms())
            .await?
            .is_some())
    }

    pub async fn complete(&self, job: &sync_job::Model) -> AppResult<()> {
        SyncJobCtrl::mark_completed(&self.conn, job.id, now_ms()).await
    }

    /// Re-schedules with exponential backoff until `max_attempts` is used up.
    pub async fn fail(&self, job: &sync_job::Model, error: &str) -> AppResult<FailOutcome> {
        let now = now_ms();
        if job.attempts >= self.config.max_attempts {
            SyncJobCtrl::mark_failed(&self.conn, job.id, error, now).await?;
            tracing::error!(
                "Job {} for message {} failed permanently after {} attempts: {}",
                job.id,
                job.message_id,
                job.attempts,
                error
            );
            return Ok(FailOutcome::Failed);
        }

        let run_after_ms = now + self.retry_delay_ms(job.attempts);
        SyncJobCtrl::reschedule(&self.conn, job.id, run_after_ms, error, now).await?;
        tracing::warn!(
            "Job {} for message {} failed (attempt {}), retrying: {}",
            job.id,
            job.message_id,
            job.attempts,
            error
        );

        Ok(FailOutcome::Retrying { run_after_ms })
    }

    fn retry_delay_ms(&self, attempts: i32) -> i64 {
        let exponent = (attempts - 1).clamp(0, 20) as u32;
        let delay = self.config.retry_base_delay_ms.saturating_mul(1u64 << exponent);
        i64::try_from(delay).unwrap_or(i64::MAX)
    }

    pub async fn recover_stale(&self) -> AppResult<u64> {
        let now = now_ms();
        let stale_before = now - self.config.stale_after().as_millis() as i64;
        let recovered = SyncJobCtrl::recover_stale(&self.conn, stale_before, now).await?;
        if recovered > 0 {
            tracing::warn!("Recovered {} stale jobs", recovered);
        }

        Ok(recovered)
    }

    pub async fn counts(&self) -> AppResult<QueueCounts> {
        Ok(QueueCounts {
            waiting: SyncJobCtrl::count_by_status(&self.conn, JobStatus::Pending).await?,
            active: SyncJobCtrl::count_by_status(&self.conn, JobStatus::Active).await?,
            completed: SyncJobCtrl::count_by_status(&self.conn, JobStatus::Completed).await?,
            failed: SyncJobCtrl::count_by_status(&self.conn, JobStatus::Failed).await?,
        })
    }
}
