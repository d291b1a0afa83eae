use anyhow::Context;

use crate::{db_core::prelude::*, error::AppResult};

pub struct NewSyncJob<'a> {
    pub job_type: &'a str,
    pub user_id: i32,
    pub message_id: &'a str,
    pub dedupe_key: &'a str,
}

pub struct SyncJobCtrl;

impl SyncJobCtrl {
    /// Returns false when a job with the same dedupe key already exists, whatever its status.
    pub async fn insert_if_absent(
        conn: &DatabaseConnection,
        job: NewSyncJob<'_>,
        now_ms: i64,
    ) -> AppResult<bool> {
        let active_model = sync_job::ActiveModel {
            id: ActiveValue::NotSet,
            dedupe_key: ActiveValue::Set(job.dedupe_key.to_string()),
            job_type: ActiveValue::Set(job.job_type.to_string()),
            user_id: ActiveValue::Set(job.user_id),
            message_id: ActiveValue::Set(job.message_id.to_string()),
            status: ActiveValue::Set(JobStatus::Pending),
            attempts: ActiveValue::Set(0),
            last_error: ActiveValue::Set(None),
            run_after_ms: ActiveValue::Set(now_ms),
            created_at_ms: ActiveValue::Set(now_ms),
            updated_at_ms: ActiveValue::Set(now_ms),
        };

        let inserted = SyncJob::insert(active_model)
            .on_conflict(
                OnConflict::column(sync_job::Column::DedupeKey)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await
            .context("Error inserting sync job")?;

        Ok(inserted > 0)
    }

    pub async fn find_next_pending(
        conn: &DatabaseConnection,
        now_ms: i64,
    ) -> AppResult<Option<sync_job::Model>> {
        let job = SyncJob::find()
            .filter(sync_job::Column::Status.eq(JobStatus::Pending))
            .filter(sync_job::Column::RunAfterMs.lte(now_ms))
            .order_by_asc(sync_job::Column::RunAfterMs)
            .order_by_asc(sync_job::Column::Id)
            .one(conn)
            .await
            .context("Error fetching next sync job")?;

        Ok(job)
    }

    /// Moves a pending job to active and counts the attempt.
    /// Only one caller can win the claim for a given job.
    pub async fn try_claim(
        conn: &DatabaseConnection,
        job: &sync_job::Model,
        now_ms: i64,
    ) -> AppResult<bool> {
        let result = SyncJob::update_many()
            .set(sync_job::ActiveModel {
                status: ActiveValue::Set(JobStatus::Active),
                attempts: ActiveValue::Set(job.attempts + 1),
                updated_at_ms: ActiveValue::Set(now_ms),
                ..Default::default()
            })
            .filter(sync_job::Column::Id.eq(job.id))
            .filter(sync_job::Column::Status.eq(JobStatus::Pending))
            .filter(sync_job::Column::Attempts.eq(job.attempts))
            .exec(conn)
            .await
            .context("Error claiming sync job")?;

        Ok(result.rows_affected == 1)
    }

    pub async fn mark_completed(conn: &DatabaseConnection, id: i64, now_ms: i64) -> AppResult<()> {
        SyncJob::update_many()
            .set(sync_job::ActiveModel {
                status: ActiveValue::Set(JobStatus::Completed),
                last_error: ActiveValue::Set(None),
                updated_at_ms: ActiveValue::Set(now_ms),
                ..Default::default()
            })
            .filter(sync_job::Column::Id.eq(id))
            .exec(conn)
            .await
            .context("Error completing sync job")?;

        Ok(())
    }

    pub async fn reschedule(
        conn: &DatabaseConnection,
        id: i64,
        run_after_ms: i64,
        error: &str,
        now_ms: i64,
    ) -> AppResult<()> {
        SyncJob::update_many()
            .set(sync_job::ActiveModel {
                status: ActiveValue::Set(JobStatus::Pending),
                last_error: ActiveValue::Set(Some(error.to_string())),
                run_after_ms: ActiveValue::Set(run_after_ms),
                updated_at_ms: ActiveValue::Set(now_ms),
                ..Default::default()
            })
            .filter(sync_job::Column::Id.eq(id))
            .exec(conn)
            .await
            .context("Error rescheduling sync job")?;

        Ok(())
    }

    pub async fn mark_failed(
        conn: &DatabaseConnection,
        id: i64,
        error: &str,
        now_ms: i64,
    ) -> AppResult<()> {
        SyncJob::update_many()
            .set(sync_job::ActiveModel {
                status: ActiveValue::Set(JobStatus::Failed),
                last_error: ActiveValue::Set(Some(error.to_string())),
                updated_at_ms: ActiveValue::Set(now_ms),
                ..Default::default()
            })
            .filter(sync_job::Column::Id.eq(id))
            .exec(conn)
            .await
            .context("Error failing sync job")?;

        Ok(())
    }

    /// Puts jobs that were left active by a crashed worker back to pending.
    pub async fn recover_stale(
        conn: &DatabaseConnection,
        stale_before_ms: i64,
        now_ms: i64,
    ) -> AppResult<u64> {
        let result = SyncJob::update_many()
            .set(sync_job::ActiveModel {
                status: ActiveValue::Set(JobStatus::Pending),
                run_after_ms: ActiveValue::Set(now_ms),
                updated_at_ms: ActiveValue::Set(now_ms),
                ..Default::default()
            })
            .filter(sync_job::Column::Status.eq(JobStatus::Active))
            .filter(sync_job::Column::UpdatedAtMs.lt(stale_before_ms))
            .exec(conn)
            .await
            .context("Error recovering stale sync jobs")?;

        Ok(result.rows_affected)
    }

    pub async fn count_by_status(conn: &DatabaseConnection, status: JobStatus) -> AppResult<u64> {
        let count = SyncJob::find()
            .filter(sync_job::Column::Status.eq(status))
            .count(conn)
            .await
            .context("Error counting sync jobs")?;

        Ok(count)
    }

    pub async fn get(conn: &DatabaseConnection, id: i64) -> AppResult<Option<sync_job::Model>> {
        let job = SyncJob::find_by_id(id)
            .one(conn)
            .await
            .context("Error fetching sync job")?;

        Ok(job)
    }

    pub async fn get_by_dedupe_key(
        conn: &DatabaseConnection,
        dedupe_key: &str,
    ) -> AppResult<Option<sync_job::Model>> {
        let job = SyncJob::find()
            .filter(sync_job::Column::DedupeKey.eq(dedupe_key))
            .one(conn)
            .await
            .context("Error fetching sync job by dedupe key")?;

        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::common::setup_db;

    fn new_job<'a>(message_id: &'a str, dedupe_key: &'a str) -> NewSyncJob<'a> {
        NewSyncJob {
            job_type: "processEmail",
            user_id: 1,
            message_id,
            dedupe_key,
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_dedupes_on_key() {
        let conn = setup_db().await;

        assert!(SyncJobCtrl::insert_if_absent(&conn, new_job("m1", "k1"), 0)
            .await
            .unwrap());
        assert!(!SyncJobCtrl::insert_if_absent(&conn, new_job("m1", "k1"), 10)
            .await
            .unwrap());
        assert!(SyncJobCtrl::insert_if_absent(&conn, new_job("m2", "k2"), 10)
            .await
            .unwrap());

        assert_eq!(SyncJob::find().count(&conn).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let conn = setup_db().await;
        SyncJobCtrl::insert_if_absent(&conn, new_job("m1", "k1"), 0)
            .await
            .unwrap();

        let job = SyncJobCtrl::find_next_pending(&conn, 0)
            .await
            .unwrap()
            .unwrap();
        assert!(SyncJobCtrl::try_claim(&conn, &job, 1).await.unwrap());
        assert!(!SyncJobCtrl::try_claim(&conn, &job, 2).await.unwrap());

        let claimed = SyncJobCtrl::get(&conn, job.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.attempts, 1);
        assert!(SyncJobCtrl::find_next_pending(&conn, 5)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_rescheduled_job_waits_until_due() {
        let conn = setup_db().await;
        SyncJobCtrl::insert_if_absent(&conn, new_job("m1", "k1"), 0)
            .await
            .unwrap();
        let job = SyncJobCtrl::find_next_pending(&conn, 0)
            .await
            .unwrap()
            .unwrap();
        SyncJobCtrl::try_claim(&conn, &job, 0).await.unwrap();

        SyncJobCtrl::reschedule(&conn, job.id, 1_000, "boom", 0)
            .await
            .unwrap();

        assert!(SyncJobCtrl::find_next_pending(&conn, 999)
            .await
            .unwrap()
            .is_none());
        let due = SyncJobCtrl::find_next_pending(&conn, 1_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(due.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_recover_stale_only_touches_old_active_jobs() {
        let conn = setup_db().await;
        for (message_id, key) in [("m1", "k1"), ("m2", "k2")] {
            SyncJobCtrl::insert_if_absent(&conn, new_job(message_id, key), 0)
                .await
                .unwrap();
            let job = SyncJobCtrl::get_by_dedupe_key(&conn, key)
                .await
                .unwrap()
                .unwrap();
            let claimed_at = if message_id == "m1" { 100 } else { 5_000 };
            SyncJobCtrl::try_claim(&conn, &job, claimed_at)
                .await
                .unwrap();
        }

        let recovered = SyncJobCtrl::recover_stale(&conn, 1_000, 6_000)
            .await
            .unwrap();

        assert_eq!(recovered, 1);
        assert_eq!(
            SyncJobCtrl::count_by_status(&conn, JobStatus::Pending)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            SyncJobCtrl::count_by_status(&conn, JobStatus::Active)
                .await
                .unwrap(),
            1
        );
    }
}
