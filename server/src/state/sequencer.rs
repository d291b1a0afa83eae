use std::sync::Arc;

use crate::{
    db_core::prelude::*,
    email::client::MailClientProvider,
    error::{AppError, AppResult},
    model::user::UserCtrl,
    queue::JobQueue,
};

use super::{backfill::BackfillTasks, history::fetch_added_message_ids, user_locks::UserLocks};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// First notification: watermark set and backfill scheduled
    Initialized,
    Advanced { previous: i64, enqueued: usize },
    /// Not newer than the stored watermark, nothing done
    Stale { current: i64 },
    /// The user was removed between lookup and sequencing
    UserMissing,
}

/// Applies notifications one user at a time and moves the watermark forward only.
#[derive(Clone)]
pub struct Sequencer {
    conn: DatabaseConnection,
    job_queue: JobQueue,
    mail_provider: Arc<dyn MailClientProvider>,
    backfill: BackfillTasks,
    locks: UserLocks,
}

impl Sequencer {
    pub fn new(
        conn: DatabaseConnection,
        job_queue: JobQueue,
        mail_provider: Arc<dyn MailClientProvider>,
        backfill: BackfillTasks,
        locks: UserLocks,
    ) -> Self {
        Self {
            conn,
            job_queue,
            mail_provider,
            backfill,
            locks,
        }
    }

    pub async fn handle(&self, user_id: i32, history_id: i64) -> AppResult<SequenceOutcome> {
        let _guard = self.locks.lock(user_id).await;

        loop {
            let watermark = match UserCtrl::get_by_id(&self.conn, user_id).await {
                Ok(user) => user.watermark,
                Err(AppError::NotFound(_)) => return Ok(SequenceOutcome::UserMissing),
                Err(e) => return Err(e),
            };

            let Some(current) = watermark else {
                if UserCtrl::initialize_watermark(&self.conn, user_id, history_id).await? {
                    tracing::info!(
                        "Watermark for user {} initialized at {}, scheduling backfill",
                        user_id,
                        history_id
                    );
                    self.backfill.schedule(user_id);
                    return Ok(SequenceOutcome::Initialized);
                }
                // Set by another process in the meantime
                continue;
            };

            if history_id <= current {
                tracing::debug!(
                    "Stale notification for user {}: {} <= {}",
                    user_id,
                    history_id,
                    current
                );
                return Ok(SequenceOutcome::Stale { current });
            }

            // The watermark moves only after the whole range is enqueued
            let client = self.mail_provider.get_client(user_id).await?;
            let message_ids = fetch_added_message_ids(client.as_ref(), current, history_id).await?;

            let mut enqueued = 0;
            for message_id in &message_ids {
                if self.job_queue.enqueue_message(user_id, message_id).await? {
                    enqueued += 1;
                }
            }

            if !UserCtrl::advance_watermark(&self.conn, user_id, current, history_id).await? {
                // Moved by another process; enqueued ids are collapsed by their dedupe key
                continue;
            }

            tracing::info!(
                "User {} advanced {} -> {}, {} new jobs",
                user_id,
                current,
                history_id,
                enqueued
            );
            return Ok(SequenceOutcome::Advanced {
                previous: current,
                enqueued,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        rate_limiters::RateLimiters,
        testing::common::{
            create_user_with_categories, setup_db, test_backfill_config, test_queue_config,
            FakeMailProvider,
        },
    };
    use std::time::Duration;

    struct Harness {
        conn: DatabaseConnection,
        sequencer: Sequencer,
        backfill: BackfillTasks,
        provider: FakeMailProvider,
        queue: JobQueue,
        locks: UserLocks,
    }

    async fn harness() -> Harness {
        let conn = setup_db().await;
        let queue = JobQueue::new(
            conn.clone(),
            RateLimiters::new(100, Duration::from_millis(10), Duration::from_secs(1)),
            test_queue_config(),
        );
        let provider = FakeMailProvider::new();
        let mail_provider: Arc<dyn MailClientProvider> = Arc::new(provider.clone());
        let backfill =
            BackfillTasks::new(queue.clone(), mail_provider.clone(), test_backfill_config());
        let locks = UserLocks::new();
        let sequencer = Sequencer::new(
            conn.clone(),
            queue.clone(),
            mail_provider,
            backfill.clone(),
            locks.clone(),
        );

        Harness {
            conn,
            sequencer,
            backfill,
            provider,
            queue,
            locks,
        }
    }

    async fn watermark(conn: &DatabaseConnection, user_id: i32) -> Option<i64> {
        UserCtrl::get_by_id(conn, user_id).await.unwrap().watermark
    }

    #[tokio::test]
    async fn test_first_notification_initializes_and_backfills() {
        let h = harness().await;
        let user_id = create_user_with_categories(&h.conn, "a@example.com", &[]).await;
        h.provider.mailbox(user_id).set_search_results(&["old1"]);

        let outcome = h.sequencer.handle(user_id, 100).await.unwrap();

        assert_eq!(outcome, SequenceOutcome::Initialized);
        assert_eq!(watermark(&h.conn, user_id).await, Some(100));
        assert_eq!(h.provider.mailbox(user_id).history_calls(), 0);

        h.backfill.wait_idle().await;
        assert_eq!(h.queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_advance_enqueues_added_messages() {
        let h = harness().await;
        let user_id = create_user_with_categories(&h.conn, "a@example.com", &[]).await;
        h.sequencer.handle(user_id, 100).await.unwrap();
        h.backfill.wait_idle().await;
        let mailbox = h.provider.mailbox(user_id);
        mailbox.add_message(103, "msgA", "Hi", "x@example.com");
        mailbox.add_message(105, "msgB", "Hey", "y@example.com");

        let outcome = h.sequencer.handle(user_id, 105).await.unwrap();

        assert_eq!(
            outcome,
            SequenceOutcome::Advanced {
                previous: 100,
                enqueued: 2
            }
        );
        assert_eq!(watermark(&h.conn, user_id).await, Some(105));
        assert_eq!(h.queue.counts().await.unwrap().waiting, 2);
    }

    #[tokio::test]
    async fn test_redelivery_and_out_of_order_are_stale() {
        let h = harness().await;
        let user_id = create_user_with_categories(&h.conn, "a@example.com", &[]).await;
        h.sequencer.handle(user_id, 100).await.unwrap();
        h.provider
            .mailbox(user_id)
            .add_message(105, "msgA", "Hi", "x@example.com");
        h.sequencer.handle(user_id, 105).await.unwrap();
        let history_calls = h.provider.mailbox(user_id).history_calls();

        assert_eq!(
            h.sequencer.handle(user_id, 105).await.unwrap(),
            SequenceOutcome::Stale { current: 105 }
        );
        assert_eq!(
            h.sequencer.handle(user_id, 103).await.unwrap(),
            SequenceOutcome::Stale { current: 105 }
        );
        assert_eq!(h.provider.mailbox(user_id).history_calls(), history_calls);
        assert_eq!(watermark(&h.conn, user_id).await, Some(105));
    }

    #[tokio::test]
    async fn test_watermark_ends_at_maximum_for_any_order() {
        let orders: [&[i64]; 4] = [
            &[100, 105, 103, 110, 101],
            &[110, 105, 103, 100, 101],
            &[101, 103, 100, 105, 110],
            &[105, 105, 110, 110, 103],
        ];

        for order in orders {
            let h = harness().await;
            let user_id = create_user_with_categories(&h.conn, "a@example.com", &[]).await;

            let mut highest = None;
            for &history_id in order {
                let outcome = h.sequencer.handle(user_id, history_id).await.unwrap();
                match highest {
                    Some(top) if history_id <= top => {
                        assert_eq!(outcome, SequenceOutcome::Stale { current: top });
                    }
                    _ => highest = Some(history_id),
                }
            }

            assert_eq!(watermark(&h.conn, user_id).await, highest);
            assert_eq!(highest, order.iter().max().copied());
        }
    }

    #[tokio::test]
    async fn test_concurrent_notifications_for_one_user() {
        let h = harness().await;
        let user_id = create_user_with_categories(&h.conn, "a@example.com", &[]).await;
        h.sequencer.handle(user_id, 100).await.unwrap();

        let handles = (101..=120)
            .rev()
            .map(|history_id| {
                let sequencer = h.sequencer.clone();
                tokio::spawn(async move { sequencer.handle(user_id, history_id).await })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(watermark(&h.conn, user_id).await, Some(120));
    }

    #[tokio::test]
    async fn test_users_do_not_block_each_other() {
        let h = harness().await;
        let alice = create_user_with_categories(&h.conn, "alice@example.com", &[]).await;
        let bob = create_user_with_categories(&h.conn, "bob@example.com", &[]).await;
        h.sequencer.handle(alice, 100).await.unwrap();
        h.sequencer.handle(bob, 200).await.unwrap();
        h.provider.mailbox(alice).delay_history(Duration::from_millis(300));

        // Alice's sequencing is stuck in a slow history call while Bob's goes through
        let alice_handle = {
            let sequencer = h.sequencer.clone();
            tokio::spawn(async move { sequencer.handle(alice, 101).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let bob_outcome = tokio::time::timeout(
            Duration::from_millis(200),
            h.sequencer.handle(bob, 201),
        )
        .await
        .expect("bob should not wait for alice")
        .unwrap();

        assert!(matches!(bob_outcome, SequenceOutcome::Advanced { .. }));
        assert_eq!(watermark(&h.conn, bob).await, Some(201));
        assert_eq!(watermark(&h.conn, alice).await, Some(100));

        alice_handle.await.unwrap().unwrap();
        assert_eq!(watermark(&h.conn, alice).await, Some(101));
    }

    #[tokio::test]
    async fn test_parallel_users_both_advance() {
        let h = harness().await;
        let alice = create_user_with_categories(&h.conn, "alice@example.com", &[]).await;
        let bob = create_user_with_categories(&h.conn, "bob@example.com", &[]).await;

        let (a, b) = futures::join!(h.sequencer.handle(alice, 10), h.sequencer.handle(bob, 20));

        assert_eq!(a.unwrap(), SequenceOutcome::Initialized);
        assert_eq!(b.unwrap(), SequenceOutcome::Initialized);
        assert_eq!(watermark(&h.conn, alice).await, Some(10));
        assert_eq!(watermark(&h.conn, bob).await, Some(20));
        assert!(h.locks.is_empty());
    }

    #[tokio::test]
    async fn test_history_failure_surfaces_error() {
        let h = harness().await;
        let user_id = create_user_with_categories(&h.conn, "a@example.com", &[]).await;
        h.sequencer.handle(user_id, 100).await.unwrap();
        h.provider.mailbox(user_id).fail_history(true);

        assert!(h.sequencer.handle(user_id, 105).await.is_err());
        assert_eq!(h.queue.counts().await.unwrap().waiting, 0);
        assert_eq!(watermark(&h.conn, user_id).await, Some(100));
    }

    #[tokio::test]
    async fn test_redelivery_after_history_failure_enqueues_range() {
        let h = harness().await;
        let user_id = create_user_with_categories(&h.conn, "a@example.com", &[]).await;
        h.sequencer.handle(user_id, 100).await.unwrap();
        h.backfill.wait_idle().await;
        let mailbox = h.provider.mailbox(user_id);
        mailbox.add_message(103, "msgA", "Hi", "x@example.com");

        mailbox.fail_history(true);
        assert!(h.sequencer.handle(user_id, 105).await.is_err());
        mailbox.fail_history(false);

        let outcome = h.sequencer.handle(user_id, 105).await.unwrap();

        assert_eq!(
            outcome,
            SequenceOutcome::Advanced {
                previous: 100,
                enqueued: 1
            }
        );
        assert_eq!(watermark(&h.conn, user_id).await, Some(105));
        assert_eq!(h.queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_credential_failure_keeps_watermark() {
        let h = harness().await;
        let user_id = create_user_with_categories(&h.conn, "a@example.com", &[]).await;
        h.sequencer.handle(user_id, 100).await.unwrap();
        h.backfill.wait_idle().await;
        h.provider
            .mailbox(user_id)
            .add_message(103, "msgA", "Hi", "x@example.com");

        h.provider.fail_credentials(true);
        assert!(h.sequencer.handle(user_id, 105).await.is_err());
        assert_eq!(watermark(&h.conn, user_id).await, Some(100));

        h.provider.fail_credentials(false);
        h.sequencer.handle(user_id, 105).await.unwrap();
        assert_eq!(h.queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_missing_user() {
        let h = harness().await;

        assert_eq!(
            h.sequencer.handle(999, 100).await.unwrap(),
            SequenceOutcome::UserMissing
        );
    }
}
