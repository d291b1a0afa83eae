use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;

use crate::{
    email::client::MailClientProvider, error::AppResult, queue::JobQueue,
    server_config::BackfillConfig,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillFailure {
    pub user_id: i32,
    pub error: String,
}

/// Owns every running backfill. Failures are logged and broadcast to subscribers.
#[derive(Clone)]
pub struct BackfillTasks {
    tracker: TaskTracker,
    failures: broadcast::Sender<BackfillFailure>,
    job_queue: JobQueue,
    mail_provider: Arc<dyn MailClientProvider>,
    config: BackfillConfig,
}

impl BackfillTasks {
    pub fn new(
        job_queue: JobQueue,
        mail_provider: Arc<dyn MailClientProvider>,
        config: BackfillConfig,
    ) -> Self {
        let (failures, _) = broadcast::channel(64);
        Self {
            tracker: TaskTracker::new(),
            failures,
            job_queue,
            mail_provider,
            config,
        }
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<BackfillFailure> {
        self.failures.subscribe()
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Starts the backfill in the background and returns immediately.
    pub fn schedule(&self, user_id: i32) {
        let tasks = self.clone();
        self.tracker.spawn(async move {
            match tasks.run(user_id).await {
                Ok(enqueued) => {
                    tracing::info!("Backfill for user {} enqueued {} jobs", user_id, enqueued);
                }
                Err(e) => {
                    tracing::error!("Backfill for user {} failed: {:?}", user_id, e);
                    // Nobody listening is fine
                    let _ = tasks.failures.send(BackfillFailure {
                        user_id,
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    /// Enqueues every message from the lookback window, page by page.
    pub async fn run(&self, user_id: i32) -> AppResult<usize> {
        let client = self.mail_provider.get_client(user_id).await?;
        let since = Utc::now() - chrono::Duration::days(self.config.lookback_days);
        let query = format!("after:{}", since.timestamp());

        let mut seen = 0;
        let mut enqueued = 0;
        let mut page_token = None;
        loop {
            let page = client
                .list_message_ids(&query, page_token, self.config.page_size)
                .await?;

            for message_id in page.message_ids {
                if seen >= self.config.max_messages {
                    tracing::warn!(
                        "Backfill for user {} stopped at {} messages",
                        user_id,
                        self.config.max_messages
                    );
                    return Ok(enqueued);
                }
                seen += 1;
                if self.job_queue.enqueue_message(user_id, &message_id).await? {
                    enqueued += 1;
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(enqueued)
    }

    /// Waits for every scheduled backfill to finish. New ones can still be scheduled afterwards.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
