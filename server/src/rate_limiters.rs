use std::sync::atomic::Ordering::Relaxed;
use std::sync::{atomic::AtomicBool, Arc};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use leaky_bucket::RateLimiter;

use crate::server_config::QueueConfig;

/// Caps how fast jobs leave the queue.
/// The bucket holds `jobs_per_interval` tokens and the pacer keeps a dispatch at least
/// `interval / jobs_per_interval` after both the previous dispatch and the previous finish.
#[derive(Clone)]
pub struct RateLimiters {
    dispatch: Arc<RateLimiter>,
    min_spacing: Duration,
    last_mark: Arc<Mutex<Option<Instant>>>,
    backoff: Arc<AtomicBool>,
    backoff_duration: Duration,
}

impl RateLimiters {
    pub fn new(jobs_per_interval: usize, interval: Duration, backoff_duration: Duration) -> Self {
        let jobs_per_interval = jobs_per_interval.max(1);
        let dispatch = RateLimiter::builder()
            .initial(1)
            .interval(interval)
            .max(jobs_per_interval)
            .refill(jobs_per_interval)
            .build();

        Self {
            dispatch: Arc::new(dispatch),
            min_spacing: interval / jobs_per_interval as u32,
            last_mark: Arc::new(Mutex::new(None)),
            backoff: Arc::new(AtomicBool::new(false)),
            backoff_duration,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.jobs_per_interval, config.interval(), config.backoff())
    }

    pub async fn acquire_one(&self) {
        if self.backoff.load(Relaxed) {
            tokio::time::sleep(self.backoff_duration).await;
        }

        let mut last_mark = self.last_mark.lock().await;
        if let Some(last) = *last_mark {
            tokio::time::sleep_until(last + self.min_spacing).await;
        }
        self.dispatch.acquire_one().await;
        *last_mark = Some(Instant::now());
    }

    /// Called when a dispatched job is done, so the next one is spaced from its end.
    pub async fn record_finished(&self) {
        *self.last_mark.lock().await = Some(Instant::now());
    }

    pub fn trigger_backoff(&self) {
        tracing::info!("Triggering backoff...");
        self.backoff.store(true, Relaxed);
        let self_ = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(self_.backoff_duration).await;
            tracing::info!("Backoff expired");
            self_.backoff.store(false, Relaxed);
        });
    }

    pub fn is_backing_off(&self) -> bool {
        self.backoff.load(Relaxed)
    }

    pub fn get_status(&self) -> String {
        let bucket = format!("{}/{}", self.dispatch.balance(), self.dispatch.max());
        if self.backoff.load(Relaxed) {
            format!("dispatch: {} (BACKOFF)", bucket)
        } else {
            format!("dispatch: {}", bucket)
        }
    }
}
