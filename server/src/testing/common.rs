use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};

use crate::{
    db_core,
    email::client::{FetchedMessage, HistoryPage, MailClient, MailClientProvider, MessageIdPage},
    error::{AppError, AppResult},
    model::{category::CategoryCtrl, user::UserCtrl},
    prompt::chat::TextModel,
    server_config::{BackfillConfig, QueueConfig},
};

pub async fn setup_db() -> DatabaseConnection {
    let mut db_options = ConnectOptions::new("sqlite::memory:");
    db_options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);

    let conn = Database::connect(db_options)
        .await
        .expect("Could not open in-memory database");
    db_core::ensure_schema(&conn)
        .await
        .expect("Could not create schema");

    conn
}

pub fn test_queue_config() -> QueueConfig {
    QueueConfig {
        jobs_per_interval: 100,
        interval_ms: 10,
        max_attempts: 3,
        retry_base_delay_ms: 0,
        idle_poll_ms: 5,
        stale_after_secs: 300,
        backoff_secs: 1,
    }
}

pub fn test_backfill_config() -> BackfillConfig {
    BackfillConfig {
        lookback_days: 30,
        page_size: 2,
        max_messages: 100,
    }
}

pub async fn create_user_with_categories(
    conn: &DatabaseConnection,
    email: &str,
    categories: &[(&str, Option<&str>)],
) -> i32 {
    let user = UserCtrl::create(conn, email).await.unwrap();
    for (name, description) in categories {
        CategoryCtrl::create(conn, user.id, name, *description)
            .await
            .unwrap();
    }

    user.id
}

#[derive(Default)]
struct MailboxState {
    /// `(history_id, message_id)` in the order the provider recorded them
    history: Vec<(i64, String)>,
    messages: HashMap<String, FetchedMessage>,
    search_results: Vec<String>,
}

/// In-memory mailbox. Pages are two entries long so pagination is always exercised.
#[derive(Clone, Default)]
pub struct FakeMailbox {
    state: Arc<Mutex<MailboxState>>,
    fail_history: Arc<AtomicBool>,
    fail_messages: Arc<AtomicBool>,
    fail_search: Arc<AtomicBool>,
    history_calls: Arc<AtomicUsize>,
    message_calls: Arc<AtomicUsize>,
    search_calls: Arc<AtomicUsize>,
    history_delay: Arc<Mutex<Option<Duration>>>,
}

const FAKE_PAGE_SIZE: usize = 2;

impl FakeMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new message at `history_id` and makes it fetchable.
    pub fn add_message(&self, history_id: i64, message_id: &str, subject: &str, from: &str) {
        let mut state = self.state.lock().unwrap();
        state.history.push((history_id, message_id.to_string()));
        state.messages.insert(
            message_id.to_string(),
            FetchedMessage {
                id: message_id.to_string(),
                headers: vec![
                    ("Subject".to_string(), subject.to_string()),
                    ("From".to_string(), from.to_string()),
                ],
                snippet: Some(format!("snippet of {message_id}")),
            },
        );
    }

    pub fn set_search_results(&self, message_ids: &[&str]) {
        let mut state = self.state.lock().unwrap();
        for id in message_ids {
            state.messages.entry(id.to_string()).or_insert(FetchedMessage {
                id: id.to_string(),
                headers: vec![("Subject".to_string(), format!("old {id}"))],
                snippet: None,
            });
        }
        state.search_results = message_ids.iter().map(|id| id.to_string()).collect();
    }

    pub fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    pub fn fail_messages(&self, fail: bool) {
        self.fail_messages.store(fail, Ordering::SeqCst);
    }

    pub fn fail_search(&self, fail: bool) {
        self.fail_search.store(fail, Ordering::SeqCst);
    }

    pub fn delay_history(&self, delay: Duration) {
        *self.history_delay.lock().unwrap() = Some(delay);
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn message_calls(&self) -> usize {
        self.message_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }
}

fn page<T: Clone>(items: &[T], page_token: Option<String>, size: usize) -> (Vec<T>, Option<String>) {
    let start = page_token.and_then(|t| t.parse::<usize>().ok()).unwrap_or(0);
    let end = (start + size).min(items.len());
    let next = (end < items.len()).then(|| end.to_string());
    (items.get(start..end).unwrap_or_default().to_vec(), next)
}

#[async_trait]
impl MailClient for FakeMailbox {
    async fn list_history(
        &self,
        start_history_id: i64,
        page_token: Option<String>,
    ) -> AppResult<HistoryPage> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.history_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(anyhow!("history cursor expired").into());
        }

        let added: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .history
                .iter()
                .filter(|(history_id, _)| *history_id > start_history_id)
                .map(|(_, message_id)| message_id.clone())
                .collect()
        };
        let (message_ids, next_page_token) = page(&added, page_token, FAKE_PAGE_SIZE);

        Ok(HistoryPage {
            message_ids,
            next_page_token,
        })
    }

    async fn list_message_ids(
        &self,
        _query: &str,
        page_token: Option<String>,
        max_results: u32,
    ) -> AppResult<MessageIdPage> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(anyhow!("search unavailable").into());
        }

        let results = self.state.lock().unwrap().search_results.clone();
        let (message_ids, next_page_token) = page(&results, page_token, max_results as usize);

        Ok(MessageIdPage {
            message_ids,
            next_page_token,
        })
    }

    async fn get_message(&self, message_id: &str) -> AppResult<FetchedMessage> {
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(AppError::TooManyRequests);
        }

        self.state
            .lock()
            .unwrap()
            .messages
            .get(message_id)
            .cloned()
            .ok_or(AppError::NotFound(format!("message {message_id}")))
    }
}

/// Hands out one `FakeMailbox` per user
#[derive(Clone, Default)]
pub struct FakeMailProvider {
    mailboxes: Arc<Mutex<HashMap<i32, FakeMailbox>>>,
    fail_credentials: Arc<AtomicBool>,
}

impl FakeMailProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mailbox(&self, user_id: i32) -> FakeMailbox {
        self.mailboxes
            .lock()
            .unwrap()
            .entry(user_id)
            .or_default()
            .clone()
    }

    pub fn fail_credentials(&self, fail: bool) {
        self.fail_credentials.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailClientProvider for FakeMailProvider {
    async fn get_client(&self, user_id: i32) -> AppResult<Arc<dyn MailClient>> {
        if self.fail_credentials.load(Ordering::SeqCst) {
            return Err(anyhow!("token refresh failed").into());
        }

        Ok(Arc::new(self.mailbox(user_id)))
    }
}

/// A text model that answers every prompt the same way and remembers what it was asked
#[derive(Clone)]
pub struct ScriptedModel {
    reply: Result<String, String>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedModel {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
            prompts: Arc::default(),
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            reply: Err(error.to_string()),
            prompts: Arc::default(),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextModel for ScriptedModel {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.reply.clone().map_err(|e| anyhow!(e))
    }
}
