extern crate google_gmail1 as gmail1;

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use gmail1::api::{ListHistoryResponse, ListMessagesResponse, Message};
use serde::Deserialize;

use crate::{
    crypt::TokenCipher,
    db_core::prelude::*,
    error::{AppError, AppResult},
    model::user_account_access::UserAccessCtrl,
    server_config::GmailConfig,
    HttpClient,
};

/// One page of message ids added since a history cursor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryPage {
    pub message_ids: Vec<String>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageIdPage {
    pub message_ids: Vec<String>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedMessage {
    pub id: String,
    pub headers: Vec<(String, String)>,
    pub snippet: Option<String>,
}

/// An authenticated mailbox of a single user
#[async_trait]
pub trait MailClient: Send + Sync {
    /// Message ids added after `start_history_id`, one page at a time.
    async fn list_history(
        &self,
        start_history_id: i64,
        page_token: Option<String>,
    ) -> AppResult<HistoryPage>;

    async fn list_message_ids(
        &self,
        query: &str,
        page_token: Option<String>,
        max_results: u32,
    ) -> AppResult<MessageIdPage>;

    /// Fetches the `Subject` and `From` headers and the snippet of a message.
    async fn get_message(&self, message_id: &str) -> AppResult<FetchedMessage>;
}

#[async_trait]
pub trait MailClientProvider: Send + Sync {
    async fn get_client(&self, user_id: i32) -> AppResult<Arc<dyn MailClient>>;
}

macro_rules! gmail_url {
    ($base:expr, $($params:expr),*) => {
        {
            let list_params: Vec<&str> = vec![$($params),*];
            let path = list_params.join("/");
            format!("{}/{}", $base, path)
        }
    };
}

#[derive(Debug, Clone)]
pub struct GmailClient {
    http_client: HttpClient,
    access_token: String,
    api_base: String,
}

impl GmailClient {
    pub fn new(http_client: HttpClient, access_token: String, api_base: String) -> Self {
        Self {
            http_client,
            access_token,
            api_base,
        }
    }
}

#[async_trait]
impl MailClient for GmailClient {
    async fn list_history(
        &self,
        start_history_id: i64,
        page_token: Option<String>,
    ) -> AppResult<HistoryPage> {
        let mut query = vec![
            ("startHistoryId".to_string(), start_history_id.to_string()),
            ("historyTypes".to_string(), "messageAdded".to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken".to_string(), token));
        }

        let resp = self
            .http_client
            .get(gmail_url!(self.api_base, "history"))
            .query(&query)
            .bearer_auth(&self.access_token)
            .send()
            .await?
            .error_for_status()?;

        let data = resp
            .json::<ListHistoryResponse>()
            .await
            .context("Error parsing history list")?;

        let message_ids = data
            .history
            .unwrap_or_default()
            .into_iter()
            .flat_map(|history| history.messages_added.unwrap_or_default())
            .filter_map(|added| added.message.and_then(|message| message.id))
            .collect();

        Ok(HistoryPage {
            message_ids,
            next_page_token: data.next_page_token,
        })
    }

    async fn list_message_ids(
        &self,
        query: &str,
        page_token: Option<String>,
        max_results: u32,
    ) -> AppResult<MessageIdPage> {
        let mut params = vec![
            ("q".to_string(), query.to_string()),
            ("maxResults".to_string(), max_results.to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken".to_string(), token));
        }

        let resp = self
            .http_client
            .get(gmail_url!(self.api_base, "messages"))
            .query(&params)
            .bearer_auth(&self.access_token)
            .send()
            .await?
            .error_for_status()?;

        let data = resp
            .json::<ListMessagesResponse>()
            .await
            .context("Error parsing message list")?;

        Ok(MessageIdPage {
            message_ids: data
                .messages
                .unwrap_or_default()
                .into_iter()
                .filter_map(|message| message.id)
                .collect(),
            next_page_token: data.next_page_token,
        })
    }

    async fn get_message(&self, message_id: &str) -> AppResult<FetchedMessage> {
        let resp = self
            .http_client
            .get(gmail_url!(self.api_base, "messages", message_id))
            .query(&[
                ("format", "metadata"),
                ("metadataHeaders", "Subject"),
                ("metadataHeaders", "From"),
            ])
            .bearer_auth(&self.access_token)
            .send()
            .await?
            .error_for_status()?;

        let message = resp
            .json::<Message>()
            .await
            .context("Error getting message")?;

        Ok(fetched_from_gmail(message_id, message))
    }
}

fn fetched_from_gmail(message_id: &str, message: Message) -> FetchedMessage {
    let headers = message
        .payload
        .and_then(|payload| payload.headers)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|header| Some((header.name?, header.value.unwrap_or_default())))
        .collect();

    FetchedMessage {
        id: message.id.unwrap_or_else(|| message_id.to_string()),
        headers,
        snippet: message.snippet,
    }
}

#[derive(Debug, Deserialize)]
pub struct RefreshTokenResponse {
    pub access_token: String,
    pub expires_in: i64,
}

/// Builds Gmail clients from stored credentials, refreshing the access token when it is about to expire.
#[derive(Clone)]
pub struct GmailClientProvider {
    http_client: HttpClient,
    conn: DatabaseConnection,
    config: GmailConfig,
    cipher: TokenCipher,
}

impl GmailClientProvider {
    pub fn new(
        http_client: HttpClient,
        conn: DatabaseConnection,
        config: GmailConfig,
        cipher: TokenCipher,
    ) -> Self {
        Self {
            http_client,
            conn,
            config,
            cipher,
        }
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> AppResult<RefreshTokenResponse> {
        let resp = self
            .http_client
            .post(&self.config.token_uri)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?
            .json::<serde_json::Value>()
            .await?;

        if resp.get("error").is_some() {
            let description = resp
                .get("error_description")
                .and_then(|d| d.as_str())
                .unwrap_or("unknown error");
            tracing::error!("Error refreshing token: {}", description);
            return Err(anyhow!("Token refresh failed: {}", description).into());
        }

        serde_json::from_value::<RefreshTokenResponse>(resp)
            .context("Unexpected token refresh response")
            .map_err(AppError::from)
    }
}

#[async_trait]
impl MailClientProvider for GmailClientProvider {
    async fn get_client(&self, user_id: i32) -> AppResult<Arc<dyn MailClient>> {
        let access = UserAccessCtrl::get_for_user(&self.conn, &self.cipher, user_id).await?;

        let access_token = if access.expires_at <= Utc::now() + chrono::Duration::seconds(60) {
            tracing::debug!("Refreshing access token for user {}", user_id);
            let resp = self.exchange_refresh_token(&access.refresh_token).await?;
            UserAccessCtrl::refresh_account_access(
                &self.conn,
                &self.cipher,
                access.id,
                &resp.access_token,
                resp.expires_in,
            )
            .await?;
            resp.access_token
        } else {
            access.access_token
        };

        Ok(Arc::new(GmailClient::new(
            self.http_client.clone(),
            access_token,
            self.config.api_base.clone(),
        )))
    }
}
