use anyhow::anyhow;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine,
};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Deserializer};

use crate::{
    error::{AppError, AppResult},
    model::user::UserCtrl,
    server_config::WebhookConfig,
    state::sequencer::{SequenceOutcome, Sequencer},
};

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    data: String,
}

/// Decoded Gmail push payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailNotification {
    pub email_address: String,
    #[serde(deserialize_with = "history_id_from_string_or_number")]
    pub history_id: i64,
}

fn history_id_from_string_or_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let history_id = match &value {
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    };

    history_id
        .filter(|id| *id >= 0)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid historyId: {value}")))
}

#[derive(Debug, Deserialize)]
pub struct NotificationParams {
    pub token: Option<String>,
}

pub fn decode_notification(body: &[u8]) -> AppResult<GmailNotification> {
    let envelope: PushEnvelope = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("Invalid push envelope: {e}")))?;

    let data = envelope.message.data.trim();
    let decoded = STANDARD
        .decode(data)
        .or_else(|_| URL_SAFE.decode(data))
        .map_err(|e| AppError::BadRequest(format!("Invalid base64 data: {e}")))?;

    serde_json::from_slice(&decoded)
        .map_err(|e| AppError::BadRequest(format!("Invalid notification payload: {e}")))
}

pub async fn handle_gmail_notification(
    State(conn): State<DatabaseConnection>,
    State(sequencer): State<Sequencer>,
    State(webhook): State<WebhookConfig>,
    Query(params): Query<NotificationParams>,
    body: Bytes,
) -> AppResult<StatusCode> {
    if let Some(expected) = &webhook.verification_token {
        if params.token.as_deref() != Some(expected.as_str()) {
            return Err(AppError::Unauthorized(
                "Invalid verification token".to_string(),
            ));
        }
    }

    let notification = decode_notification(&body)?;

    let Some(user) = UserCtrl::find_by_email(&conn, &notification.email_address).await? else {
        tracing::info!(
            "Notification for unknown address {}, ignoring",
            notification.email_address
        );
        return Ok(StatusCode::OK);
    };

    match sequencer.handle(user.id, notification.history_id).await {
        Ok(SequenceOutcome::Stale { current }) => {
            tracing::debug!(
                "Ignoring stale notification {} for user {} (at {})",
                notification.history_id,
                user.id,
                current
            );
        }
        Ok(outcome) => {
            tracing::debug!("Notification for user {}: {:?}", user.id, outcome);
        }
        Err(e) => {
            tracing::error!(
                "Failed to sequence notification {} for user {}: {:?}",
                notification.history_id,
                user.id,
                e
            );
            return Err(AppError::Internal(anyhow!("Could not process notification")));
        }
    }

    Ok(StatusCode::OK)
}
