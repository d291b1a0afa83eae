use anyhow::Context;
use chrono::Utc;

use crate::{
    db_core::prelude::*, email::message::MessageFields, error::AppResult,
    prompt::classify::ClassificationResult,
};

pub struct ProcessedEmailCtrl;

impl ProcessedEmailCtrl {
    /// Writes the classification of one message.
    /// A second write for the same `(user_id, message_id)` overwrites the first.
    pub async fn upsert(
        conn: &DatabaseConnection,
        user_id: i32,
        message_id: &str,
        fields: &MessageFields,
        result: &ClassificationResult,
    ) -> AppResult<()> {
        let active_model = processed_email::ActiveModel {
            user_id: ActiveValue::Set(user_id),
            message_id: ActiveValue::Set(message_id.to_string()),
            subject: ActiveValue::Set(fields.subject.clone()),
            sender: ActiveValue::Set(fields.sender.clone()),
            snippet: ActiveValue::Set(fields.snippet.clone()),
            category: ActiveValue::Set(result.category.clone()),
            confidence: ActiveValue::Set(result.confidence),
            reasoning: ActiveValue::Set(result.reasoning.clone()),
            created_at: ActiveValue::Set(Utc::now()),
        };

        ProcessedEmail::insert(active_model)
            .on_conflict(
                OnConflict::columns([
                    processed_email::Column::UserId,
                    processed_email::Column::MessageId,
                ])
                .update_columns([
                    processed_email::Column::Subject,
                    processed_email::Column::Sender,
                    processed_email::Column::Snippet,
                    processed_email::Column::Category,
                    processed_email::Column::Confidence,
                    processed_email::Column::Reasoning,
                ])
                .to_owned(),
            )
            .exec_without_returning(conn)
            .await
            .context("Error saving processed email")?;

        Ok(())
    }

    pub async fn get(
        conn: &DatabaseConnection,
        user_id: i32,
        message_id: &str,
    ) -> AppResult<Option<processed_email::Model>> {
        let processed = ProcessedEmail::find_by_id((user_id, message_id.to_string()))
            .one(conn)
            .await
            .context("Error fetching processed email")?;

        Ok(processed)
    }

    pub async fn count_for_user(conn: &DatabaseConnection, user_id: i32) -> AppResult<u64> {
        let count = ProcessedEmail::find()
            .filter(processed_email::Column::UserId.eq(user_id))
            .count(conn)
            .await
            .context("Error counting processed emails")?;

        Ok(count)
    }
}
