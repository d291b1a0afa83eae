use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::{
    crypt::TokenCipher,
    db_core::prelude::*,
    error::{AppError, AppResult},
};

/// Credentials of one mailbox with both tokens decrypted
#[derive(Debug, Clone)]
pub struct AccountAccess {
    pub id: i32,
    pub user_id: i32,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct UserAccessCtrl;

impl UserAccessCtrl {
    pub async fn get_for_user(
        conn: &DatabaseConnection,
        cipher: &TokenCipher,
        user_id: i32,
    ) -> AppResult<AccountAccess> {
        let stored = UserAccountAccess::find()
            .filter(user_account_access::Column::UserId.eq(user_id))
            .one(conn)
            .await
            .context("Error fetching account access")?
            .ok_or(AppError::Unauthorized(format!(
                "No mail credentials stored for user {user_id}"
            )))?;

        Ok(AccountAccess {
            id: stored.id,
            user_id: stored.user_id,
            access_token: cipher.decrypt(&stored.access_token)?,
            refresh_token: cipher.decrypt(&stored.refresh_token)?,
            expires_at: stored.expires_at,
        })
    }

    /// Stores the credentials handed over by the sign-in flow, replacing any previous ones.
    pub async fn store(
        conn: &DatabaseConnection,
        cipher: &TokenCipher,
        user_id: i32,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let active_model = user_account_access::ActiveModel {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(user_id),
            access_token: ActiveValue::Set(cipher.encrypt(access_token)?),
            refresh_token: ActiveValue::Set(cipher.encrypt(refresh_token)?),
            expires_at: ActiveValue::Set(expires_at),
        };

        UserAccountAccess::insert(active_model)
            .on_conflict(
                OnConflict::column(user_account_access::Column::UserId)
                    .update_columns([
                        user_account_access::Column::AccessToken,
                        user_account_access::Column::RefreshToken,
                        user_account_access::Column::ExpiresAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await
            .context("Error storing account access")?;

        Ok(())
    }

    pub async fn refresh_account_access(
        conn: &DatabaseConnection,
        cipher: &TokenCipher,
        access_id: i32,
        refreshed_access_token: &str,
        expires_in: i64,
    ) -> AppResult<()> {
        UserAccountAccess::update(user_account_access::ActiveModel {
            id: ActiveValue::Set(access_id),
            access_token: ActiveValue::Set(cipher.encrypt(refreshed_access_token)?),
            expires_at: ActiveValue::Set(Utc::now() + chrono::Duration::seconds(expires_in)),
            ..Default::default()
        })
        .exec(conn)
        .await
        .context("Error updating account access")?;

        Ok(())
    }
}
