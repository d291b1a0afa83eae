use anyhow::Context;

use crate::{
    db_core::prelude::*,
    error::{AppError, AppResult},
};

pub struct UserCtrl;

impl UserCtrl {
    pub async fn create(conn: &DatabaseConnection, email: &str) -> AppResult<user::Model> {
        let active_model = user::ActiveModel {
            id: ActiveValue::NotSet,
            email: ActiveValue::Set(email.to_string()),
            watermark: ActiveValue::Set(None),
            created_at: ActiveValue::Set(chrono::Utc::now()),
        };

        User::insert(active_model)
            .exec(conn)
            .await
            .context("Error creating user")?;

        Self::get_by_email(conn, email).await
    }

    pub async fn find_by_email(
        conn: &DatabaseConnection,
        email: &str,
    ) -> AppResult<Option<user::Model>> {
        let user = User::find()
            .filter(user::Column::Email.eq(email))
            .one(conn)
            .await
            .context("Error fetching user by email")?;

        Ok(user)
    }

    pub async fn get_by_email(conn: &DatabaseConnection, email: &str) -> AppResult<user::Model> {
        Self::find_by_email(conn, email)
            .await?
            .ok_or(AppError::NotFound("User not found".to_string()))
    }

    pub async fn get_by_id(conn: &DatabaseConnection, user_id: i32) -> AppResult<user::Model> {
        let user = User::find_by_id(user_id)
            .one(conn)
            .await
            .context("Error fetching user by id")?
            .ok_or(AppError::NotFound("User not found".to_string()))?;

        Ok(user)
    }

    /// Sets the watermark only if it has never been set.
    /// Returns false when another writer got there first.
    pub async fn initialize_watermark(
        conn: &DatabaseConnection,
        user_id: i32,
        history_id: i64,
    ) -> AppResult<bool> {
        let result = User::update_many()
            .col_expr(user::Column::Watermark, Expr::value(history_id))
            .filter(user::Column::Id.eq(user_id))
            .filter(user::Column::Watermark.is_null())
            .exec(conn)
            .await
            .context("Error initializing watermark")?;

        Ok(result.rows_affected == 1)
    }

    /// Compare-and-set: moves the watermark from `expected` to `history_id` in one statement.
    /// Fails if the stored value is no longer `expected` or if `history_id` is not strictly greater.
    pub async fn advance_watermark(
        conn: &DatabaseConnection,
        user_id: i32,
        expected: i64,
        history_id: i64,
    ) -> AppResult<bool> {
        if history_id <= expected {
            return Ok(false);
        }

        let result = User::update_many()
            .col_expr(user::Column::Watermark, Expr::value(history_id))
            .filter(user::Column::Id.eq(user_id))
            .filter(user::Column::Watermark.eq(expected))
            .filter(user::Column::Watermark.lt(history_id))
            .exec(conn)
            .await
            .context("Error advancing watermark")?;

        Ok(result.rows_affected == 1)
    }
}
