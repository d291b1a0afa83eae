use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{db_core::prelude::*, error::AppResult};

/// A category as offered to the classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCategory {
    pub name: String,
    pub description: Option<String>,
}

impl From<category::Model> for UserCategory {
    fn from(model: category::Model) -> Self {
        Self {
            name: model.name,
            description: model.description,
        }
    }
}

pub struct CategoryCtrl;

impl CategoryCtrl {
    pub async fn list_for_user(
        conn: &DatabaseConnection,
        user_id: i32,
    ) -> AppResult<Vec<UserCategory>> {
        let categories = Category::find()
            .filter(category::Column::UserId.eq(user_id))
            .order_by_asc(category::Column::Id)
            .all(conn)
            .await
            .context("Error fetching user categories")?;

        Ok(categories.into_iter().map(UserCategory::from).collect())
    }

    pub async fn create(
        conn: &DatabaseConnection,
        user_id: i32,
        name: &str,
        description: Option<&str>,
    ) -> AppResult<()> {
        Category::insert(category::ActiveModel {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(user_id),
            name: ActiveValue::Set(name.to_string()),
            description: ActiveValue::Set(description.map(str::to_string)),
        })
        .exec(conn)
        .await
        .context("Error creating category")?;

        Ok(())
    }
}
