use std::env;

use anyhow::Context;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};

use crate::server_config::DatabaseConfig;

pub mod prelude {
    pub use entity::prelude::*;
    pub use entity::sea_orm_active_enums::JobStatus;
    pub use entity::{category, processed_email, sync_job, user, user_account_access};
    pub use sea_orm::{
        sea_query::{Expr, OnConflict},
        ActiveValue, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
        QueryFilter, QueryOrder,
    };
}

use prelude::*;

/// `DATABASE_URL` wins over the configured url, same as the sqlx tooling.
pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<DatabaseConnection> {
    let db_url = env::var("DATABASE_URL").unwrap_or_else(|_| config.url.clone());
    let mut db_options = ConnectOptions::new(db_url);
    db_options.sqlx_logging(config.sqlx_logging);

    Database::connect(db_options)
        .await
        .context("Database connection failed")
}

/// Creates every table the service owns if it does not exist yet.
/// Parents come before children so foreign keys resolve.
pub async fn ensure_schema(conn: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = conn.get_database_backend();
    let schema = Schema::new(backend);

    let statements = [
        schema.create_table_from_entity(User).if_not_exists().to_owned(),
        schema
            .create_table_from_entity(UserAccountAccess)
            .if_not_exists()
            .to_owned(),
        schema
            .create_table_from_entity(Category)
            .if_not_exists()
            .to_owned(),
        schema
            .create_table_from_entity(ProcessedEmail)
            .if_not_exists()
            .to_owned(),
        schema
            .create_table_from_entity(SyncJob)
            .if_not_exists()
            .to_owned(),
    ];

    for statement in statements.iter() {
        conn.execute(backend.build(statement)).await?;
    }

    Ok(())
}
