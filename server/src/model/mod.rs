pub mod category;
pub mod processed_email;
pub mod sync_job;
pub mod user;
pub mod user_account_access;
