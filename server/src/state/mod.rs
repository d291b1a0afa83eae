pub mod backfill;
pub mod history;
pub mod sequencer;
pub mod tasks;
pub mod user_locks;
pub mod worker;
