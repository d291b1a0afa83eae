mod app_router;
pub mod notifications;
pub mod queue_stats;

pub use app_router::AppRouter;
