use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};

use crate::{request_tracing, ServerState};

use super::{notifications, queue_stats};

pub struct AppRouter;

impl AppRouter {
    pub fn create(state: ServerState) -> Router {
        let router = Router::new()
            .route("/", get(|| async { "Email sorter" }))
            .route("/ping", get(|| async { "pong" }))
            .route(
                "/gmail/notifications",
                post(notifications::handle_gmail_notification),
            )
            .route("/queue/stats", get(queue_stats::get_queue_stats))
            .with_state(state)
            .fallback(handler_404);

        request_tracing::with_request_tracing(router)
    }
}

pub async fn handler_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Route does not exist")
}
