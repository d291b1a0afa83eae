use axum::{extract::State, Json};

use crate::{
    error::AppJsonResult,
    queue::{JobQueue, QueueCounts},
};

pub async fn get_queue_stats(State(job_queue): State<JobQueue>) -> AppJsonResult<QueueCounts> {
    let counts = job_queue.counts().await?;
    Ok(Json(counts))
}
