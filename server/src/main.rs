#![allow(dead_code)]
mod crypt;
mod db_core;
mod email;
mod error;
mod model;
mod prompt;
mod queue;
mod rate_limiters;
mod request_tracing;
mod routes;
mod server_config;
mod state;
mod testing;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{extract::FromRef, Router};
use mimalloc::MiMalloc;
use sea_orm::DatabaseConnection;
use tokio::signal;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use email::client::{GmailClientProvider, MailClientProvider};
use prompt::{ChatCompletionModel, ClassificationEngine};
use queue::JobQueue;
use rate_limiters::RateLimiters;
use routes::AppRouter;
use server_config::{cfg, WebhookConfig};
use state::{
    backfill::BackfillTasks, sequencer::Sequencer, tasks, user_locks::UserLocks, worker::Worker,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub type HttpClient = reqwest::Client;

#[derive(Clone, FromRef)]
pub struct ServerState {
    pub conn: DatabaseConnection,
    pub job_queue: JobQueue,
    pub sequencer: Sequencer,
    pub webhook: WebhookConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(false))
        .init();

    tracing::info!("{}", *cfg);

    anyhow::ensure!(
        !cfg.crypto.token_key.is_empty(),
        "crypto.token_key must be set (SORTER__CRYPTO__TOKEN_KEY)"
    );

    let conn = db_core::connect(&cfg.database).await?;
    db_core::ensure_schema(&conn).await?;

    let http_client = reqwest::ClientBuilder::new().use_rustls_tls().build()?;

    let rate_limiters = RateLimiters::from_config(&cfg.queue);
    let job_queue = JobQueue::new(conn.clone(), rate_limiters, cfg.queue.clone());
    let mail_provider: Arc<dyn MailClientProvider> = Arc::new(GmailClientProvider::new(
        http_client.clone(),
        conn.clone(),
        cfg.gmail.clone(),
        crypt::TokenCipher::new(cfg.crypto.token_key.clone()),
    ));
    let engine = ClassificationEngine::new(Arc::new(ChatCompletionModel::new(
        http_client.clone(),
        cfg.model.clone(),
    )));

    let backfill = BackfillTasks::new(
        job_queue.clone(),
        mail_provider.clone(),
        cfg.backfill.clone(),
    );
    let sequencer = Sequencer::new(
        conn.clone(),
        job_queue.clone(),
        mail_provider.clone(),
        backfill.clone(),
        UserLocks::new(),
    );
    let worker = Worker::new(conn.clone(), job_queue.clone(), mail_provider, engine);

    let state = ServerState {
        conn,
        job_queue: job_queue.clone(),
        sequencer,
        webhook: cfg.webhook.clone(),
    };

    // Anything left active by a previous run goes back to the queue first
    tasks::recover_stale_jobs(job_queue.clone()).await;

    let mut scheduler = JobScheduler::new().await?;
    {
        let queue = job_queue.clone();
        scheduler
            .add(Job::new_repeated_async(
                cfg.queue.stale_after().max(Duration::from_secs(60)),
                move |_uuid, _l| {
                    let queue = queue.clone();
                    Box::pin(async move { tasks::recover_stale_jobs(queue).await })
                },
            )?)
            .await?;
    }
    scheduler.set_shutdown_handler(Box::new(move || {
        Box::pin(async move {
            tracing::info!("Shutting down scheduler");
        })
    }));
    scheduler.start().await?;

    let worker_handle = tasks::run_worker_loop(worker.clone(), cfg.queue.idle_poll());
    let watch_handle = tasks::watch(
        job_queue,
        worker,
        Duration::from_secs(cfg.status.log_interval_secs),
    );

    let router = AppRouter::create(state);
    run_server(router).await?;

    worker_handle.abort();
    watch_handle.abort();
    scheduler.shutdown().await?;
    tracing::info!("Waiting for running backfills...");
    backfill.wait_idle().await;
    tracing::info!("Cleanups done, shutting down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {:?}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run_server(router: Router) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
    tracing::info!("Email sorter running on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}
