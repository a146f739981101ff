use axum::{
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::HandoffConfig;
use crate::db;
use crate::events::EventBus;
use crate::handlers;
use crate::messaging::{HttpMessageSender, LogSender, MessageSender};
use crate::queue::TransferQueue;
use crate::scheduler::SlaScheduler;
use crate::storage::{StorageBackend, StorageError};
use crate::webhooks::WebhookDispatcher;

#[derive(Clone)]
pub struct AppState {
    pub queue: TransferQueue,
    pub event_bus: EventBus,
}

impl AppState {
    pub fn new(storage: Arc<dyn StorageBackend>, webhooks: WebhookDispatcher) -> Self {
        let event_bus = EventBus::default();
        let queue = TransferQueue::new(storage, event_bus.clone(), webhooks);
        Self { queue, event_bus }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/api/health", get(|| async { Json(serde_json::json!({"status": "ok"})) }))
        // Transfers
        .route("/api/transfers", post(handlers::transfers::create_transfer))
        .route("/api/transfers/queue", get(handlers::transfers::list_queue))
        .route("/api/transfers/pick", post(handlers::transfers::pick_next))
        .route("/api/transfers/:id", get(handlers::transfers::get_transfer))
        .route(
            "/api/transfers/:id/assign",
            post(handlers::transfers::assign_transfer),
        )
        .route(
            "/api/transfers/:id/resume",
            post(handlers::transfers::resume_transfer),
        )
        .route(
            "/api/transfers/:id/first-response",
            post(handlers::transfers::record_first_response),
        )
        // Teams
        .route(
            "/api/teams/:id/select-agent",
            post(handlers::teams::select_agent),
        )
        // Real-time
        .route("/api/events", get(handlers::events::stream_events));

    api.fallback(|| async { (StatusCode::NOT_FOUND, "Not found") })
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// The gateway sender when one is configured, otherwise log-only.
pub fn message_sender(config: &HandoffConfig) -> Arc<dyn MessageSender> {
    match config.messaging.gateway_url.as_deref() {
        Some(url) if !url.is_empty() => Arc::new(HttpMessageSender::new(
            url,
            Duration::from_secs(config.messaging.timeout_secs),
        )),
        _ => {
            warn!("no messaging gateway configured; customer messages will only be logged");
            Arc::new(LogSender)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("server I/O: {0}")]
    Io(#[from] std::io::Error),
}

pub async fn run_server(config: HandoffConfig) -> Result<(), ServeError> {
    let storage = db::init_sqlite_storage(&config.database.path)?;
    let webhooks = WebhookDispatcher::new(
        config.webhooks.urls.clone(),
        config.webhooks.secret.clone(),
        config.webhooks.max_attempts,
    );
    let state = AppState::new(storage.clone(), webhooks);

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(SlaScheduler::new(
        storage.clone(),
        message_sender(&config),
        state.event_bus.clone(),
        config.scheduler.to_scheduler_config(),
    ));
    scheduler.start(&shutdown);

    // Graceful shutdown: stop the scheduler and checkpoint WAL on SIGTERM/SIGINT
    let shutdown_storage = storage.clone();
    let shutdown_token = shutdown.clone();
    let shutdown_signal = async move {
        wait_for_signal().await;
        shutdown_token.cancel();
        match shutdown_storage.checkpoint() {
            Ok(()) => info!("WAL checkpointed, shutting down gracefully"),
            Err(e) => error!(error = %e, "WAL checkpoint failed"),
        }
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port)).await?;

    info!(port = config.server.port, db = %config.database.path, "handoff listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await?;
    scheduler.stop();
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received SIGINT");
    }
}
