mod api;
mod auth;
mod config;
mod cors;
mod db;
mod error;
mod messages;
mod metrics;
mod notifications;
mod registry;
mod typing;
mod validation;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::jwt::SessionTokenVerifier;
use crate::config::RealtimeConfig;
use crate::error::{with_request_id_scope, REQUEST_ID_HEADER};
use crate::messages::MessageStore;
use crate::metrics::RealtimeMetrics;
use crate::notifications::{NotificationEngine, NotificationStore, TargetStore};
use crate::registry::ConnectionRegistry;
use crate::typing::TypingTracker;
use crate::ws::RealtimeState;

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RealtimeConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .init();

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set AGORA_REALTIME_JWT_SECRET in production");
    }

    let app_metrics = Arc::new(RealtimeMetrics::default());
    metrics::set_global_metrics(app_metrics.clone());

    let state = build_state(&config).await?;
    let app = build_router(state, app_metrics);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        ws_url = format!("{}/v1/ws", config.ws_base_url),
        "starting realtime server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("realtime server exited unexpectedly")
}

/// Wires the shared stores: Postgres when a database URL is configured,
/// in-process memory otherwise (local development and tests).
async fn build_state(config: &RealtimeConfig) -> anyhow::Result<RealtimeState> {
    let verifier = Arc::new(
        SessionTokenVerifier::new(&config.jwt_secret).context("invalid realtime JWT secret")?,
    );
    let registry = Arc::new(ConnectionRegistry::new());
    let typing = TypingTracker::new(registry.clone());

    let (messages, targets, notifications) = match &config.database_url {
        Some(database_url) => {
            let pool = db::pool::create_pg_pool(database_url, db::pool::PoolConfig::from_env())
                .await
                .context("failed to connect to postgres")?;
            db::pool::check_pool_health(&pool).await.context("postgres health check failed")?;
            db::migrations::run_migrations(&pool).await.context("failed to run migrations")?;
            info!("using postgres-backed stores");
            (
                MessageStore::Postgres(pool.clone()),
                TargetStore::Postgres(pool.clone()),
                NotificationStore::Postgres(pool),
            )
        }
        None => {
            warn!("no AGORA_REALTIME_DATABASE_URL set; using in-memory stores");
            (MessageStore::memory(), TargetStore::memory(), NotificationStore::memory())
        }
    };

    let engine = Arc::new(NotificationEngine::new(targets, notifications, registry.clone()));

    Ok(RealtimeState { verifier, registry, typing, messages, notifications: engine })
}

fn build_router(state: RealtimeState, app_metrics: Arc<RealtimeMetrics>) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route(
                "/metrics",
                get(move || {
                    let app_metrics = app_metrics.clone();
                    async move { app_metrics.render_prometheus() }
                }),
            )
            .merge(ws::router(state.clone()))
            .merge(api::router(state)),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(cors::cors_layer())
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Assigns a request id, scopes it for error responses, logs the
/// request and feeds the HTTP metrics.
async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics::record_http_request(method.as_str(), &path, response.status().as_u16(), latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms,
        "request completed"
    );

    response
}
