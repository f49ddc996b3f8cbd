pub mod handlers;
pub mod models;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use std::sync::Arc;

use crate::core::{scheduler, Context};
use crate::error::NexusError;

/// All `/v1` routes. Separated from `run` so tests can drive the router
/// directly.
pub fn router(ctx: Arc<Context>) -> Router {
    Router::new()
        .route("/v1/server/status", get(handlers::get_server_status))
        .route("/v1/server/logs", get(handlers::get_server_logs))
        .route("/v1/server/stop", post(handlers::stop_server))
        .route(
            "/v1/jobs",
            get(handlers::list_jobs).post(handlers::create_job),
        )
        // Static segments take precedence over the {id} captures below.
        .route("/v1/jobs/running", axum::routing::delete(handlers::kill_jobs_bulk))
        .route("/v1/jobs/queued", axum::routing::delete(handlers::remove_jobs_bulk))
        .route(
            "/v1/jobs/{id}",
            get(handlers::get_job)
                .patch(handlers::update_job)
                .delete(handlers::delete_job),
        )
        .route("/v1/jobs/{id}/logs", get(handlers::get_job_logs))
        .route("/v1/jobs/{id}/kill", post(handlers::kill_job))
        .route("/v1/queue", get(handlers::get_queue))
        .route("/v1/gpus", get(handlers::list_gpus))
        .route(
            "/v1/gpus/{idx}/blacklist",
            put(handlers::blacklist_gpu).delete(handlers::remove_gpu_blacklist),
        )
        .route("/v1/artifacts", post(handlers::upload_artifact))
        .route("/v1/health", get(handlers::health_check))
        .layer(middleware::from_fn_with_state(ctx.clone(), require_bearer))
        .with_state(ctx)
}

/// Shared-credential check on every route except the health probe. An empty
/// configured key disables authentication.
async fn require_bearer(
    State(ctx): State<Arc<Context>>,
    request: Request,
    next: Next,
) -> Response {
    if ctx.config.api_key.is_empty() || request.uri().path() == "/v1/health" {
        return next.run(request).await;
    }

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == ctx.config.api_key);

    if authorized {
        next.run(request).await
    } else {
        NexusError::Auth("missing or invalid bearer token".to_string()).into_response()
    }
}

/// Daemon entry: spawn the scheduler next to the HTTP server and serve
/// until a shutdown signal arrives.
pub async fn run(ctx: Arc<Context>) -> anyhow::Result<()> {
    tokio::spawn(scheduler::run(Arc::clone(&ctx)));

    let app = router(Arc::clone(&ctx));

    let host = &ctx.config.host;
    let port = ctx.config.port;
    // Handle IPv6 literal addresses (e.g., "::1" -> "[::1]")
    let bind_addr = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };

    let addr = tokio::net::lookup_host(&bind_addr)
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve address: {}", bind_addr))?;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    // SO_REUSEPORT so a replacement daemon can bind while the old one drains.
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let std_listener: std::net::TcpListener = socket.into();
    std_listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(std_listener)?;

    tracing::info!("Listening on: {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
}
