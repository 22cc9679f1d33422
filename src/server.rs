use std::sync::Arc;
use std::time::Duration;
use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, Method},
    middleware,
    response::{Json, Response},
    routing::get,
};
use chrono::SecondsFormat;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{
    config::{Config, ServerConfig},
    dispatcher::Dispatcher,
    errors::{AppError, AppResult},
    metrics::{GatewayMetrics, MetricsSnapshot},
    middleware::logging_middleware,
    upstream::{CompletionRequest, InboundRequest, UpstreamRegistry},
};

/// 应用程序状态 - 在所有请求处理器之间共享
///
/// 全部为只读或无锁共享的资源：配置、上游注册表、分发器和指标
#[derive(Clone)]
pub struct AppState {
    /// 应用程序配置（只读共享）
    pub config: Arc<Config>,
    /// 上游注册表（只读共享）
    pub registry: Arc<UpstreamRegistry>,
    /// 请求分发器，持有启动时选定的适配器
    pub dispatcher: Arc<Dispatcher>,
    /// 网关指标
    pub metrics: GatewayMetrics,
}

impl AppState {
    /// Create application state from configuration
    pub fn new(config: Config) -> AppResult<Self> {
        let http_client = build_http_client(&config.server)?;
        let registry = Arc::new(UpstreamRegistry::from_config(&config));
        let metrics = GatewayMetrics::new();
        let dispatcher = Dispatcher::from_config(&config, registry.clone(), http_client, metrics.clone())?;

        Ok(Self {
            config: Arc::new(config),
            registry,
            dispatcher: Arc::new(dispatcher),
            metrics,
        })
    }
}

/// Shared upstream HTTP client with connection pooling
///
/// No overall request timeout: streamed completions can legitimately run
/// for minutes. Only connection setup is bounded.
pub fn build_http_client(server: &ServerConfig) -> AppResult<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(server.connect_timeout_seconds))
        .pool_max_idle_per_host(server.pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(server.pool_idle_timeout_seconds))
        .build()
        .map_err(|e| AppError::ConfigError(format!("Failed to create HTTP client: {}", e)))
}

/// Create the main application router with all routes and middleware
pub fn create_app(state: AppState) -> Router {
    let body_limit = state.config.server.max_request_size_bytes;

    Router::new()
        // Health check endpoint
        .route("/health", get(health_handler))
        // Gateway counters
        .route("/metrics", get(metrics_handler))
        // Everything else is forwarded upstream
        .fallback(proxy_handler)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(logging_middleware))
                .layer(DefaultBodyLimit::max(body_limit)),
        )
}

/// Start the HTTP server
pub async fn start_server(config: Config) -> AppResult<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let upstream = config.gateway.upstream.clone();
    let default_model = config.gateway.default_model.clone();

    let app_state = AppState::new(config)?;
    let app = create_app(app_state);

    let listener = TcpListener::bind(&addr).await
        .map_err(|e| AppError::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    tracing::info!("Universal AI Proxy running on http://{}", addr);
    tracing::info!(upstream = %upstream, "Upstream service");
    tracing::info!(
        default_model = default_model.as_deref().unwrap_or("<upstream default>"),
        "Default model"
    );
    tracing::info!("Available endpoints:");
    tracing::info!("  ANY  /*       - Forward chat completion to the upstream");
    tracing::info!("  GET  /health  - Health check");
    tracing::info!("  GET  /metrics - Gateway counters");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::InternalServerError(format!("Server error: {}", e)))?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

// Request Handlers

/// Parse the inbound body into a completion request
///
/// An empty body is an empty request; anything else must be a JSON object.
pub fn parse_completion_request(body: &[u8]) -> AppResult<CompletionRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(CompletionRequest::new());
    }

    serde_json::from_slice(body)
        .map_err(|e| AppError::bad_request(format!("Request body must be a JSON object: {}", e)))
}

/// Forward any other request to the configured upstream
async fn proxy_handler(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let completion = parse_completion_request(&body)?;
    state
        .dispatcher
        .dispatch(InboundRequest::new(method, headers, completion))
        .await
}

/// Handle system health check
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "OK",
        "timestamp": chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

/// Handle metrics snapshot requests
async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
