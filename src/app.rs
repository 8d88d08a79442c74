use crate::config::Config;
use crate::pages::{
    AboutTemplate, IndexTemplate, MaintenanceTemplate, NotFoundTemplate, ServerErrorTemplate,
};
use crate::publish::{PublishApi, RobloxPublisher};
use crate::quota::QuotaTracker;
use crate::settings::SettingsStore;
use crate::upload;
use anyhow::{anyhow, Result};
use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::{any::Any, net::SocketAddr, sync::Arc, time::Duration};
use tower_http::{catch_panic::CatchPanicLayer, limit::RequestBodyLimitLayer};
use tracing::{debug, error, info, warn};

/// Routes that stay reachable while maintenance mode is on.
const MAINTENANCE_EXEMPT: [&str; 2] = ["/btr", "/nbtr"];

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<SettingsStore>,
    pub quotas: Arc<QuotaTracker>,
    pub publisher: Arc<dyn PublishApi>,
    pub trust_proxy_headers: bool,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        settings: Arc<SettingsStore>,
        publisher: Arc<dyn PublishApi>,
        config: &Config,
    ) -> Self {
        Self {
            quotas: Arc::new(QuotaTracker::new(settings.clone())),
            settings,
            publisher,
            trust_proxy_headers: config.trust_proxy_headers,
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

pub async fn run_server(config: Config) -> Result<()> {
    let settings = Arc::new(SettingsStore::load(&config.settings_path));
    let limits = settings.limits().await;
    info!(
        "Limits: {} tokens per day, {}s between uploads",
        limits.daily_tokens, limits.window_secs
    );
    if settings.maintenance_notice().await.is_some() {
        warn!("Starting with maintenance mode enabled");
    }

    let publisher: Arc<dyn PublishApi> = Arc::new(RobloxPublisher::new(
        &config.publish_api_base,
        config.publish_timeout,
    )?);
    info!("Publishing through {}", config.publish_api_base);

    let state = AppState::new(settings, publisher, &config);
    if let Some(every) = config.quota_sweep_interval {
        spawn_quota_sweep(state.quotas.clone(), every);
    }

    let app = build_router(state);

    info!("Listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let max_upload_bytes = state.max_upload_bytes;
    Router::new()
        .route("/", get(index))
        .route("/about", get(about))
        .route("/check_status", get(check_status))
        .route("/upload_game", post(upload::upload_game))
        .route("/btr", get(enable_maintenance))
        .route("/nbtr", get(disable_maintenance))
        .route("/test-500", get(test_500))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            maintenance_gate,
        ))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn maintenance_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if MAINTENANCE_EXEMPT.contains(&request.uri().path()) {
        return next.run(request).await;
    }
    match state.settings.maintenance_notice().await {
        Some(message) => {
            debug!("Maintenance notice served for {}", request.uri().path());
            (
                StatusCode::SERVICE_UNAVAILABLE,
                MaintenanceTemplate { message },
            )
                .into_response()
        }
        None => next.run(request).await,
    }
}

async fn index(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> IndexTemplate {
    let ip = client_address(&headers, connect.as_ref(), state.trust_proxy_headers);
    let status = state.quotas.status(&ip, Utc::now()).await;
    IndexTemplate { status }
}

async fn about(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> AboutTemplate {
    let ip = client_address(&headers, connect.as_ref(), state.trust_proxy_headers);
    let status = state.quotas.status(&ip, Utc::now()).await;
    let limits = state.settings.limits().await;
    AboutTemplate { status, limits }
}

async fn check_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Json<crate::quota::QuotaStatus> {
    let ip = client_address(&headers, connect.as_ref(), state.trust_proxy_headers);
    Json(state.quotas.status(&ip, Utc::now()).await)
}

#[derive(Deserialize)]
struct MaintenanceQuery {
    message: Option<String>,
}

async fn enable_maintenance(
    State(state): State<AppState>,
    Query(query): Query<MaintenanceQuery>,
) -> Redirect {
    state
        .settings
        .set_maintenance_mode(true, query.message)
        .await;
    Redirect::to("/")
}

async fn disable_maintenance(State(state): State<AppState>) -> Redirect {
    state.settings.set_maintenance_mode(false, None).await;
    Redirect::to("/")
}

async fn test_500() -> Result<Response, InternalError> {
    Err(anyhow!("diagnostic failure requested via /test-500").into())
}

async fn not_found(request: Request) -> (StatusCode, NotFoundTemplate) {
    info!("404 error occurred: {}", request.uri().path());
    (StatusCode::NOT_FOUND, NotFoundTemplate)
}

/// Any handler failure that is not a client-facing upload outcome.
pub struct InternalError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for InternalError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for InternalError {
    fn into_response(self) -> Response {
        error!("500 error occurred: {:#}", self.0);
        server_error_response()
    }
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Handler panicked: {}", detail);
    server_error_response()
}

fn server_error_response() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, ServerErrorTemplate).into_response()
}

fn spawn_quota_sweep(quotas: Arc<QuotaTracker>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let dropped = quotas.sweep_stale(Utc::now()).await;
            if dropped > 0 {
                debug!("Dropped {} stale quota records", dropped);
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}

/// Quota key for a request. Proxy headers are only honoured when the
/// deployment sits behind a proxy that sets them.
pub fn client_address(
    headers: &HeaderMap,
    connect: Option<&ConnectInfo<SocketAddr>>,
    trust_proxy_headers: bool,
) -> String {
    let forwarded = trust_proxy_headers
        .then(|| {
            headers
                .get("cf-connecting-ip")
                .or_else(|| headers.get("x-real-ip"))
                .or_else(|| headers.get("x-forwarded-for"))
                .and_then(|v| v.to_str().ok())
                .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .flatten();
    forwarded
        .or_else(|| connect.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
