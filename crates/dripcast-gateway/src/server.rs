//! HTTP server: router assembly, bearer-token auth, graceful serve.

use std::future::Future;
use std::sync::Arc;

use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router, middleware};
use dripcast_core::config::GatewayConfig;
use dripcast_core::traits::Clock;
use dripcast_scheduler::LifecycleRegistry;
use dripcast_store::Store;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::routes;

/// Shared state for every handler.
pub struct AppState {
    pub store: Arc<Store>,
    pub registry: Arc<LifecycleRegistry>,
    pub clock: Arc<dyn Clock>,
    /// Empty disables the admin API.
    pub admin_token: String,
    pub webhook_secret: Option<String>,
    /// Offset that defines "today" for stats and export.
    pub utc_offset_minutes: i32,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<LifecycleRegistry>,
        clock: Arc<dyn Clock>,
        config: &GatewayConfig,
        utc_offset_minutes: i32,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            admin_token: config.admin_token.clone(),
            webhook_secret: config.webhook_secret.clone().filter(|s| !s.is_empty()),
            utc_offset_minutes,
        }
    }
}

/// Compare shared secrets without an early exit on the first differing byte.
pub(crate) fn secrets_match(given: &str, expected: &str) -> bool {
    if given.len() != expected.len() {
        return false;
    }
    given
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Bearer-token middleware for `/api`.
async fn require_admin(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> Response {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if !state.admin_token.is_empty() && secrets_match(presented, &state.admin_token) {
        return next.run(req).await;
    }
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "ok": false,
            "error": "Unauthorized: invalid or missing bearer token",
        })),
    )
        .into_response()
}

/// Build the router with admin (protected) and webhook (public) routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/health/check", get(routes::health_check))
        .route("/api/stats", get(routes::stats))
        .route("/api/payments/recent", get(routes::recent_payments))
        .route("/api/payments/utm", get(routes::utm_breakdown))
        .route("/api/export/users.csv", get(routes::export_users))
        // Templates
        .route(
            "/api/templates/{track}",
            get(routes::list_templates).post(routes::add_template),
        )
        .route(
            "/api/templates/{track}/{seq_no}",
            get(routes::get_template)
                .put(routes::update_template)
                .delete(routes::delete_template),
        )
        // Welcome menu
        .route(
            "/api/welcome-menu",
            get(routes::list_menu).post(routes::add_menu_button),
        )
        .route(
            "/api/welcome-menu/{id}",
            put(routes::rename_menu_button).delete(routes::delete_menu_button),
        )
        .route("/api/welcome-menu/{id}/followups", post(routes::add_followup))
        .route(
            "/api/welcome-menu/followups/{id}",
            delete(routes::delete_followup),
        )
        // Broadcasts
        .route(
            "/api/broadcasts",
            get(routes::list_broadcasts).post(routes::schedule_broadcast),
        )
        .route("/api/broadcasts/pause", post(routes::pause_broadcasts))
        .route("/api/broadcasts/resume", post(routes::resume_broadcasts))
        .route("/api/broadcasts/{id}", delete(routes::delete_broadcast))
        // Settings
        .route("/api/settings", get(routes::list_settings))
        .route(
            "/api/settings/{key}",
            get(routes::get_setting).put(routes::put_setting),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let public = Router::new()
        .route("/healthz", get(routes::healthz))
        .route("/webhook/payment", post(routes::payment_webhook));

    protected
        .merge(public)
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Origins from `DRIPCAST_CORS_ORIGINS` (comma separated), else any.
fn cors_layer() -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));
    match std::env::var("DRIPCAST_CORS_ORIGINS") {
        Ok(origins) if !origins.trim().is_empty() => {
            let allowed: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            cors.allow_origin(allowed)
        }
        _ => cors.allow_origin(Any),
    }
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    state: Arc<AppState>,
    config: &GatewayConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if state.admin_token.is_empty() {
        tracing::warn!("gateway.admin_token is empty: admin API will reject every request");
    }
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Admin API listening on http://{addr}");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("admin API stopped");
    Ok(())
}
