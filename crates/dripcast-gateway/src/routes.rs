//! Request handlers for the admin API and the payment webhook.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, NaiveDate, Utc};
use dripcast_core::error::DripError;
use dripcast_core::traits::Clock;
use dripcast_core::types::Track;
use dripcast_scheduler::PaymentEvent;
use dripcast_store::{BroadcastInput, SettingKey, TemplateInput, time};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{ApiError, ApiResult};
use crate::server::{AppState, secrets_match};

const DEFAULT_PAYMENT_LIMIT: u32 = 20;
const MAX_PAYMENT_LIMIT: u32 = 500;

fn parse_track(raw: &str) -> ApiResult<Track> {
    Ok(raw.parse::<Track>()?)
}

impl AppState {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn today(&self) -> NaiveDate {
        time::local_date(self.now(), self.utc_offset_minutes)
    }
}

// --- Public ---

/// Liveness: the process is up and the store answers.
pub async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    state.store.read_async(|db| db.ping()).await?;
    Ok(Json(json!({ "ok": true })))
}

/// Payment notification from the payment provider.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(event): Json<PaymentEvent>,
) -> Response {
    if let Some(expected) = state.webhook_secret.as_deref() {
        let given = headers
            .get("X-Webhook-Secret")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !secrets_match(given, expected) {
            tracing::warn!(user_id = event.user_id, "payment webhook rejected: bad secret");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "ok": false, "error": "invalid webhook secret" })),
            )
                .into_response();
        }
    }
    match state.registry.payment(&event).await {
        Ok(outcome) => Json(json!({ "ok": true, "outcome": outcome })).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

// --- Health, stats, payments ---

pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let health = state.store.read_async(move |db| db.health()).await?;
    Ok(Json(json!({ "ok": health.ok(), "health": health })))
}

/// Same as `health`, but answers 503 while any alarm is raised so that an
/// external monitor can poll it.
pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let health = state.store.read_async(move |db| db.health()).await?;
    let status = if health.ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(json!({ "ok": health.ok(), "health": health }))).into_response())
}

pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let (today, now) = (state.today(), state.now());
    let stats = state.store.read_async(move |db| db.stats(today, now)).await?;
    Ok(Json(json!({ "ok": true, "stats": stats })))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<u32>,
}

pub async fn recent_payments(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let limit = q.limit.unwrap_or(DEFAULT_PAYMENT_LIMIT).clamp(1, MAX_PAYMENT_LIMIT);
    let payments = state.store.read_async(move |db| db.recent_payments(limit)).await?;
    Ok(Json(json!({ "ok": true, "payments": payments })))
}

pub async fn utm_breakdown(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let rows = state.store.read_async(move |db| db.utm_breakdown()).await?;
    Ok(Json(json!({ "ok": true, "utm": rows })))
}

pub async fn export_users(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let today = state.today();
    let csv = state.store.read_async(move |db| db.export_users_csv(today)).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"users.csv\""),
        ],
        csv,
    )
        .into_response())
}

// --- Templates ---

pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    Path(track): Path<String>,
) -> ApiResult<Json<Value>> {
    let track = parse_track(&track)?;
    let templates = state.store.read_async(move |db| db.list_templates(track)).await?;
    Ok(Json(json!({ "ok": true, "templates": templates })))
}

pub async fn add_template(
    State(state): State<Arc<AppState>>,
    Path(track): Path<String>,
    Json(input): Json<TemplateInput>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let track = parse_track(&track)?;
    let template = state.store.write_async(move |db| db.add_template(track, &input)).await?;
    tracing::info!(track = %track, seq_no = template.seq_no, "template added");
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "template": template }))))
}

pub async fn get_template(
    State(state): State<Arc<AppState>>,
    Path((track, seq_no)): Path<(String, i64)>,
) -> ApiResult<Json<Value>> {
    let track = parse_track(&track)?;
    let template = state.store.read_async(move |db| db.get_template(track, seq_no)).await?;
    Ok(Json(json!({ "ok": true, "template": template })))
}

pub async fn update_template(
    State(state): State<Arc<AppState>>,
    Path((track, seq_no)): Path<(String, i64)>,
    Json(input): Json<TemplateInput>,
) -> ApiResult<Json<Value>> {
    let track = parse_track(&track)?;
    let template = state
        .store
        .write_async(move |db| db.update_template(track, seq_no, &input))
        .await?;
    tracing::info!(track = %track, seq_no, "template updated");
    Ok(Json(json!({ "ok": true, "template": template })))
}

pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    Path((track, seq_no)): Path<(String, i64)>,
) -> ApiResult<Json<Value>> {
    let track = parse_track(&track)?;
    let cancelled = state.store.write_async(move |db| db.delete_template(track, seq_no)).await?;
    tracing::info!(track = %track, seq_no, cancelled, "template deleted");
    Ok(Json(json!({ "ok": true, "cancelled": cancelled })))
}

// --- Welcome menu ---

#[derive(Debug, Deserialize)]
pub struct LabelReq {
    label: String,
}

#[derive(Debug, Deserialize)]
pub struct FollowupReq {
    body: String,
    #[serde(default)]
    photo_ref: Option<String>,
}

pub async fn list_menu(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let menu = state.store.read_async(move |db| db.list_menu()).await?;
    Ok(Json(json!({ "ok": true, "menu": menu })))
}

pub async fn add_menu_button(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LabelReq>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let button = state.store.write_async(move |db| db.add_menu_button(&req.label)).await?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "button": button }))))
}

pub async fn rename_menu_button(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<LabelReq>,
) -> ApiResult<Json<Value>> {
    let button = state.store.write_async(move |db| db.rename_menu_button(id, &req.label)).await?;
    Ok(Json(json!({ "ok": true, "button": button })))
}

pub async fn delete_menu_button(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.store.write_async(move |db| db.delete_menu_button(id)).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn add_followup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<FollowupReq>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let followup = state
        .store
        .write_async(move |db| db.add_followup(id, &req.body, req.photo_ref))
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "followup": followup }))))
}

pub async fn delete_followup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.store.write_async(move |db| db.delete_followup(id)).await?;
    Ok(Json(json!({ "ok": true })))
}

// --- Broadcasts ---

#[derive(Debug, Deserialize)]
pub struct BroadcastQuery {
    #[serde(default)]
    include_sent: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct PauseReq {
    #[serde(default)]
    resume_at: Option<DateTime<Utc>>,
}

pub async fn list_broadcasts(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BroadcastQuery>,
) -> ApiResult<Json<Value>> {
    let broadcasts = state.store.read_async(move |db| db.list_broadcasts(q.include_sent)).await?;
    Ok(Json(json!({ "ok": true, "broadcasts": broadcasts })))
}

pub async fn schedule_broadcast(
    State(state): State<Arc<AppState>>,
    Json(input): Json<BroadcastInput>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let now = state.now();
    let broadcast = state.store.write_async(move |db| db.schedule_broadcast(&input, now)).await?;
    tracing::info!(
        broadcast_id = broadcast.id,
        track = %broadcast.track,
        fire_at = %broadcast.fire_at,
        "broadcast scheduled"
    );
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "broadcast": broadcast }))))
}

pub async fn delete_broadcast(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.store.write_async(move |db| db.delete_broadcast(id)).await?;
    Ok(Json(json!({ "ok": true })))
}

/// Body is optional: an empty request pauses until resumed by hand.
pub async fn pause_broadcasts(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let req: PauseReq = if body.iter().all(u8::is_ascii_whitespace) {
        PauseReq::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| DripError::validation("resume_at", e.to_string()))?
    };
    let now = state.now();
    state.store.write_async(move |db| db.pause_broadcasts(req.resume_at, now)).await?;
    tracing::info!(resume_at = ?req.resume_at, "dispatch paused");
    Ok(Json(json!({ "ok": true, "enabled": false, "resume_at": req.resume_at })))
}

pub async fn resume_broadcasts(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let now = state.now();
    state.store.write_async(move |db| db.resume_broadcasts(now)).await?;
    tracing::info!("dispatch resumed");
    Ok(Json(json!({ "ok": true, "enabled": true })))
}

// --- Settings ---

#[derive(Debug, Deserialize)]
pub struct SettingReq {
    value: String,
}

pub async fn list_settings(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let settings = state.store.read_async(move |db| db.all_settings()).await?;
    let map: serde_json::Map<String, Value> = settings
        .into_iter()
        .map(|(k, v)| (k.as_str().to_string(), Value::String(v)))
        .collect();
    Ok(Json(json!({ "ok": true, "settings": map })))
}

pub async fn get_setting(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<Value>> {
    let key: SettingKey = key.parse()?;
    let value = state.store.read_async(move |db| db.get_setting(key)).await?;
    Ok(Json(json!({ "ok": true, "key": key.as_str(), "value": value })))
}

pub async fn put_setting(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(req): Json<SettingReq>,
) -> ApiResult<Json<Value>> {
    let key: SettingKey = key.parse()?;
    let now = state.now();
    let value = req.value.clone();
    state
        .store
        .write_async(move |db| db.set_setting(key, &value, now))
        .await?;
    tracing::info!(key = key.as_str(), "setting updated");
    Ok(Json(json!({ "ok": true, "key": key.as_str(), "value": req.value })))
}
