//! HTTP edge: ingest, status/dashboard, and control-plane endpoints.
//!
//! All bodies are JSON with typed request records (unknown fields are
//! rejected); error bodies are `{"error": ...}`. Producers only ever see
//! 200/400/503 on the ingest path.

use crate::clock::{Clock, parse_wire_timestamp};
use crate::control::{
    AGGREGATION_INTERVAL_BOUNDS, AGGREGATION_INTERVAL_DEFAULT, ControlPlane,
    GENERATION_INTERVAL_BOUNDS, GENERATION_INTERVAL_DEFAULT,
};
use crate::emotion::{EmotionLabel, ModelSignal, Modality};
use crate::error::IngestError;
use crate::generator::write_signal;
use crate::queue::{ChunkJob, ChunkQueue};
use crate::results::ResultLog;
use crate::session::SessionTracker;
use crate::store::StoreClient;
use axum::Router;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{Html, Json};
use axum::routing::{get, post};
use chrono::Duration;
use serde::Deserialize;
use serde_json::{Value, json};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;
use uuid::Uuid;

/// Recent-request window on the status page.
const STATUS_RECENT_MINUTES: i64 = 10;

/// Results shown on status/dashboard feeds.
const STATUS_RESULT_LIMIT: usize = 50;

/// How far back the dashboard supplements results from the store.
const DASHBOARD_STORE_LOOKBACK_HOURS: i64 = 24;

/// Shared state for the axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<ChunkQueue>,
    pub tracker: Arc<SessionTracker>,
    pub results: Arc<ResultLog>,
    pub control: Arc<ControlPlane>,
    pub store: Option<Arc<StoreClient>>,
    pub clock: Clock,
    pub tmp_dir: Option<PathBuf>,
    pub worker_running: Arc<AtomicBool>,
    pub aggregator_running: Arc<AtomicBool>,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ser/analyze-speech", post(analyze_speech))
        .route("/ser/status", get(ser_status))
        .route("/ser/dashboard", get(dashboard_page))
        .route("/ser/api/dashboard/status", get(dashboard_status))
        .route(
            "/ser/api/aggregation-interval",
            get(get_aggregation_interval).post(set_aggregation_interval),
        )
        .route("/simulation/demo-mode", get(get_demo_mode).post(set_demo_mode))
        .route(
            "/simulation/emotion-bias",
            get(get_all_biases).post(set_emotion_bias),
        )
        .route("/simulation/emotion-bias/{modality}", get(get_emotion_bias))
        .route(
            "/simulation/generation-interval",
            get(get_generation_interval).post(set_generation_interval),
        )
        .route(
            "/simulation/modality-toggle",
            get(get_modality_toggles).post(set_modality_toggle),
        )
        .route("/simulation/user-id", get(get_user_id).post(set_user_id))
        .route("/simulation/inject-signals", post(inject_signals))
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    let message = message.into();
    if status == StatusCode::BAD_REQUEST {
        warn!("request rejected: {message}");
    } else {
        tracing::error!("request failed: {message}");
    }
    (status, Json(json!({ "error": message })))
}

fn map_error(e: &IngestError) -> (StatusCode, Json<Value>) {
    let status = match e {
        IngestError::Validation(_) => StatusCode::BAD_REQUEST,
        IngestError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_body(status, e.to_string())
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

async fn analyze_speech(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    let mut user_id_field: Option<String> = None;
    let mut upload: Option<(Option<String>, axum::body::Bytes)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return error_body(
                    StatusCode::BAD_REQUEST,
                    format!("malformed multipart body: {e}"),
                );
            }
        };
        match field.name() {
            Some("user_id") => match field.text().await {
                Ok(text) => user_id_field = Some(text),
                Err(e) => {
                    return error_body(StatusCode::BAD_REQUEST, format!("invalid user_id: {e}"));
                }
            },
            Some("file") => {
                let filename = field.file_name().map(|f| f.to_owned());
                match field.bytes().await {
                    Ok(data) => upload = Some((filename, data)),
                    Err(e) => {
                        return error_body(
                            StatusCode::BAD_REQUEST,
                            format!("failed to read upload: {e}"),
                        );
                    }
                }
            }
            _ => {}
        }
    }

    let Some(raw_user) = user_id_field else {
        return error_body(StatusCode::BAD_REQUEST, "user_id form field is required");
    };
    let Ok(user_id) = Uuid::parse_str(raw_user.trim()) else {
        return error_body(
            StatusCode::BAD_REQUEST,
            format!("Invalid user_id format: {raw_user}. Must be a valid UUID."),
        );
    };
    let Some((filename, data)) = upload else {
        return error_body(StatusCode::BAD_REQUEST, "file form field is required");
    };
    if !filename.as_deref().unwrap_or_default().ends_with(".wav") {
        return error_body(StatusCode::BAD_REQUEST, "Only .wav files are supported.");
    }

    // Persist the upload to a temp file; the job owns it from here on.
    let mut builder = tempfile::Builder::new();
    builder.prefix("attune-chunk-").suffix(".wav");
    let file = match &state.tmp_dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    };
    let mut file = match file {
        Ok(file) => file,
        Err(e) => {
            warn!("cannot create upload temp file: {e}");
            return error_body(
                StatusCode::SERVICE_UNAVAILABLE,
                "cannot buffer upload to disk",
            );
        }
    };
    if let Err(e) = file.write_all(&data) {
        warn!("cannot write upload temp file: {e}");
        return error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "cannot buffer upload to disk",
        );
    }

    let job = ChunkJob {
        user_id,
        audio: file.into_temp_path(),
        captured_at: state.clock.now(),
        filename,
    };
    match state.queue.enqueue(job) {
        Ok(queue_size) => (
            StatusCode::OK,
            Json(json!({
                "status": "queued",
                "message": "Audio chunk queued for processing",
                "queue_size": queue_size,
            })),
        ),
        Err(IngestError::ResourceExhausted(_)) => error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "Failed to enqueue audio chunk for processing",
        ),
        Err(e) => map_error(&e),
    }
}

// ---------------------------------------------------------------------------
// Status & dashboard
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "worker_running": state.worker_running.load(Ordering::Relaxed),
        "aggregator_running": state.aggregator_running.load(Ordering::Relaxed),
        "queue_size": state.queue.size(),
    }))
}

async fn ser_status(State(state): State<AppState>) -> Json<Value> {
    let counters = state.queue.counters();
    let since = state.clock.now() - Duration::minutes(STATUS_RECENT_MINUTES);
    Json(json!({
        "worker_running": state.worker_running.load(Ordering::Relaxed),
        "queue_size": state.queue.size(),
        "processed": counters.processed(),
        "dropped": counters.dropped(),
        "recent_requests": state.queue.accepted_since(since),
        "processing": state.queue.processing_item(),
        "results": state.results.recent_chunks(STATUS_RESULT_LIMIT, None),
    }))
}

async fn dashboard_status(State(state): State<AppState>) -> Json<Value> {
    let processing: Vec<Value> = state
        .queue
        .processing_item()
        .and_then(|item| serde_json::to_value(item).ok())
        .into_iter()
        .collect();
    let since = state.clock.now() - Duration::minutes(STATUS_RECENT_MINUTES);

    let ring = state.results.recent_chunks(STATUS_RESULT_LIMIT, None);
    let mut results: Vec<Value> = ring
        .iter()
        .filter_map(|r| serde_json::to_value(r).ok())
        .collect();

    // Supplement with store rows not yet consumed downstream. Failures here
    // degrade the view, never the endpoint.
    if let Some(store) = &state.store {
        let users: std::collections::HashSet<Uuid> = ring.iter().map(|r| r.user_id).collect();
        let mut seen: std::collections::HashSet<(String, String)> = ring
            .iter()
            .map(|r| (r.user_id.to_string(), r.result.captured_at.to_rfc3339()))
            .collect();

        let now = state.clock.now();
        let lookback = now - Duration::hours(DASHBOARD_STORE_LOOKBACK_HOURS);
        for user_id in users {
            let low_water = store.last_downstream_consumption_timestamp(user_id).await;
            let signals = match store
                .query_voice_emotion_signals(user_id, lookback, now, true)
                .await
            {
                Ok(signals) => signals,
                Err(e) => {
                    warn!("dashboard store supplement failed for user {user_id}: {e}");
                    continue;
                }
            };
            for signal in signals {
                if low_water.is_some_and(|mark| signal.timestamp <= mark) {
                    continue;
                }
                let key = (user_id.to_string(), signal.timestamp.to_rfc3339());
                if !seen.insert(key) {
                    continue;
                }
                results.push(json!({
                    "user_id": user_id,
                    "captured_at": signal.timestamp.to_rfc3339(),
                    "emotion": signal.emotion_label,
                    "emotion_confidence": signal.confidence,
                    "transcript": null,
                    "language": null,
                    "sentiment": null,
                    "sentiment_confidence": null,
                    "stored": true,
                }));
            }
        }
    }

    results.sort_by(|a, b| {
        let key = |v: &Value| v["captured_at"].as_str().unwrap_or_default().to_owned();
        key(b).cmp(&key(a))
    });
    results.truncate(STATUS_RESULT_LIMIT);

    Json(json!({
        "queue_size": state.queue.size(),
        "queue": state.queue.accepted_since(since),
        "processing": processing,
        "results": results,
        "aggregated": state.results.recent_aggregated(100, None),
    }))
}

async fn dashboard_page() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

// ---------------------------------------------------------------------------
// Aggregation interval
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AggregationIntervalRequest {
    interval_seconds: u64,
}

fn aggregation_interval_status(control: &ControlPlane) -> Value {
    json!({
        "interval_seconds": control.aggregation_interval_secs(),
        "min_interval": AGGREGATION_INTERVAL_BOUNDS.0,
        "max_interval": AGGREGATION_INTERVAL_BOUNDS.1,
        "default_interval": AGGREGATION_INTERVAL_DEFAULT,
    })
}

async fn get_aggregation_interval(State(state): State<AppState>) -> Json<Value> {
    Json(aggregation_interval_status(&state.control))
}

async fn set_aggregation_interval(
    State(state): State<AppState>,
    Json(request): Json<AggregationIntervalRequest>,
) -> (StatusCode, Json<Value>) {
    match state
        .control
        .set_aggregation_interval_secs(request.interval_seconds)
    {
        Ok(()) => (StatusCode::OK, Json(aggregation_interval_status(&state.control))),
        Err(e) => map_error(&e),
    }
}

// ---------------------------------------------------------------------------
// Demo mode
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DemoModeRequest {
    enabled: bool,
}

async fn get_demo_mode(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "enabled": state.control.demo_mode() }))
}

async fn set_demo_mode(
    State(state): State<AppState>,
    Json(request): Json<DemoModeRequest>,
) -> Json<Value> {
    state.control.set_demo_mode(request.enabled);
    Json(json!({ "enabled": state.control.demo_mode() }))
}

// ---------------------------------------------------------------------------
// Emotion bias
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmotionBiasRequest {
    modality: String,
    emotion: Option<String>,
}

/// Parse a four-class label from the wire; anything else is a 400.
fn parse_emotion(raw: &str) -> Result<EmotionLabel, IngestError> {
    match raw {
        "Angry" => Ok(EmotionLabel::Angry),
        "Sad" => Ok(EmotionLabel::Sad),
        "Happy" => Ok(EmotionLabel::Happy),
        "Fear" => Ok(EmotionLabel::Fear),
        _ => Err(IngestError::Validation(format!(
            "Invalid emotion: {raw}. Must be one of Angry, Sad, Happy, Fear"
        ))),
    }
}

fn parse_modality(raw: &str) -> Result<Modality, IngestError> {
    Modality::parse(raw).ok_or_else(|| {
        IngestError::Validation(format!(
            "Invalid modality: {raw}. Must be speech, face, or vitals"
        ))
    })
}

fn all_biases(control: &ControlPlane) -> Value {
    let mut body = serde_json::Map::new();
    for (modality, bias) in control.all_biases() {
        body.insert(
            modality.as_str().to_owned(),
            bias.map(|b| json!(b)).unwrap_or(Value::Null),
        );
    }
    Value::Object(body)
}

async fn get_all_biases(State(state): State<AppState>) -> Json<Value> {
    Json(all_biases(&state.control))
}

async fn get_emotion_bias(
    State(state): State<AppState>,
    Path(modality): Path<String>,
) -> (StatusCode, Json<Value>) {
    match parse_modality(&modality) {
        Ok(modality) => (
            StatusCode::OK,
            Json(json!({
                "modality": modality,
                "emotion": state.control.bias(modality),
            })),
        ),
        Err(e) => map_error(&e),
    }
}

async fn set_emotion_bias(
    State(state): State<AppState>,
    Json(request): Json<EmotionBiasRequest>,
) -> (StatusCode, Json<Value>) {
    let modality = match parse_modality(&request.modality) {
        Ok(m) => m,
        Err(e) => return map_error(&e),
    };
    let emotion = match request.emotion.as_deref().map(parse_emotion).transpose() {
        Ok(emotion) => emotion,
        Err(e) => return map_error(&e),
    };
    state.control.set_bias(modality, emotion);
    (
        StatusCode::OK,
        Json(json!({
            "modality": modality,
            "emotion": state.control.bias(modality),
        })),
    )
}

// ---------------------------------------------------------------------------
// Generation interval
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GenerationIntervalRequest {
    interval: u64,
}

fn generation_interval_status(control: &ControlPlane) -> Value {
    json!({
        "interval": control.generation_interval_secs(),
        "min_interval": GENERATION_INTERVAL_BOUNDS.0,
        "max_interval": GENERATION_INTERVAL_BOUNDS.1,
        "default_interval": GENERATION_INTERVAL_DEFAULT,
    })
}

async fn get_generation_interval(State(state): State<AppState>) -> Json<Value> {
    Json(generation_interval_status(&state.control))
}

async fn set_generation_interval(
    State(state): State<AppState>,
    Json(request): Json<GenerationIntervalRequest>,
) -> (StatusCode, Json<Value>) {
    match state.control.set_generation_interval_secs(request.interval) {
        Ok(()) => (
            StatusCode::OK,
            Json(generation_interval_status(&state.control)),
        ),
        Err(e) => map_error(&e),
    }
}

// ---------------------------------------------------------------------------
// Modality toggles
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModalityToggleRequest {
    modality: String,
    enabled: bool,
}

fn toggle_status(control: &ControlPlane) -> Value {
    let mut body = serde_json::Map::new();
    for (modality, enabled) in control.all_toggles() {
        body.insert(modality.as_str().to_owned(), Value::Bool(enabled));
    }
    Value::Object(body)
}

async fn get_modality_toggles(State(state): State<AppState>) -> Json<Value> {
    Json(toggle_status(&state.control))
}

async fn set_modality_toggle(
    State(state): State<AppState>,
    Json(request): Json<ModalityToggleRequest>,
) -> (StatusCode, Json<Value>) {
    match parse_modality(&request.modality) {
        Ok(modality) => {
            state.control.set_modality_enabled(modality, request.enabled);
            (StatusCode::OK, Json(toggle_status(&state.control)))
        }
        Err(e) => map_error(&e),
    }
}

// ---------------------------------------------------------------------------
// Synthetic user id
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UserIdRequest {
    user_id: String,
}

async fn get_user_id(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "user_id": state.control.synthetic_user_id() }))
}

async fn set_user_id(
    State(state): State<AppState>,
    Json(request): Json<UserIdRequest>,
) -> (StatusCode, Json<Value>) {
    match Uuid::parse_str(request.user_id.trim()) {
        Ok(user_id) => {
            state.control.set_synthetic_user_id(user_id);
            (
                StatusCode::OK,
                Json(json!({ "user_id": state.control.synthetic_user_id() })),
            )
        }
        Err(_) => error_body(
            StatusCode::BAD_REQUEST,
            format!(
                "Invalid UUID format: {}. Must be a valid UUID.",
                request.user_id
            ),
        ),
    }
}

// ---------------------------------------------------------------------------
// Signal injection
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InjectSignal {
    user_id: Uuid,
    timestamp: String,
    emotion_label: String,
    confidence: f32,
    /// Per-signal modality is accepted but the top-level one governs.
    #[serde(default)]
    #[allow(dead_code)]
    modality: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InjectSignalsRequest {
    modality: String,
    signals: Vec<InjectSignal>,
}

async fn inject_signals(
    State(state): State<AppState>,
    Json(request): Json<InjectSignalsRequest>,
) -> (StatusCode, Json<Value>) {
    let modality = match parse_modality(&request.modality) {
        Ok(m) => m,
        Err(e) => return map_error(&e),
    };
    let Some(store) = &state.store else {
        return error_body(StatusCode::SERVICE_UNAVAILABLE, "store is not configured");
    };

    let mut injected = 0usize;
    for raw in &request.signals {
        let emotion_label = match parse_emotion(&raw.emotion_label) {
            Ok(label) => label,
            Err(e) => return map_error(&e),
        };
        let Some(timestamp) = parse_wire_timestamp(&raw.timestamp) else {
            return error_body(
                StatusCode::BAD_REQUEST,
                format!("Invalid timestamp: {}", raw.timestamp),
            );
        };
        let signal = ModelSignal {
            user_id: raw.user_id,
            timestamp,
            modality,
            emotion_label,
            confidence: raw.confidence,
        };
        match write_signal(store, &signal).await {
            Ok(()) => injected += 1,
            Err(e) => warn!("signal injection failed for user {}: {e}", raw.user_id),
        }
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "modality": modality,
            "signals_injected": injected,
        })),
    )
}

// ---------------------------------------------------------------------------
// Dashboard shell
// ---------------------------------------------------------------------------

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>attune — ingest dashboard</title>
<style>
  body { font-family: system-ui, sans-serif; margin: 2rem; background: #f6f7f9; }
  h1 { font-size: 1.3rem; }
  section { background: #fff; border-radius: 8px; padding: 1rem; margin-bottom: 1rem;
            box-shadow: 0 1px 2px rgba(0,0,0,.08); }
  h2 { font-size: 1rem; margin-top: 0; }
  pre { white-space: pre-wrap; font-size: .85rem; margin: 0; }
  .muted { color: #777; }
</style>
</head>
<body>
<h1>attune ingest dashboard</h1>
<section><h2>Queue</h2><pre id="queue" class="muted">loading…</pre></section>
<section><h2>Processing</h2><pre id="processing" class="muted">—</pre></section>
<section><h2>Recent results</h2><pre id="results" class="muted">—</pre></section>
<section><h2>Aggregated</h2><pre id="aggregated" class="muted">—</pre></section>
<script>
async function refresh() {
  try {
    const response = await fetch('/ser/api/dashboard/status');
    const data = await response.json();
    document.getElementById('queue').textContent =
      'size: ' + data.queue_size + '\n' + JSON.stringify(data.queue, null, 2);
    document.getElementById('processing').textContent =
      JSON.stringify(data.processing, null, 2);
    document.getElementById('results').textContent =
      JSON.stringify(data.results.slice(0, 10), null, 2);
    document.getElementById('aggregated').textContent =
      JSON.stringify(data.aggregated.slice(0, 10), null, 2);
  } catch (e) {
    document.getElementById('queue').textContent = 'fetch failed: ' + e;
  }
}
refresh();
setInterval(refresh, 3000);
</script>
</body>
</html>
"#;
