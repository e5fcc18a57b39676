//! Thin typed client for the external row store.
//!
//! The store is a PostgREST-style table service. This client owns the four
//! write/read operations the service needs plus the downstream low-water
//! mark lookup; everything is a single HTTP round-trip with no in-call
//! retries — the worker's next chunk or the aggregator's next tick is the
//! retry.

use crate::clock::parse_wire_timestamp;
use crate::config::StoreConfig;
use crate::emotion::{EmotionLabel, ModelSignal, Modality};
use crate::error::IngestError;
use crate::pipeline::AudioMetadata;
use chrono::{DateTime, FixedOffset};
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

/// Speech modality table.
const VOICE_TABLE: &str = "voice_emotion";
/// Face modality table.
const FACE_TABLE: &str = "face_emotion";
/// Vitals modality table (biometric-derived emotion predictions).
const VITALS_TABLE: &str = "bvs_emotion";
/// Downstream consumption log (read-only here).
const DOWNSTREAM_TABLE: &str = "emotional_log";

/// Default per-request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Store failure classification.
///
/// Transient failures are logged and skipped by callers; fatal failures drop
/// the offending record. Neither is retried within the call.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Timeout, connection failure, or server-side 5xx.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Client-side rejection or malformed response.
    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transient(msg) => IngestError::StoreTransient(msg),
            StoreError::Fatal(msg) => IngestError::StoreFatal(msg),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Fields of one speech-table row beyond user/time/audio metadata.
#[derive(Debug, Clone)]
pub struct VoiceEmotionRecord {
    pub emotion: EmotionLabel,
    pub emotion_confidence: f32,
    pub transcript: Option<String>,
    pub language: Option<String>,
    pub sentiment: Option<String>,
    pub sentiment_confidence: Option<f32>,
}

/// Typed wrapper around the row store REST endpoint.
pub struct StoreClient {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl StoreClient {
    /// Build a client from config. Returns `None` when no store URL is
    /// configured (the service then runs without persistence).
    pub fn from_config(config: &StoreConfig) -> crate::Result<Option<Self>> {
        let Some(url) = config.url.as_ref() else {
            return Ok(None);
        };
        let service_key = config.service_key.clone().ok_or_else(|| {
            IngestError::Config("store.url is set but store.service_key is missing".to_owned())
        })?;
        let timeout = config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout))
            .build()
            .map_err(|e| IngestError::Config(format!("cannot build store client: {e}")))?;
        Ok(Some(Self {
            client,
            base_url: url.trim_end_matches('/').to_owned(),
            service_key,
        }))
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    /// Best-effort connectivity probe used at startup. Failure is reported,
    /// never fatal.
    pub async fn probe(&self) -> StoreResult<()> {
        let response = self
            .authed(self.client.get(self.table_url(VOICE_TABLE)))
            .query(&[("select", "user_id"), ("limit", "1")])
            .send()
            .await
            .map_err(classify_request_error)?;
        check_status(&response)?;
        Ok(())
    }

    /// Upsert one speech-table row. Returns the persisted row.
    pub async fn insert_voice_emotion(
        &self,
        user_id: Uuid,
        captured_at: DateTime<FixedOffset>,
        record: &VoiceEmotionRecord,
        audio: &AudioMetadata,
        synthetic: bool,
    ) -> StoreResult<Value> {
        let mut row = json!({
            "user_id": user_id,
            "timestamp": captured_at.to_rfc3339(),
            "sample_rate": audio.sample_rate,
            "frame_size_ms": audio.frame_size_ms,
            "frame_stride_ms": audio.frame_stride_ms,
            "duration_sec": audio.duration_sec,
            "predicted_emotion": record.emotion.as_str(),
            "emotion_confidence": record.emotion_confidence,
            "is_synthetic": synthetic,
        });
        if let Some(transcript) = &record.transcript {
            row["transcript"] = json!(transcript);
        }
        if let Some(language) = &record.language {
            row["language"] = json!(language);
        }
        if let Some(sentiment) = &record.sentiment {
            row["sentiment"] = json!(sentiment);
        }
        if let Some(confidence) = record.sentiment_confidence {
            row["sentiment_confidence"] = json!(confidence);
        }

        let inserted = self.insert_row(VOICE_TABLE, row).await?;
        debug!(
            "inserted voice emotion for user {user_id}: {} ({:.2}, synthetic: {synthetic})",
            record.emotion, record.emotion_confidence
        );
        Ok(inserted)
    }

    /// Insert one synthetic face-modality row.
    ///
    /// The face table keeps second-resolution local timestamps plus a
    /// separate `date` column.
    pub async fn insert_face_emotion_synthetic(
        &self,
        user_id: Uuid,
        timestamp: DateTime<FixedOffset>,
        emotion: EmotionLabel,
        confidence: f32,
    ) -> StoreResult<Value> {
        let row = json!({
            "user_id": user_id,
            "timestamp": timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            "predicted_emotion": emotion.as_str(),
            "emotion_confidence": confidence,
            "date": timestamp.format("%Y-%m-%d").to_string(),
            "is_synthetic": true,
        });
        self.insert_row(FACE_TABLE, row).await
    }

    /// Insert one synthetic vitals-modality row.
    pub async fn insert_vitals_emotion_synthetic(
        &self,
        user_id: Uuid,
        timestamp: DateTime<FixedOffset>,
        emotion: EmotionLabel,
        confidence: f32,
    ) -> StoreResult<Value> {
        let row = json!({
            "user_id": user_id,
            "timestamp": timestamp.to_rfc3339(),
            "predicted_emotion": emotion.as_str(),
            "emotion_confidence": confidence,
            "date": timestamp.format("%Y-%m-%d").to_string(),
            "is_synthetic": true,
        });
        self.insert_row(VITALS_TABLE, row).await
    }

    /// Query speech rows in `[start, end]` for a user, normalized to
    /// four-class [`ModelSignal`]s ordered by timestamp ascending.
    ///
    /// Rows whose stored label does not map to the four-class enum are
    /// filtered out here; so are rows with unparseable timestamps.
    pub async fn query_voice_emotion_signals(
        &self,
        user_id: Uuid,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
        include_synthetic: bool,
    ) -> StoreResult<Vec<ModelSignal>> {
        let user_eq = format!("eq.{user_id}");
        let mut query = vec![
            ("select".to_owned(), "*".to_owned()),
            ("user_id".to_owned(), user_eq),
            ("timestamp".to_owned(), format!("gte.{}", start.to_rfc3339())),
            ("timestamp".to_owned(), format!("lte.{}", end.to_rfc3339())),
            ("order".to_owned(), "timestamp.asc".to_owned()),
        ];
        if !include_synthetic {
            query.push(("is_synthetic".to_owned(), "eq.false".to_owned()));
        }

        let response = self
            .authed(self.client.get(self.table_url(VOICE_TABLE)))
            .query(&query)
            .send()
            .await
            .map_err(classify_request_error)?;
        check_status(&response)?;

        let rows: Vec<Value> = response
            .json()
            .await
            .map_err(|e| StoreError::Fatal(format!("malformed voice query response: {e}")))?;

        let mut signals = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(label) = row
                .get("predicted_emotion")
                .and_then(Value::as_str)
                .and_then(EmotionLabel::from_stored)
            else {
                continue;
            };
            let Some(timestamp) = row
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(parse_wire_timestamp)
            else {
                continue;
            };
            signals.push(ModelSignal {
                user_id,
                timestamp,
                modality: Modality::Speech,
                emotion_label: label,
                confidence: row
                    .get("emotion_confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0) as f32,
            });
        }
        Ok(signals)
    }

    /// Most-recent downstream consumption timestamp for a user, or `None`.
    ///
    /// Used only to suppress already-consumed signals from dashboard views;
    /// a query failure therefore yields `None` and never propagates.
    pub async fn last_downstream_consumption_timestamp(
        &self,
        user_id: Uuid,
    ) -> Option<DateTime<FixedOffset>> {
        let user_eq = format!("eq.{user_id}");
        let result = async {
            let response = self
                .authed(self.client.get(self.table_url(DOWNSTREAM_TABLE)))
                .query(&[
                    ("select", "timestamp"),
                    ("user_id", user_eq.as_str()),
                    ("order", "timestamp.desc"),
                    ("limit", "1"),
                ])
                .send()
                .await
                .map_err(classify_request_error)?;
            check_status(&response)?;
            response
                .json::<Vec<Value>>()
                .await
                .map_err(|e| StoreError::Fatal(format!("malformed consumption response: {e}")))
        }
        .await;

        match result {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get("timestamp"))
                .and_then(Value::as_str)
                .and_then(parse_wire_timestamp),
            Err(e) => {
                warn!("downstream consumption lookup failed for user {user_id}: {e}");
                None
            }
        }
    }

    async fn insert_row(&self, table: &str, row: Value) -> StoreResult<Value> {
        let response = self
            .authed(self.client.post(self.table_url(table)))
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await
            .map_err(classify_request_error)?;
        check_status(&response)?;

        let mut rows: Vec<Value> = response
            .json()
            .await
            .map_err(|e| StoreError::Fatal(format!("malformed insert response: {e}")))?;
        if rows.is_empty() {
            return Err(StoreError::Fatal(format!(
                "insert into {table} returned no rows"
            )));
        }
        Ok(rows.remove(0))
    }
}

fn classify_request_error(e: reqwest::Error) -> StoreError {
    StoreError::Transient(format!("store request failed: {e}"))
}

fn check_status(response: &reqwest::Response) -> StoreResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    if status.is_server_error() {
        Err(StoreError::Transient(format!("store returned {status}")))
    } else {
        Err(StoreError::Fatal(format!("store rejected request: {status}")))
    }
}
