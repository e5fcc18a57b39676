//! External ML pipeline boundary.
//!
//! The service depends on the inference stack only through the
//! [`SpeechAnalyzer`] trait and the canonical [`SpeechAnalysis`] shape.
//! Inference backends return loosely-shaped JSON (list-of-objects vs single
//! object, `labels` vs `label`, bilingual `"生气/angry"` labels); the
//! normalizer here fixes all of that into one shape so nothing duck-typed
//! leaks past this module.

use crate::config::AnalyzerConfig;
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

/// Canonical result of analyzing one audio chunk.
///
/// `emotion` carries the raw classifier label (nine-class); mapping to the
/// four-class contract — and the drop decision — happens at the worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeechAnalysis {
    /// Raw classifier emotion label, or `None` when the classifier skipped
    /// the chunk.
    pub emotion: Option<String>,
    /// Emotion confidence in `0.0..=1.0`.
    pub emotion_confidence: f32,
    /// Transcribed text, when transcription produced any.
    pub transcript: Option<String>,
    /// Detected language code: `en`, `ms`, `zh`, or `unknown`.
    pub language: Option<String>,
    /// Sentiment label from the text classifier.
    pub sentiment: Option<String>,
    /// Sentiment confidence in `0.0..=1.0`.
    pub sentiment_confidence: Option<f32>,
}

/// The external speech analysis collaborator.
///
/// Implementations may take seconds per chunk and may fail; both are handled
/// at the worker boundary. The worker never re-enters the analyzer for the
/// same chunk.
#[async_trait]
pub trait SpeechAnalyzer: Send + Sync {
    /// Analyze the WAV file at `audio_path`.
    async fn analyze(&self, audio_path: &Path) -> Result<SpeechAnalysis>;
}

// ---------------------------------------------------------------------------
// Payload normalization
// ---------------------------------------------------------------------------

/// Normalize a loosely-shaped inference payload into [`SpeechAnalysis`].
///
/// Accepted emotion shapes, in order of preference:
/// 1. canonical: `{"emotion": <string|null>, "emotion_confidence": <f>}`
/// 2. classifier-raw: `{"labels": [...], "scores": [...]}` (or scalar
///    `label`/`score`, or the whole thing wrapped in a one-element array)
///
/// Transcript, language, and sentiment fields are read from the top level
/// when present; the language is mapped onto the supported set.
pub fn normalize_analysis_payload(payload: &Value) -> Result<SpeechAnalysis> {
    let top = match payload {
        Value::Array(items) => items
            .first()
            .ok_or_else(|| IngestError::Pipeline("empty analysis payload".to_owned()))?,
        other => other,
    };
    let obj = top
        .as_object()
        .ok_or_else(|| IngestError::Pipeline("analysis payload is not an object".to_owned()))?;

    let (emotion, emotion_confidence) = if obj.contains_key("emotion") {
        let emotion = obj
            .get("emotion")
            .and_then(Value::as_str)
            .map(|s| s.to_owned());
        let confidence = obj
            .get("emotion_confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32;
        (emotion.map(|e| strip_bilingual_label(&e)), confidence)
    } else {
        extract_label_scores(obj)?
    };

    let transcript = non_empty_string(obj.get("transcript"));
    let language = non_empty_string(obj.get("language"))
        .map(|code| map_language(&code).unwrap_or("unknown").to_owned());
    let sentiment = non_empty_string(obj.get("sentiment"));
    let sentiment_confidence = obj
        .get("sentiment_confidence")
        .and_then(Value::as_f64)
        .map(|v| v as f32);

    Ok(SpeechAnalysis {
        emotion,
        emotion_confidence,
        transcript,
        language,
        sentiment,
        sentiment_confidence,
    })
}

/// Pull the highest-scoring label out of a classifier-raw object.
fn extract_label_scores(
    obj: &serde_json::Map<String, Value>,
) -> Result<(Option<String>, f32)> {
    let labels_value = obj
        .get("labels")
        .or_else(|| obj.get("label"))
        .ok_or_else(|| IngestError::Pipeline("payload has no emotion labels".to_owned()))?;
    let scores_value = obj.get("scores").or_else(|| obj.get("score"));

    let labels: Vec<String> = match labels_value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.to_owned())
            .collect(),
        Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    };
    let scores: Vec<f32> = match scores_value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_f64)
            .map(|v| v as f32)
            .collect(),
        Some(Value::Number(n)) => n.as_f64().map(|v| vec![v as f32]).unwrap_or_default(),
        _ => Vec::new(),
    };

    if labels.is_empty() {
        return Ok((None, 0.0));
    }

    let mut best_idx = 0usize;
    let mut best_score = scores.first().copied().unwrap_or(0.0);
    for (idx, score) in scores.iter().enumerate().skip(1) {
        if *score > best_score {
            best_score = *score;
            best_idx = idx;
        }
    }
    let label = labels
        .get(best_idx)
        .or_else(|| labels.first())
        .map(|l| strip_bilingual_label(l));

    Ok((label, best_score))
}

/// Extract the English half of a bilingual `"生气/angry"` label.
fn strip_bilingual_label(raw: &str) -> String {
    raw.rsplit('/').next().unwrap_or(raw).trim().to_owned()
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_owned())
}

/// Map a detector language code onto the supported set.
///
/// Indonesian folds into Malay; regional Chinese variants fold into `zh`.
/// Unsupported codes return `None` (callers record `unknown`).
pub fn map_language(code: &str) -> Option<&'static str> {
    let lower = code.trim().to_lowercase();
    match lower.as_str() {
        "en" => return Some("en"),
        "ms" | "id" => return Some("ms"),
        "zh" | "zh-cn" | "zh-tw" => return Some("zh"),
        _ => {}
    }
    match lower.split('-').next() {
        Some("en") => Some("en"),
        Some("ms") | Some("id") => Some("ms"),
        Some("zh") => Some("zh"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Audio metadata probe
// ---------------------------------------------------------------------------

/// Audio metadata persisted alongside each speech row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioMetadata {
    pub sample_rate: u32,
    pub duration_sec: f32,
    pub frame_size_ms: f32,
    pub frame_stride_ms: f32,
}

impl Default for AudioMetadata {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            duration_sec: 0.0,
            frame_size_ms: 25.0,
            frame_stride_ms: 10.0,
        }
    }
}

/// Probe a WAV file for sample rate and duration.
///
/// Any probe failure falls back to [`AudioMetadata::default`]; a malformed
/// header never blocks analysis.
pub fn probe_wav(path: &Path) -> AudioMetadata {
    match hound::WavReader::open(path) {
        Ok(reader) => {
            let spec = reader.spec();
            let frames = reader.duration();
            let duration_sec = if spec.sample_rate > 0 {
                frames as f32 / spec.sample_rate as f32
            } else {
                0.0
            };
            AudioMetadata {
                sample_rate: spec.sample_rate,
                duration_sec,
                ..AudioMetadata::default()
            }
        }
        Err(e) => {
            tracing::warn!("audio probe failed for {}: {e}", path.display());
            AudioMetadata::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Remote analyzer
// ---------------------------------------------------------------------------

/// [`SpeechAnalyzer`] backed by an external inference HTTP service.
///
/// Uploads the raw WAV body to `{base}/analyze` and normalizes whatever
/// shape comes back.
pub struct RemoteAnalyzer {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteAnalyzer {
    /// Build a remote analyzer from config.
    ///
    /// # Errors
    ///
    /// Returns a config error when no analyzer URL is set.
    pub fn new(config: &AnalyzerConfig) -> Result<Self> {
        let base_url = config
            .url
            .clone()
            .ok_or_else(|| IngestError::Config("analyzer.url is not configured".to_owned()))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IngestError::Config(format!("cannot build analyzer client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl SpeechAnalyzer for RemoteAnalyzer {
    async fn analyze(&self, audio_path: &Path) -> Result<SpeechAnalysis> {
        let audio = tokio::fs::read(audio_path).await?;
        let response = self
            .client
            .post(format!("{}/analyze", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(audio)
            .send()
            .await
            .map_err(|e| IngestError::Pipeline(format!("inference request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Pipeline(format!(
                "inference service returned {status}"
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| IngestError::Pipeline(format!("invalid inference response: {e}")))?;
        normalize_analysis_payload(&payload)
    }
}
