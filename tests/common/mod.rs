//! Shared harness for the integration tests: a scripted analyzer standing in
//! for the external ML pipeline, and a service instance bound to an
//! ephemeral port with its upload temp dir captured for inspection.

#![allow(dead_code)]

use async_trait::async_trait;
use attune::pipeline::{SpeechAnalysis, SpeechAnalyzer};
use attune::{Clock, Service, ServiceConfig};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Scripted stand-in for the external inference pipeline.
///
/// Pops scripted responses in order and falls back to a fixed analysis when
/// the script is exhausted. An optional gate blocks `analyze` until opened,
/// for tests that need the worker pinned mid-chunk.
pub struct ScriptedAnalyzer {
    responses: Mutex<VecDeque<attune::Result<SpeechAnalysis>>>,
    fallback: SpeechAnalysis,
    gate: watch::Receiver<bool>,
    /// Keeps an always-open gate alive for [`ScriptedAnalyzer::open`].
    _gate_keeper: Option<watch::Sender<bool>>,
}

impl ScriptedAnalyzer {
    /// Analyzer that always answers immediately.
    pub fn open(fallback: SpeechAnalysis) -> Arc<Self> {
        let (tx, rx) = watch::channel(true);
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            fallback,
            gate: rx,
            _gate_keeper: Some(tx),
        })
    }

    /// Analyzer that blocks every call until the returned sender is flipped
    /// to `true`.
    pub fn gated(fallback: SpeechAnalysis) -> (Arc<Self>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Arc::new(Self {
                responses: Mutex::new(VecDeque::new()),
                fallback,
                gate: rx,
                _gate_keeper: None,
            }),
            tx,
        )
    }

    /// Queue the next scripted response.
    pub fn push(&self, response: attune::Result<SpeechAnalysis>) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }
}

#[async_trait]
impl SpeechAnalyzer for ScriptedAnalyzer {
    async fn analyze(&self, _audio_path: &Path) -> attune::Result<SpeechAnalysis> {
        let mut gate = self.gate.clone();
        while !*gate.borrow() {
            if gate.changed().await.is_err() {
                break;
            }
        }
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// A happy-path analysis payload.
pub fn happy_analysis() -> SpeechAnalysis {
    SpeechAnalysis {
        emotion: Some("happy".to_owned()),
        emotion_confidence: 0.9,
        transcript: Some("hi".to_owned()),
        language: Some("en".to_owned()),
        sentiment: Some("positive".to_owned()),
        sentiment_confidence: Some(0.8),
    }
}

/// An analysis with a chosen raw emotion label and confidence.
pub fn analysis(emotion: &str, confidence: f32) -> SpeechAnalysis {
    SpeechAnalysis {
        emotion: Some(emotion.to_owned()),
        emotion_confidence: confidence,
        ..happy_analysis()
    }
}

/// A running service plus everything the tests poke at.
pub struct Harness {
    pub service: Service,
    pub base: String,
    pub client: reqwest::Client,
    pub tmp: tempfile::TempDir,
}

/// Build options for the harness.
pub struct HarnessOptions {
    pub store_uri: Option<String>,
    pub queue_capacity: usize,
    pub clock: Clock,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            store_uri: None,
            queue_capacity: 64,
            clock: Clock::system(),
        }
    }
}

/// Start a service on an ephemeral port with its own upload temp dir.
pub async fn start_service(
    analyzer: Arc<dyn SpeechAnalyzer>,
    options: HarnessOptions,
) -> Harness {
    let tmp = tempfile::tempdir().expect("create upload temp dir");
    let mut config = ServiceConfig::default();
    config.http.host = "127.0.0.1".to_owned();
    config.http.port = 0;
    config.queue.capacity = options.queue_capacity;
    config.queue.tmp_dir = Some(tmp.path().to_path_buf());
    if let Some(uri) = options.store_uri {
        config.store.url = Some(uri);
        config.store.service_key = Some("test-key".to_owned());
    }

    let service = Service::start(config, analyzer, options.clock)
        .await
        .expect("service starts");
    let base = format!("http://{}", service.addr());
    Harness {
        service,
        base,
        client: reqwest::Client::new(),
        tmp,
    }
}

impl Harness {
    /// POST a multipart upload to `/ser/analyze-speech`.
    pub async fn upload(&self, user_id: &str, filename: &str) -> reqwest::Response {
        let form = reqwest::multipart::Form::new()
            .text("user_id", user_id.to_owned())
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav_bytes())
                    .file_name(filename.to_owned())
                    .mime_str("audio/wav")
                    .expect("wav mime"),
            );
        self.client
            .post(format!("{}/ser/analyze-speech", self.base))
            .multipart(form)
            .send()
            .await
            .expect("upload request")
    }

    /// GET a JSON endpoint.
    pub async fn get_json(&self, path: &str) -> serde_json::Value {
        self.client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .expect("get request")
            .json()
            .await
            .expect("json body")
    }

    /// POST a JSON body, returning (status, body).
    pub async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> (reqwest::StatusCode, serde_json::Value) {
        let response = self
            .client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .expect("post request");
        let status = response.status();
        let body = response.json().await.unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    /// Number of files currently in the upload temp dir.
    pub fn upload_files(&self) -> usize {
        std::fs::read_dir(self.tmp.path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

/// One second of silence, 16 kHz mono 16-bit WAV.
pub fn wav_bytes() -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav writer");
        for _ in 0..16_000 {
            writer.write_sample(0i16).expect("wav sample");
        }
        writer.finalize().expect("wav finalize");
    }
    cursor.into_inner()
}

/// Poll until `cond` holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// The canonical test user.
pub const TEST_USER: &str = "11111111-1111-1111-1111-111111111111";
