//! Control-plane endpoint tests: demo mode, bias, intervals, toggles,
//! synthetic user id, and signal injection.

mod common;

use common::{Harness, HarnessOptions, ScriptedAnalyzer, happy_analysis, start_service};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn plain_harness() -> Harness {
    start_service(
        ScriptedAnalyzer::open(happy_analysis()),
        HarnessOptions::default(),
    )
    .await
}

async fn shutdown(mut harness: Harness) {
    harness.service.shutdown().await;
}

#[tokio::test]
async fn demo_mode_round_trips() {
    let harness = plain_harness().await;

    let state = harness.get_json("/simulation/demo-mode").await;
    assert_eq!(state["enabled"], false);

    let (status, body) = harness
        .post_json("/simulation/demo-mode", json!({"enabled": true}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["enabled"], true);

    let state = harness.get_json("/simulation/demo-mode").await;
    assert_eq!(state["enabled"], true);

    shutdown(harness).await;
}

#[tokio::test]
async fn emotion_bias_set_read_and_clear() {
    let harness = plain_harness().await;

    let all = harness.get_json("/simulation/emotion-bias").await;
    assert_eq!(all, json!({"speech": null, "face": null, "vitals": null}));

    let (status, body) = harness
        .post_json(
            "/simulation/emotion-bias",
            json!({"modality": "speech", "emotion": "Sad"}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["emotion"], "Sad");

    let one = harness.get_json("/simulation/emotion-bias/speech").await;
    assert_eq!(one, json!({"modality": "speech", "emotion": "Sad"}));

    let all = harness.get_json("/simulation/emotion-bias").await;
    assert_eq!(all["speech"], "Sad");
    assert_eq!(all["face"], serde_json::Value::Null);

    // Clearing with null.
    let (status, body) = harness
        .post_json(
            "/simulation/emotion-bias",
            json!({"modality": "speech", "emotion": null}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["emotion"], serde_json::Value::Null);

    shutdown(harness).await;
}

#[tokio::test]
async fn invalid_bias_inputs_are_400() {
    let harness = plain_harness().await;

    let (status, body) = harness
        .post_json(
            "/simulation/emotion-bias",
            json!({"modality": "gait", "emotion": "Sad"}),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("Invalid modality"));

    let (status, body) = harness
        .post_json(
            "/simulation/emotion-bias",
            json!({"modality": "speech", "emotion": "Ecstatic"}),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("Invalid emotion"));

    let client = &harness.client;
    let response = client
        .get(format!("{}/simulation/emotion-bias/gait", harness.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    shutdown(harness).await;
}

#[tokio::test]
async fn generation_interval_bounds_are_enforced() {
    let harness = plain_harness().await;

    let state = harness.get_json("/simulation/generation-interval").await;
    assert_eq!(state["interval"], 30);
    assert_eq!(state["min_interval"], 5);
    assert_eq!(state["max_interval"], 300);

    let (status, body) = harness
        .post_json("/simulation/generation-interval", json!({"interval": 5}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["interval"], 5);

    let (status, body) = harness
        .post_json("/simulation/generation-interval", json!({"interval": 4}))
        .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("between 5 and 300"));

    // The rejected write left the previous value in place.
    let state = harness.get_json("/simulation/generation-interval").await;
    assert_eq!(state["interval"], 5);

    shutdown(harness).await;
}

#[tokio::test]
async fn aggregation_interval_bounds_and_visibility() {
    let harness = plain_harness().await;

    let state = harness.get_json("/ser/api/aggregation-interval").await;
    assert_eq!(state["interval_seconds"], 300);

    let (status, body) = harness
        .post_json(
            "/ser/api/aggregation-interval",
            json!({"interval_seconds": 120}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["interval_seconds"], 120);

    for bad in [59u64, 3601] {
        let (status, _) = harness
            .post_json(
                "/ser/api/aggregation-interval",
                json!({"interval_seconds": bad}),
            )
            .await;
        assert_eq!(status, 400, "interval {bad} must be rejected");
    }

    // The live registry the aggregator reads observed the change.
    assert_eq!(harness.service.control().aggregation_interval_secs(), 120);

    shutdown(harness).await;
}

#[tokio::test]
async fn modality_toggles_round_trip() {
    let harness = plain_harness().await;

    let state = harness.get_json("/simulation/modality-toggle").await;
    assert_eq!(state, json!({"speech": true, "face": true, "vitals": true}));

    let (status, body) = harness
        .post_json(
            "/simulation/modality-toggle",
            json!({"modality": "face", "enabled": false}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["face"], false);
    assert_eq!(body["speech"], true);

    let (status, _) = harness
        .post_json(
            "/simulation/modality-toggle",
            json!({"modality": "gait", "enabled": false}),
        )
        .await;
    assert_eq!(status, 400);

    shutdown(harness).await;
}

#[tokio::test]
async fn synthetic_user_id_round_trips_and_validates() {
    let harness = plain_harness().await;

    let state = harness.get_json("/simulation/user-id").await;
    let seeded = state["user_id"].as_str().unwrap().to_owned();
    assert!(uuid::Uuid::parse_str(&seeded).is_ok());

    let replacement = "22222222-2222-2222-2222-222222222222";
    let (status, body) = harness
        .post_json("/simulation/user-id", json!({"user_id": replacement}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["user_id"], replacement);

    let (status, body) = harness
        .post_json("/simulation/user-id", json!({"user_id": "nope"}))
        .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("Invalid UUID"));

    let state = harness.get_json("/simulation/user-id").await;
    assert_eq!(state["user_id"], replacement);

    shutdown(harness).await;
}

#[tokio::test]
async fn inject_signals_writes_to_the_modality_table() {
    let store = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/voice_emotion"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&store)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/face_emotion"))
        .and(body_partial_json(json!({
            "predicted_emotion": "Fear",
            "is_synthetic": true,
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([{"id": 1}])))
        .expect(2)
        .mount(&store)
        .await;

    let harness = start_service(
        ScriptedAnalyzer::open(happy_analysis()),
        HarnessOptions {
            store_uri: Some(store.uri()),
            ..HarnessOptions::default()
        },
    )
    .await;

    let signals = json!({
        "modality": "face",
        "signals": [
            {"user_id": common::TEST_USER, "timestamp": "2025-02-20T10:00:00+08:00",
             "emotion_label": "Fear", "confidence": 0.82},
            {"user_id": common::TEST_USER, "timestamp": "2025-02-20T10:00:05+08:00",
             "emotion_label": "Fear", "confidence": 0.77},
        ],
    });
    let (status, body) = harness.post_json("/simulation/inject-signals", signals).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "success");
    assert_eq!(body["signals_injected"], 2);

    shutdown(harness).await;
}

#[tokio::test]
async fn inject_signals_validates_inputs() {
    let harness = plain_harness().await;

    // No store configured.
    let (status, _) = harness
        .post_json(
            "/simulation/inject-signals",
            json!({"modality": "face", "signals": []}),
        )
        .await;
    assert_eq!(status, 503);

    shutdown(harness).await;
}

#[tokio::test]
async fn inject_signals_rejects_bad_modality_and_emotion() {
    let store = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/voice_emotion"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&store)
        .await;

    let harness = start_service(
        ScriptedAnalyzer::open(happy_analysis()),
        HarnessOptions {
            store_uri: Some(store.uri()),
            ..HarnessOptions::default()
        },
    )
    .await;

    let (status, _) = harness
        .post_json(
            "/simulation/inject-signals",
            json!({"modality": "gait", "signals": []}),
        )
        .await;
    assert_eq!(status, 400);

    let (status, body) = harness
        .post_json(
            "/simulation/inject-signals",
            json!({"modality": "face", "signals": [
                {"user_id": common::TEST_USER, "timestamp": "2025-02-20T10:00:00+08:00",
                 "emotion_label": "Neutral", "confidence": 0.5},
            ]}),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("Invalid emotion"));

    shutdown(harness).await;
}
