//! Synthetic signal generator (demo mode).
//!
//! A single periodic task, started unconditionally at boot. While demo mode
//! is on it fabricates one [`ModelSignal`] per enabled modality each tick
//! and writes it straight into the per-modality store tables with the
//! synthetic flag set. It never touches the queue, the session tracker, or
//! the ML path; real and synthetic rows coexist in the store and differ
//! only by that flag.

use crate::clock::Clock;
use crate::control::ControlPlane;
use crate::emotion::{EmotionLabel, ModelSignal, Modality};
use crate::pipeline::AudioMetadata;
use crate::store::{StoreClient, StoreResult, VoiceEmotionRecord};
use chrono::{DateTime, FixedOffset};
use rand::Rng;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Probability that a biased draw yields the bias emotion.
const BIAS_PROBABILITY: f64 = 0.75;

/// Confidence range for synthetic signals.
const CONFIDENCE_RANGE: std::ops::Range<f32> = 0.5..0.95;

/// Draw one synthetic signal for a modality.
///
/// With a bias set, the bias emotion is picked with probability 0.75 and
/// each of the other three with 0.25/3; without one, the four labels are
/// uniform. Confidence is uniform in `[0.5, 0.95]`, rounded to two
/// decimals.
pub fn draw_signal<R: Rng>(
    rng: &mut R,
    modality: Modality,
    bias: Option<EmotionLabel>,
    user_id: Uuid,
    timestamp: DateTime<FixedOffset>,
) -> ModelSignal {
    let emotion_label = match bias {
        Some(bias) if rng.gen_bool(BIAS_PROBABILITY) => bias,
        Some(bias) => {
            let others: Vec<EmotionLabel> = EmotionLabel::ALL
                .into_iter()
                .filter(|l| *l != bias)
                .collect();
            others[rng.gen_range(0..others.len())]
        }
        None => EmotionLabel::ALL[rng.gen_range(0..EmotionLabel::ALL.len())],
    };

    let raw = rng.gen_range(CONFIDENCE_RANGE);
    let confidence = (raw * 100.0).round() / 100.0;

    ModelSignal {
        user_id,
        timestamp,
        modality,
        emotion_label,
        confidence,
    }
}

/// Periodic synthetic signal task.
pub struct SignalGenerator {
    store: Option<Arc<StoreClient>>,
    control: Arc<ControlPlane>,
    clock: Clock,
}

impl SignalGenerator {
    pub fn new(store: Option<Arc<StoreClient>>, control: Arc<ControlPlane>, clock: Clock) -> Self {
        Self {
            store,
            control,
            clock,
        }
    }

    /// Spawn the generation loop. Interval and demo mode are re-read every
    /// iteration; toggling demo mode takes effect on the next tick.
    pub fn run(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "signal generator started (interval: {}s, demo mode: {})",
                self.control.generation_interval_secs(),
                self.control.demo_mode()
            );
            loop {
                let interval =
                    std::time::Duration::from_secs(self.control.generation_interval_secs());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                self.iteration().await;
            }
            info!("signal generator stopped");
        })
    }

    /// One loop iteration: a no-op while demo mode is off. Returns the
    /// number of signals written.
    pub async fn iteration(&self) -> usize {
        if !self.control.demo_mode() {
            debug!("demo mode off, skipping signal generation");
            return 0;
        }
        self.tick().await
    }

    /// Generate and persist one signal per enabled modality.
    pub async fn tick(&self) -> usize {
        let user_id = self.control.synthetic_user_id();
        let now = self.clock.now();
        let mut written = 0usize;

        for modality in Modality::ALL {
            if !self.control.modality_enabled(modality) {
                continue;
            }
            let bias = self.control.bias(modality);
            let signal = {
                let mut rng = rand::thread_rng();
                draw_signal(&mut rng, modality, bias, user_id, now)
            };

            let Some(store) = &self.store else {
                debug!("no store configured, dropping synthetic {modality} signal");
                continue;
            };
            match write_signal(store, &signal).await {
                Ok(()) => {
                    debug!(
                        "generated synthetic {modality} signal: {} ({:.2})",
                        signal.emotion_label, signal.confidence
                    );
                    written += 1;
                }
                Err(e) => warn!("failed to persist synthetic {modality} signal: {e}"),
            }
        }
        written
    }
}

/// Write one signal into its modality table with the synthetic flag set.
///
/// Shared by the generator and the bulk inject endpoint.
pub async fn write_signal(store: &StoreClient, signal: &ModelSignal) -> StoreResult<()> {
    match signal.modality {
        Modality::Speech => {
            let record = VoiceEmotionRecord {
                emotion: signal.emotion_label,
                emotion_confidence: signal.confidence,
                transcript: None,
                language: None,
                sentiment: None,
                sentiment_confidence: None,
            };
            store
                .insert_voice_emotion(
                    signal.user_id,
                    signal.timestamp,
                    &record,
                    &AudioMetadata {
                        duration_sec: 10.0,
                        ..AudioMetadata::default()
                    },
                    true,
                )
                .await?;
        }
        Modality::Face => {
            store
                .insert_face_emotion_synthetic(
                    signal.user_id,
                    signal.timestamp,
                    signal.emotion_label,
                    signal.confidence,
                )
                .await?;
        }
        Modality::Vitals => {
            store
                .insert_vitals_emotion_synthetic(
                    signal.user_id,
                    signal.timestamp,
                    signal.emotion_label,
                    signal.confidence,
                )
                .await?;
        }
    }
    Ok(())
}
