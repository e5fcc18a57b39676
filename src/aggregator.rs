//! Periodic aggregation of chunk results into per-session window snapshots.
//!
//! Every tick collapses the last window of chunk results per (user, session)
//! into one [`AggregatedResult`]: the emotion with the highest mean
//! confidence wins, sentiment goes to the most frequent label. Emitted
//! records land in the aggregated ring; sessions that fell two windows
//! behind are cleaned up.

use crate::clock::Clock;
use crate::control::ControlPlane;
use crate::emotion::EmotionLabel;
use crate::results::{AggregatedResult, ChunkResult, ResultLog};
use crate::session::SessionTracker;
use chrono::{DateTime, Duration, FixedOffset};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Periodic aggregation task.
pub struct Aggregator {
    tracker: Arc<SessionTracker>,
    results: Arc<ResultLog>,
    control: Arc<ControlPlane>,
    clock: Clock,
}

impl Aggregator {
    pub fn new(
        tracker: Arc<SessionTracker>,
        results: Arc<ResultLog>,
        control: Arc<ControlPlane>,
        clock: Clock,
    ) -> Self {
        Self {
            tracker,
            results,
            control,
            clock,
        }
    }

    /// Spawn the periodic loop: sleep for the current interval, tick,
    /// repeat. Interval changes take effect on the next sleep, never
    /// mid-sleep. A slow tick never skips the next one; back-to-back ticks
    /// are allowed and logged.
    pub fn run(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "aggregator started (interval: {}s)",
                self.control.aggregation_interval_secs()
            );
            loop {
                let interval =
                    std::time::Duration::from_secs(self.control.aggregation_interval_secs());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let started = std::time::Instant::now();
                self.tick();
                let elapsed = started.elapsed();
                if elapsed > interval {
                    warn!(
                        "aggregation tick took {:.1}s, longer than the {}s interval",
                        elapsed.as_secs_f64(),
                        interval.as_secs()
                    );
                }
            }
            info!("aggregator stopped");
        })
    }

    /// Run one aggregation pass. The window ends at the tick's `now()` and
    /// spans the interval as currently configured.
    pub fn tick(&self) {
        let window_end = self.clock.now();
        let interval = Duration::seconds(self.control.aggregation_interval_secs() as i64);
        let window_start = window_end - interval;

        let active = self.tracker.active_sessions_in_window(window_start, window_end);
        if active.is_empty() {
            debug!("no active sessions in aggregation window");
            return;
        }

        let mut emitted = 0usize;
        for (user_id, sessions) in &active {
            for (session_id, chunks) in sessions {
                if let Some(aggregate) =
                    aggregate_session(*user_id, session_id, chunks, window_start, window_end)
                {
                    self.results.push_aggregated(aggregate);
                    emitted += 1;
                }
            }
        }
        info!(
            "aggregation emitted {emitted} records for window [{window_start}, {window_end}]"
        );

        let cutoff = window_end - interval * 2;
        for user_id in active.keys() {
            self.tracker.cleanup_older_than(*user_id, cutoff);
        }
    }
}

/// Collapse one session's in-window chunks into a single record.
///
/// Emotion: mean confidence per label, argmax over the means. Ties break
/// deterministically in the fixed label order Angry, Sad, Happy, Fear (the
/// first label reaching the maximum wins). Sentiment: most frequent label
/// across chunks that carry one, with ties broken alphabetically; its
/// confidence is the mean over that label's occurrences.
pub fn aggregate_session(
    user_id: Uuid,
    session_id: &str,
    chunks: &[ChunkResult],
    window_start: DateTime<FixedOffset>,
    window_end: DateTime<FixedOffset>,
) -> Option<AggregatedResult> {
    if chunks.is_empty() {
        return None;
    }

    let mut sums = [0.0f32; EmotionLabel::ALL.len()];
    let mut counts = [0usize; EmotionLabel::ALL.len()];
    let mut sentiments: BTreeMap<&str, Vec<f32>> = BTreeMap::new();

    for chunk in chunks {
        let idx = EmotionLabel::ALL
            .iter()
            .position(|l| *l == chunk.emotion)
            .unwrap_or(0);
        sums[idx] += chunk.emotion_confidence;
        counts[idx] += 1;

        if let (Some(sentiment), Some(confidence)) =
            (chunk.sentiment.as_deref(), chunk.sentiment_confidence)
        {
            sentiments.entry(sentiment).or_default().push(confidence);
        }
    }

    let mut best_label = None;
    let mut best_mean = f32::MIN;
    for (idx, label) in EmotionLabel::ALL.iter().enumerate() {
        if counts[idx] == 0 {
            continue;
        }
        let mean = sums[idx] / counts[idx] as f32;
        if mean > best_mean {
            best_mean = mean;
            best_label = Some(*label);
        }
    }
    let emotion = best_label?;

    let (sentiment, sentiment_confidence) = sentiments
        .iter()
        .max_by(|a, b| a.1.len().cmp(&b.1.len()))
        .map(|(label, confidences)| {
            let mean = confidences.iter().sum::<f32>() / confidences.len() as f32;
            ((*label).to_owned(), mean)
        })
        .map(|(label, mean)| (Some(label), Some(mean)))
        .unwrap_or((None, None));

    Some(AggregatedResult {
        timestamp: window_end,
        user_id,
        session_id: session_id.to_owned(),
        window_start,
        window_end,
        chunk_count: chunks.len(),
        emotion,
        emotion_confidence: best_mean,
        sentiment,
        sentiment_confidence,
    })
}
