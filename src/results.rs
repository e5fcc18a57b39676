//! Per-chunk and aggregated result types, plus the in-memory result log.
//!
//! The log is two bounded rings. It exists for dashboards and status pages
//! only; it does not survive a restart and nothing downstream reads it.

use crate::emotion::EmotionLabel;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

/// Capacity of the per-chunk ring.
const CHUNK_RING_CAP: usize = 500;

/// Capacity of the aggregated ring.
const AGGREGATED_RING_CAP: usize = 1000;

/// Inference result for one audio chunk.
///
/// Only built for chunks whose emotion mapped onto the four-class contract;
/// dropped chunks never become a `ChunkResult`. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkResult {
    /// When the chunk was captured (UTC+8).
    pub captured_at: DateTime<FixedOffset>,
    pub emotion: EmotionLabel,
    pub emotion_confidence: f32,
    pub transcript: Option<String>,
    pub language: Option<String>,
    pub sentiment: Option<String>,
    pub sentiment_confidence: Option<f32>,
}

/// One entry in the per-chunk ring: the result plus worker-side outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkRecord {
    pub user_id: Uuid,
    /// Session the result was appended to.
    pub session_id: String,
    /// When the worker finished processing (UTC+8).
    pub processed_at: DateTime<FixedOffset>,
    /// Whether the store write succeeded.
    pub stored: bool,
    #[serde(flatten)]
    pub result: ChunkResult,
}

/// One aggregated record per (user, session, window).
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedResult {
    /// When the aggregate was emitted (equals `window_end`).
    pub timestamp: DateTime<FixedOffset>,
    pub user_id: Uuid,
    pub session_id: String,
    pub window_start: DateTime<FixedOffset>,
    pub window_end: DateTime<FixedOffset>,
    pub chunk_count: usize,
    pub emotion: EmotionLabel,
    pub emotion_confidence: f32,
    pub sentiment: Option<String>,
    pub sentiment_confidence: Option<f32>,
}

/// Thread-safe bounded rings of recent results.
#[derive(Default)]
pub struct ResultLog {
    chunks: Mutex<VecDeque<ChunkRecord>>,
    aggregated: Mutex<VecDeque<AggregatedResult>>,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk record, evicting the oldest entry at capacity.
    pub fn push_chunk(&self, record: ChunkRecord) {
        let mut ring = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() == CHUNK_RING_CAP {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Append an aggregated record, evicting the oldest entry at capacity.
    pub fn push_aggregated(&self, record: AggregatedResult) {
        let mut ring = self.aggregated.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() == AGGREGATED_RING_CAP {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Recent chunk records, newest first, optionally filtered by user.
    pub fn recent_chunks(&self, limit: usize, user_id: Option<Uuid>) -> Vec<ChunkRecord> {
        let ring = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter()
            .rev()
            .filter(|r| user_id.is_none_or(|u| r.user_id == u))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Recent aggregated records, newest first, optionally filtered by user.
    pub fn recent_aggregated(&self, limit: usize, user_id: Option<Uuid>) -> Vec<AggregatedResult> {
        let ring = self.aggregated.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter()
            .rev()
            .filter(|r| user_id.is_none_or(|u| r.user_id == u))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn aggregated_count(&self) -> usize {
        self.aggregated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::clock::service_timezone;
    use chrono::TimeZone;

    fn record(user_id: Uuid, secs: i64) -> ChunkRecord {
        let t = service_timezone().timestamp_opt(1_740_000_000 + secs, 0).unwrap();
        ChunkRecord {
            user_id,
            session_id: format!("{user_id}_s"),
            processed_at: t,
            stored: true,
            result: ChunkResult {
                captured_at: t,
                emotion: EmotionLabel::Happy,
                emotion_confidence: 0.5,
                transcript: None,
                language: None,
                sentiment: None,
                sentiment_confidence: None,
            },
        }
    }

    #[test]
    fn chunk_ring_is_bounded_and_newest_first() {
        let log = ResultLog::new();
        let user = Uuid::new_v4();
        for i in 0..(CHUNK_RING_CAP + 10) {
            log.push_chunk(record(user, i as i64));
        }

        assert_eq!(log.chunk_count(), CHUNK_RING_CAP);
        let recent = log.recent_chunks(3, None);
        assert_eq!(recent.len(), 3);
        assert!(recent[0].processed_at > recent[1].processed_at);
        assert!(recent[1].processed_at > recent[2].processed_at);
    }

    #[test]
    fn chunk_reads_filter_by_user() {
        let log = ResultLog::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        log.push_chunk(record(alice, 1));
        log.push_chunk(record(bob, 2));
        log.push_chunk(record(alice, 3));

        let for_alice = log.recent_chunks(10, Some(alice));
        assert_eq!(for_alice.len(), 2);
        assert!(for_alice.iter().all(|r| r.user_id == alice));

        assert_eq!(log.recent_chunks(10, None).len(), 3);
    }

    #[test]
    fn aggregated_ring_is_bounded() {
        let log = ResultLog::new();
        let user = Uuid::new_v4();
        let t = service_timezone().timestamp_opt(1_740_000_000, 0).unwrap();
        for i in 0..(AGGREGATED_RING_CAP + 5) {
            log.push_aggregated(AggregatedResult {
                timestamp: t,
                user_id: user,
                session_id: format!("s{i}"),
                window_start: t,
                window_end: t,
                chunk_count: 1,
                emotion: EmotionLabel::Sad,
                emotion_confidence: 0.4,
                sentiment: None,
                sentiment_confidence: None,
            });
        }

        assert_eq!(log.aggregated_count(), AGGREGATED_RING_CAP);
        // Oldest entries were evicted: the first surviving session id is s5.
        let all = log.recent_aggregated(AGGREGATED_RING_CAP, None);
        assert_eq!(all.last().unwrap().session_id, "s5");
    }

    #[test]
    fn chunk_record_serializes_flat() {
        let rec = record(Uuid::nil(), 0);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["emotion"], "Happy");
        assert_eq!(json["stored"], true);
        assert!(json.get("result").is_none());
    }
}
