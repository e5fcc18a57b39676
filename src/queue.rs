//! Bounded chunk queue and its single background worker.
//!
//! The HTTP edge enqueues [`ChunkJob`]s; one worker drains them, runs the
//! external analyzer, applies the four-class mapping (dropping neutral-ish
//! chunks), persists kept results, and feeds the result ring and session
//! tracker. Jobs own their audio temp file through [`tempfile::TempPath`],
//! so whichever side drops a job releases the file exactly once.

use crate::clock::Clock;
use crate::emotion::EmotionLabel;
use crate::error::{IngestError, Result};
use crate::pipeline::{SpeechAnalyzer, probe_wav};
use crate::results::{ChunkRecord, ChunkResult, ResultLog};
use crate::session::SessionTracker;
use crate::store::{StoreClient, VoiceEmotionRecord};
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempPath;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a finished item stays visible as "processing" so dashboards can
/// show the just-finished result.
const METADATA_GRACE: std::time::Duration = std::time::Duration::from_millis(500);

/// Accepted-request entries kept for the status page.
const ACCEPTED_LOG_CAP: usize = 200;

/// One pending audio chunk. Owns its temp file: the file is unlinked when
/// the job is dropped, on every path.
pub struct ChunkJob {
    pub user_id: Uuid,
    /// Exclusively-owned audio file path.
    pub audio: TempPath,
    /// When the request was accepted (UTC+8).
    pub captured_at: DateTime<FixedOffset>,
    /// Original upload filename, display only.
    pub filename: Option<String>,
}

/// Metadata of an accepted ingest request (status page).
#[derive(Debug, Clone, Serialize)]
pub struct AcceptedRequest {
    pub user_id: Uuid,
    pub filename: Option<String>,
    pub accepted_at: DateTime<FixedOffset>,
}

/// The item the worker is processing right now (dashboard view).
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingItem {
    pub user_id: Uuid,
    pub started_at: DateTime<FixedOffset>,
    pub filename: Option<String>,
}

/// Worker throughput counters. Dropped chunks count as processed too.
#[derive(Debug, Default)]
pub struct QueueCounters {
    processed: AtomicU64,
    dropped: AtomicU64,
}

impl QueueCounters {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Producer half of the chunk queue plus the shared dashboard state.
pub struct ChunkQueue {
    tx: mpsc::Sender<ChunkJob>,
    accepted: Mutex<VecDeque<AcceptedRequest>>,
    counters: Arc<QueueCounters>,
    processing: Arc<Mutex<Option<ProcessingItem>>>,
}

/// Create the bounded queue. Returns the producer handle and the receiver
/// for the worker.
pub fn chunk_queue(capacity: usize) -> (Arc<ChunkQueue>, mpsc::Receiver<ChunkJob>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let queue = ChunkQueue {
        tx,
        accepted: Mutex::new(VecDeque::new()),
        counters: Arc::new(QueueCounters::default()),
        processing: Arc::new(Mutex::new(None)),
    };
    (Arc::new(queue), rx)
}

impl ChunkQueue {
    /// Non-blocking enqueue. Returns the queue depth after the push.
    ///
    /// On overflow the job is dropped here (releasing its temp file) and the
    /// caller gets a resource-exhausted error to surface as 503.
    pub fn enqueue(&self, job: ChunkJob) -> Result<usize> {
        let accepted = AcceptedRequest {
            user_id: job.user_id,
            filename: job.filename.clone(),
            accepted_at: job.captured_at,
        };
        match self.tx.try_send(job) {
            Ok(()) => {
                let user_id = accepted.user_id;
                let mut ring = self.accepted.lock().unwrap_or_else(|e| e.into_inner());
                if ring.len() == ACCEPTED_LOG_CAP {
                    ring.pop_front();
                }
                ring.push_back(accepted);
                drop(ring);
                // The worker may have taken the job already; report at
                // least the one just accepted.
                let size = self.size().max(1);
                debug!("enqueued chunk for user {user_id} (queue size: {size})");
                Ok(size)
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                drop(job);
                Err(IngestError::ResourceExhausted("chunk queue full".to_owned()))
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                drop(job);
                Err(IngestError::ResourceExhausted(
                    "chunk queue is shut down".to_owned(),
                ))
            }
        }
    }

    /// Current queue depth.
    pub fn size(&self) -> usize {
        self.tx.max_capacity().saturating_sub(self.tx.capacity())
    }

    /// Requests accepted at or after `since`, newest first.
    pub fn accepted_since(&self, since: DateTime<FixedOffset>) -> Vec<AcceptedRequest> {
        let ring = self.accepted.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter()
            .rev()
            .filter(|r| r.accepted_at >= since)
            .cloned()
            .collect()
    }

    /// The item currently being processed, if any.
    pub fn processing_item(&self) -> Option<ProcessingItem> {
        self.processing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn counters(&self) -> Arc<QueueCounters> {
        Arc::clone(&self.counters)
    }

    fn processing_slot(&self) -> Arc<Mutex<Option<ProcessingItem>>> {
        Arc::clone(&self.processing)
    }
}

/// The single queue consumer.
pub struct QueueWorker {
    rx: mpsc::Receiver<ChunkJob>,
    analyzer: Arc<dyn SpeechAnalyzer>,
    store: Option<Arc<StoreClient>>,
    tracker: Arc<SessionTracker>,
    results: Arc<ResultLog>,
    clock: Clock,
    counters: Arc<QueueCounters>,
    processing: Arc<Mutex<Option<ProcessingItem>>>,
    metadata_grace: std::time::Duration,
}

impl QueueWorker {
    pub fn new(
        queue: &ChunkQueue,
        rx: mpsc::Receiver<ChunkJob>,
        analyzer: Arc<dyn SpeechAnalyzer>,
        store: Option<Arc<StoreClient>>,
        tracker: Arc<SessionTracker>,
        results: Arc<ResultLog>,
        clock: Clock,
    ) -> Self {
        Self {
            rx,
            analyzer,
            store,
            tracker,
            results,
            clock,
            counters: queue.counters(),
            processing: queue.processing_slot(),
            metadata_grace: METADATA_GRACE,
        }
    }

    /// Shorten the processing-metadata grace period (tests).
    #[cfg(test)]
    pub fn with_metadata_grace(mut self, grace: std::time::Duration) -> Self {
        self.metadata_grace = grace;
        self
    }

    /// Spawn the worker loop. The loop ends when the cancel token fires or
    /// every producer handle is gone; leftover jobs are then swept so their
    /// temp files are released.
    pub fn run(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("chunk worker started");
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = self.rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                self.process(job).await;
            }

            self.rx.close();
            let mut swept = 0usize;
            while self.rx.try_recv().is_ok() {
                swept += 1;
            }
            if swept > 0 {
                warn!("chunk worker abandoned {swept} queued jobs at shutdown");
            }
            info!("chunk worker stopped");
        })
    }

    async fn process(&self, job: ChunkJob) {
        {
            let mut slot = self.processing.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(ProcessingItem {
                user_id: job.user_id,
                started_at: self.clock.now(),
                filename: job.filename.clone(),
            });
        }

        let audio_meta = probe_wav(&job.audio);

        let analysis = match self.analyzer.analyze(&job.audio).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("pipeline failed for user {}: {e}", job.user_id);
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                self.clear_processing();
                return;
            }
        };

        let mapped = analysis
            .emotion
            .as_deref()
            .and_then(EmotionLabel::from_classifier);
        let Some(emotion) = mapped else {
            // Neutral/other/unknown: no persistence, no session, no ring.
            debug!(
                "dropping chunk for user {} (unmappable emotion {:?})",
                job.user_id, analysis.emotion
            );
            self.counters.processed.fetch_add(1, Ordering::Relaxed);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            drop(job);
            self.finish_with_grace().await;
            return;
        };

        let result = ChunkResult {
            captured_at: job.captured_at,
            emotion,
            emotion_confidence: analysis.emotion_confidence,
            transcript: analysis.transcript.clone(),
            language: analysis.language.clone(),
            sentiment: analysis.sentiment.clone(),
            sentiment_confidence: analysis.sentiment_confidence,
        };

        let stored = match &self.store {
            Some(store) => {
                let record = VoiceEmotionRecord {
                    emotion,
                    emotion_confidence: result.emotion_confidence,
                    transcript: result.transcript.clone(),
                    language: result.language.clone(),
                    sentiment: result.sentiment.clone(),
                    sentiment_confidence: result.sentiment_confidence,
                };
                match store
                    .insert_voice_emotion(job.user_id, job.captured_at, &record, &audio_meta, false)
                    .await
                {
                    Ok(_) => true,
                    Err(e) => {
                        warn!("store write failed for user {}: {e}", job.user_id);
                        false
                    }
                }
            }
            None => false,
        };

        let session_id = self.tracker.add_result(job.user_id, result.clone());
        self.results.push_chunk(ChunkRecord {
            user_id: job.user_id,
            session_id: session_id.clone(),
            processed_at: self.clock.now(),
            stored,
            result,
        });
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        info!(
            "processed chunk for user {} into session {session_id} ({emotion}, stored: {stored})",
            job.user_id
        );

        // Release the temp file before the display grace period.
        drop(job);
        self.finish_with_grace().await;
    }

    async fn finish_with_grace(&self) {
        tokio::time::sleep(self.metadata_grace).await;
        self.clear_processing();
    }

    fn clear_processing(&self) {
        let mut slot = self.processing.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}
