//! Service lifecycle: ordered startup and strict-reverse shutdown.
//!
//! Startup: clock → store probe (best-effort) → control plane → session
//! tracker → chunk queue → result log → worker → aggregator → generator →
//! HTTP server. Shutdown walks the same list backwards; every stop step is
//! bounded by a timeout and a step that misses it is logged and skipped,
//! never allowed to block the rest.

use crate::aggregator::Aggregator;
use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::control::ControlPlane;
use crate::error::{IngestError, Result};
use crate::generator::SignalGenerator;
use crate::http::{AppState, router};
use crate::pipeline::SpeechAnalyzer;
use crate::queue::{ChunkQueue, QueueWorker, chunk_queue};
use crate::results::ResultLog;
use crate::session::SessionTracker;
use crate::store::StoreClient;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bound on each shutdown step.
const STOP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Poll period while draining the queue at shutdown.
const DRAIN_POLL: std::time::Duration = std::time::Duration::from_millis(50);

/// A running attune service instance.
pub struct Service {
    addr: SocketAddr,
    queue: Arc<ChunkQueue>,
    tracker: Arc<SessionTracker>,
    results: Arc<ResultLog>,
    control: Arc<ControlPlane>,
    clock: Clock,
    worker_running: Arc<AtomicBool>,
    aggregator_running: Arc<AtomicBool>,
    http_cancel: CancellationToken,
    http_handle: Option<JoinHandle<()>>,
    generator_cancel: CancellationToken,
    generator_handle: Option<JoinHandle<()>>,
    aggregator_cancel: CancellationToken,
    aggregator_handle: Option<JoinHandle<()>>,
    worker_cancel: CancellationToken,
    worker_handle: Option<JoinHandle<()>>,
    shut_down: bool,
}

impl Service {
    /// Start every component in order and bind the HTTP server.
    ///
    /// # Errors
    ///
    /// Fails on invalid config (interval seeds, store key) or when the HTTP
    /// listener cannot bind. A failed store probe is logged, not fatal.
    pub async fn start(
        config: ServiceConfig,
        analyzer: Arc<dyn SpeechAnalyzer>,
        clock: Clock,
    ) -> Result<Self> {
        let store = StoreClient::from_config(&config.store)?.map(Arc::new);
        if let Some(store) = &store {
            match store.probe().await {
                Ok(()) => info!("store connectivity probe succeeded"),
                Err(e) => warn!("store connectivity probe failed (continuing): {e}"),
            }
        } else {
            warn!("no store configured; results will not be persisted");
        }

        let control = Arc::new(ControlPlane::new(&config)?);
        let tracker = Arc::new(SessionTracker::new(chrono::Duration::seconds(
            config.session.gap_threshold_secs,
        )));
        let (queue, queue_rx) = chunk_queue(config.queue.capacity);
        let results = Arc::new(ResultLog::new());

        let worker_running = Arc::new(AtomicBool::new(true));
        let aggregator_running = Arc::new(AtomicBool::new(true));

        let worker_cancel = CancellationToken::new();
        let worker_handle = QueueWorker::new(
            &queue,
            queue_rx,
            analyzer,
            store.clone(),
            Arc::clone(&tracker),
            Arc::clone(&results),
            clock.clone(),
        )
        .run(worker_cancel.clone());

        let aggregator_cancel = CancellationToken::new();
        let aggregator_handle = Aggregator::new(
            Arc::clone(&tracker),
            Arc::clone(&results),
            Arc::clone(&control),
            clock.clone(),
        )
        .run(aggregator_cancel.clone());

        let generator_cancel = CancellationToken::new();
        let generator_handle =
            SignalGenerator::new(store.clone(), Arc::clone(&control), clock.clone())
                .run(generator_cancel.clone());

        let state = AppState {
            queue: Arc::clone(&queue),
            tracker: Arc::clone(&tracker),
            results: Arc::clone(&results),
            control: Arc::clone(&control),
            store,
            clock: clock.clone(),
            tmp_dir: config.queue.tmp_dir.clone(),
            worker_running: Arc::clone(&worker_running),
            aggregator_running: Arc::clone(&aggregator_running),
        };

        let bind_addr = format!("{}:{}", config.http.host, config.http.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| IngestError::Http(format!("cannot bind {bind_addr}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| IngestError::Http(format!("cannot read local addr: {e}")))?;

        let http_cancel = CancellationToken::new();
        let shutdown_token = http_cancel.clone();
        let app = router(state);
        let http_handle = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown_token.cancelled().await });
            if let Err(e) = server.await {
                tracing::error!("http server error: {e}");
            }
        });

        info!("attune listening on http://{addr}");

        Ok(Self {
            addr,
            queue,
            tracker,
            results,
            control,
            clock,
            worker_running,
            aggregator_running,
            http_cancel,
            http_handle: Some(http_handle),
            generator_cancel,
            generator_handle: Some(generator_handle),
            aggregator_cancel,
            aggregator_handle: Some(aggregator_handle),
            worker_cancel,
            worker_handle: Some(worker_handle),
            shut_down: false,
        })
    }

    /// Address the HTTP server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn queue(&self) -> Arc<ChunkQueue> {
        Arc::clone(&self.queue)
    }

    pub fn tracker(&self) -> Arc<SessionTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn results(&self) -> Arc<ResultLog> {
        Arc::clone(&self.results)
    }

    pub fn control(&self) -> Arc<ControlPlane> {
        Arc::clone(&self.control)
    }

    pub fn clock(&self) -> Clock {
        self.clock.clone()
    }

    /// Stop everything in reverse startup order. Idempotent: a second call
    /// is a no-op that returns immediately.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        // HTTP first so no new work arrives.
        self.http_cancel.cancel();
        join_bounded("http server", self.http_handle.take()).await;

        self.generator_cancel.cancel();
        join_bounded("signal generator", self.generator_handle.take()).await;

        self.aggregator_cancel.cancel();
        join_bounded("aggregator", self.aggregator_handle.take()).await;
        self.aggregator_running.store(false, Ordering::Relaxed);

        // Give the worker a bounded chance to drain before abandoning the
        // rest; abandoned jobs release their temp files in the sweep.
        let drain_deadline = std::time::Instant::now() + STOP_TIMEOUT;
        while self.queue.size() > 0 && std::time::Instant::now() < drain_deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        if self.queue.size() > 0 {
            warn!("{} jobs still queued at shutdown, abandoning", self.queue.size());
        }
        self.worker_cancel.cancel();
        join_bounded("chunk worker", self.worker_handle.take()).await;
        self.worker_running.store(false, Ordering::Relaxed);

        info!("attune shut down");
    }
}

async fn join_bounded(name: &str, handle: Option<JoinHandle<()>>) {
    let Some(handle) = handle else {
        return;
    };
    match tokio::time::timeout(STOP_TIMEOUT, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{name} task ended with error: {e}"),
        Err(_) => warn!("{name} did not finish cleanly within {STOP_TIMEOUT:?}"),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::pipeline::SpeechAnalysis;
    use async_trait::async_trait;
    use std::path::Path;

    struct HappyAnalyzer;

    #[async_trait]
    impl SpeechAnalyzer for HappyAnalyzer {
        async fn analyze(&self, _audio_path: &Path) -> Result<SpeechAnalysis> {
            Ok(SpeechAnalysis {
                emotion: Some("happy".to_owned()),
                emotion_confidence: 0.9,
                ..SpeechAnalysis::default()
            })
        }
    }

    fn test_config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.http.host = "127.0.0.1".to_owned();
        config.http.port = 0;
        config
    }

    #[tokio::test]
    async fn service_starts_serves_health_and_stops() {
        let mut service = Service::start(test_config(), Arc::new(HappyAnalyzer), Clock::system())
            .await
            .unwrap();

        let url = format!("http://{}/health", service.addr());
        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["worker_running"], true);
        assert_eq!(body["aggregator_running"], true);
        assert_eq!(body["queue_size"], 0);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_bounded() {
        let mut service = Service::start(test_config(), Arc::new(HappyAnalyzer), Clock::system())
            .await
            .unwrap();

        let first = std::time::Instant::now();
        service.shutdown().await;
        assert!(first.elapsed() < std::time::Duration::from_secs(15));

        let second = std::time::Instant::now();
        service.shutdown().await;
        assert!(
            second.elapsed() < std::time::Duration::from_secs(1),
            "second shutdown must be a fast no-op"
        );
    }

    #[tokio::test]
    async fn bind_conflict_is_a_startup_error() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut config = test_config();
        config.http.port = port;
        let result = Service::start(config, Arc::new(HappyAnalyzer), Clock::system()).await;
        assert!(matches!(result, Err(IngestError::Http(_))));
    }

    #[tokio::test]
    async fn requests_after_shutdown_are_refused() {
        let mut service = Service::start(test_config(), Arc::new(HappyAnalyzer), Clock::system())
            .await
            .unwrap();
        let url = format!("http://{}/health", service.addr());
        service.shutdown().await;

        let result = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(2))
            .build()
            .unwrap()
            .get(&url)
            .send()
            .await;
        assert!(result.is_err(), "listener must be closed after shutdown");
    }
}
