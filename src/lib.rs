//! attune: speech emotion ingest, sessionization, and windowed aggregation.
//!
//! The service accepts short audio chunks over HTTP, runs them through an
//! external inference pipeline, and turns the per-chunk results into
//! per-user sessions and periodic per-session aggregates:
//!
//! Upload → chunk queue → worker → analyzer (external) → store + result
//! ring + session tracker → aggregator → aggregated ring
//!
//! # Architecture
//!
//! Independent components wired together by [`lifecycle::Service`]:
//! - **HTTP edge** (`http`): ingest, status/dashboard, control endpoints
//! - **Chunk queue & worker** (`queue`): bounded FIFO, single consumer
//! - **Session tracker** (`session`): gap-based per-user grouping
//! - **Aggregator** (`aggregator`): periodic window collapse
//! - **Control plane** (`control`): runtime-mutable operator settings
//! - **Synthetic generator** (`generator`): demo-mode signal fabrication
//! - **Store client** (`store`): thin typed row-store wrapper

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod control;
pub mod emotion;
pub mod error;
pub mod generator;
pub mod http;
pub mod lifecycle;
pub mod pipeline;
pub mod queue;
pub mod results;
pub mod session;
pub mod store;

pub use clock::Clock;
pub use config::ServiceConfig;
pub use error::{IngestError, Result};
pub use lifecycle::Service;
pub use pipeline::{RemoteAnalyzer, SpeechAnalysis, SpeechAnalyzer};
