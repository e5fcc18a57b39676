//! Configuration types for the ingest service.
//!
//! Every section has serde defaults so a partial (or absent) config file
//! yields a runnable service. A handful of deployment-critical values can
//! also be supplied through environment variables, which win over the file.

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Fallback synthetic-generator user when neither config nor `DEV_USER_ID`
/// provide one.
const DEFAULT_SYNTHETIC_USER: &str = "96975f52-5b05-4eb1-bfa5-530485112518";

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP edge settings.
    pub http: HttpConfig,
    /// Row-store connection settings.
    pub store: StoreConfig,
    /// Chunk queue settings.
    pub queue: QueueConfig,
    /// Session tracking settings.
    pub session: SessionConfig,
    /// Aggregation defaults (runtime-mutable via the control plane).
    pub aggregation: AggregationConfig,
    /// Demo-mode / synthetic generation defaults.
    pub simulation: SimulationConfig,
    /// External inference service settings.
    pub analyzer: AnalyzerConfig,
}

/// HTTP edge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind host.
    pub host: String,
    /// Bind port (0 = auto-assign, used by tests).
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8008,
        }
    }
}

/// Row-store connection configuration.
///
/// When `url` is unset the service still runs: store writes are skipped with
/// a warning and dashboard store supplements are empty. This keeps local
/// development possible without a live store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the row store REST endpoint.
    pub url: Option<String>,
    /// Service key sent as `apikey` / bearer token.
    pub service_key: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: Option<u64>,
}

/// Chunk queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of pending chunk jobs.
    pub capacity: usize,
    /// Directory for upload temp files (system temp dir when unset).
    pub tmp_dir: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            tmp_dir: None,
        }
    }
}

/// Session tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inter-arrival gap (seconds) above which a new session starts.
    pub gap_threshold_secs: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gap_threshold_secs: 60,
        }
    }
}

/// Aggregation defaults. The live interval is owned by the control plane;
/// this only seeds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Initial aggregation interval in seconds.
    pub interval_secs: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

/// Synthetic generation defaults. The live values are owned by the control
/// plane; these only seed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Initial generation interval in seconds.
    pub interval_secs: u64,
    /// Initial synthetic user id.
    pub user_id: Option<Uuid>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            user_id: None,
        }
    }
}

/// External inference service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Base URL of the inference HTTP service.
    pub url: Option<String>,
    /// Per-chunk analysis timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 120,
        }
    }
}

impl ServiceConfig {
    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| IngestError::Config(format!("cannot parse config: {e}")))
    }

    /// Load a config file, or defaults when the file does not exist.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(IngestError::Config(format!(
                "cannot read config {}: {e}",
                path.display()
            ))),
        }
    }

    /// Load config from `ATTUNE_CONFIG` (or `./attune.toml`), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("ATTUNE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("attune.toml"));
        let mut config = Self::load_from_path(&path)?;
        let vars: Vec<(String, String)> = std::env::vars().collect();
        config.apply_env_overrides(&vars)?;
        Ok(config)
    }

    /// Apply environment overrides from the given variable set.
    ///
    /// Recognized: `PORT`, `STORE_URL`, `STORE_SERVICE_KEY`, `DEV_USER_ID`,
    /// `ANALYZER_URL`. A malformed `PORT` or `DEV_USER_ID` is a startup
    /// config error rather than a silent fallback.
    pub fn apply_env_overrides(&mut self, vars: &[(String, String)]) -> Result<()> {
        for (key, value) in vars {
            match key.as_str() {
                "PORT" => {
                    self.http.port = value
                        .parse()
                        .map_err(|_| IngestError::Config(format!("invalid PORT: {value}")))?;
                }
                "STORE_URL" => self.store.url = Some(value.clone()),
                "STORE_SERVICE_KEY" => self.store.service_key = Some(value.clone()),
                "DEV_USER_ID" => {
                    let id = Uuid::parse_str(value).map_err(|_| {
                        IngestError::Config(format!("invalid DEV_USER_ID: {value}"))
                    })?;
                    self.simulation.user_id = Some(id);
                }
                "ANALYZER_URL" => self.analyzer.url = Some(value.clone()),
                _ => {}
            }
        }
        Ok(())
    }

    /// The synthetic-generator user id seeded into the control plane.
    pub fn synthetic_user_id(&self) -> Uuid {
        self.simulation.user_id.unwrap_or_else(|| {
            // The compiled-in default is a valid UUID literal.
            Uuid::parse_str(DEFAULT_SYNTHETIC_USER).expect("default synthetic user id is valid")
        })
    }
}
