//! Control-plane registries: runtime-mutable operator settings.
//!
//! One [`ControlPlane`] per process, explicitly passed into the components
//! that read it. Each setting is guarded by its own lock; writes are atomic
//! per field and there are no observers — the aggregator and generator
//! re-read at each tick, which is the only coupling needed. Cross-field
//! consistency is neither guaranteed nor required.

use crate::config::ServiceConfig;
use crate::emotion::{EmotionLabel, Modality};
use crate::error::{IngestError, Result};
use std::sync::Mutex;
use uuid::Uuid;

/// Aggregation interval bounds (seconds).
pub const AGGREGATION_INTERVAL_BOUNDS: (u64, u64) = (60, 3600);
/// Aggregation interval default (seconds).
pub const AGGREGATION_INTERVAL_DEFAULT: u64 = 300;

/// Generation interval bounds (seconds).
pub const GENERATION_INTERVAL_BOUNDS: (u64, u64) = (5, 300);
/// Generation interval default (seconds).
pub const GENERATION_INTERVAL_DEFAULT: u64 = 30;

/// A bounded interval setting with its own lock.
struct IntervalRegistry {
    value: Mutex<u64>,
    bounds: (u64, u64),
    name: &'static str,
}

impl IntervalRegistry {
    fn new(name: &'static str, seed: u64, bounds: (u64, u64)) -> Result<Self> {
        let registry = Self {
            value: Mutex::new(seed),
            bounds,
            name,
        };
        registry.validate(seed)?;
        Ok(registry)
    }

    fn validate(&self, value: u64) -> Result<()> {
        let (min, max) = self.bounds;
        if value < min || value > max {
            return Err(IngestError::Validation(format!(
                "{} must be between {min} and {max} seconds, got {value}",
                self.name
            )));
        }
        Ok(())
    }

    fn get(&self) -> u64 {
        *self.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, value: u64) -> Result<()> {
        self.validate(value)?;
        let mut guard = self.value.lock().unwrap_or_else(|e| e.into_inner());
        let old = *guard;
        *guard = value;
        tracing::info!("{} changed: {old}s -> {value}s", self.name);
        Ok(())
    }
}

/// Per-modality emotion bias state.
#[derive(Debug, Clone, Copy, Default)]
struct BiasState {
    speech: Option<EmotionLabel>,
    face: Option<EmotionLabel>,
    vitals: Option<EmotionLabel>,
}

/// Per-modality generation toggles (all enabled by default).
#[derive(Debug, Clone, Copy)]
struct ToggleState {
    speech: bool,
    face: bool,
    vitals: bool,
}

impl Default for ToggleState {
    fn default() -> Self {
        Self {
            speech: true,
            face: true,
            vitals: true,
        }
    }
}

/// Process-wide mutable operator settings.
pub struct ControlPlane {
    aggregation_interval: IntervalRegistry,
    generation_interval: IntervalRegistry,
    demo_mode: Mutex<bool>,
    bias: Mutex<BiasState>,
    toggles: Mutex<ToggleState>,
    synthetic_user: Mutex<Uuid>,
}

impl ControlPlane {
    /// Build the control plane with config-seeded defaults.
    ///
    /// # Errors
    ///
    /// Returns a validation error when a seeded interval is out of bounds —
    /// a misconfiguration caught at startup rather than first use.
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            aggregation_interval: IntervalRegistry::new(
                "aggregation interval",
                config.aggregation.interval_secs,
                AGGREGATION_INTERVAL_BOUNDS,
            )?,
            generation_interval: IntervalRegistry::new(
                "generation interval",
                config.simulation.interval_secs,
                GENERATION_INTERVAL_BOUNDS,
            )?,
            demo_mode: Mutex::new(false),
            bias: Mutex::new(BiasState::default()),
            toggles: Mutex::new(ToggleState::default()),
            synthetic_user: Mutex::new(config.synthetic_user_id()),
        })
    }

    // ── Aggregation interval ────────────────────────────────────────────

    pub fn aggregation_interval_secs(&self) -> u64 {
        self.aggregation_interval.get()
    }

    pub fn set_aggregation_interval_secs(&self, value: u64) -> Result<()> {
        self.aggregation_interval.set(value)
    }

    // ── Generation interval ─────────────────────────────────────────────

    pub fn generation_interval_secs(&self) -> u64 {
        self.generation_interval.get()
    }

    pub fn set_generation_interval_secs(&self, value: u64) -> Result<()> {
        self.generation_interval.set(value)
    }

    // ── Demo mode ───────────────────────────────────────────────────────

    pub fn demo_mode(&self) -> bool {
        *self.demo_mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_demo_mode(&self, enabled: bool) {
        let mut guard = self.demo_mode.lock().unwrap_or_else(|e| e.into_inner());
        if *guard != enabled {
            tracing::info!("demo mode changed: {} -> {enabled}", *guard);
        }
        *guard = enabled;
    }

    // ── Emotion bias ────────────────────────────────────────────────────

    pub fn bias(&self, modality: Modality) -> Option<EmotionLabel> {
        let state = self.bias.lock().unwrap_or_else(|e| e.into_inner());
        match modality {
            Modality::Speech => state.speech,
            Modality::Face => state.face,
            Modality::Vitals => state.vitals,
        }
    }

    /// Set (or clear, with `None`) the bias for one modality.
    pub fn set_bias(&self, modality: Modality, emotion: Option<EmotionLabel>) {
        let mut state = self.bias.lock().unwrap_or_else(|e| e.into_inner());
        let slot = match modality {
            Modality::Speech => &mut state.speech,
            Modality::Face => &mut state.face,
            Modality::Vitals => &mut state.vitals,
        };
        tracing::info!("emotion bias for {modality} changed: {:?} -> {emotion:?}", *slot);
        *slot = emotion;
    }

    /// All biases as (modality, bias) pairs in canonical modality order.
    pub fn all_biases(&self) -> [(Modality, Option<EmotionLabel>); 3] {
        let state = self.bias.lock().unwrap_or_else(|e| e.into_inner());
        [
            (Modality::Speech, state.speech),
            (Modality::Face, state.face),
            (Modality::Vitals, state.vitals),
        ]
    }

    // ── Modality toggles ────────────────────────────────────────────────

    pub fn modality_enabled(&self, modality: Modality) -> bool {
        let state = self.toggles.lock().unwrap_or_else(|e| e.into_inner());
        match modality {
            Modality::Speech => state.speech,
            Modality::Face => state.face,
            Modality::Vitals => state.vitals,
        }
    }

    pub fn set_modality_enabled(&self, modality: Modality, enabled: bool) {
        let mut state = self.toggles.lock().unwrap_or_else(|e| e.into_inner());
        let slot = match modality {
            Modality::Speech => &mut state.speech,
            Modality::Face => &mut state.face,
            Modality::Vitals => &mut state.vitals,
        };
        tracing::info!(
            "modality {modality} generation {}",
            if enabled { "enabled" } else { "disabled" }
        );
        *slot = enabled;
    }

    /// All toggles as (modality, enabled) pairs in canonical modality order.
    pub fn all_toggles(&self) -> [(Modality, bool); 3] {
        let state = self.toggles.lock().unwrap_or_else(|e| e.into_inner());
        [
            (Modality::Speech, state.speech),
            (Modality::Face, state.face),
            (Modality::Vitals, state.vitals),
        ]
    }

    // ── Synthetic user id ───────────────────────────────────────────────

    pub fn synthetic_user_id(&self) -> Uuid {
        *self.synthetic_user.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_synthetic_user_id(&self, user_id: Uuid) {
        let mut guard = self.synthetic_user.lock().unwrap_or_else(|e| e.into_inner());
        tracing::info!("synthetic user id changed: {} -> {user_id}", *guard);
        *guard = user_id;
    }
}
