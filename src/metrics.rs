//! Prometheus metrics
//!
//! Statics register with the default registry on first use and are served by
//! the metrics server in the binary.

use crate::domain::Outcome;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};

/// Fanout calls by surface (`ranks`, `storage`, `firmware`, `smd`, `cluster`) and operation
pub static FANOUT_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "engine_control_plane_fanout_calls_total",
        "Fanout calls handled",
        &["surface", "operation"]
    )
    .expect("Failed to register engine_control_plane_fanout_calls_total metric")
});

/// Per-target outcomes; `outcome` is `success` or a failure kind
pub static TARGET_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "engine_control_plane_target_outcomes_total",
        "Per-target fanout outcomes",
        &["surface", "outcome"]
    )
    .expect("Failed to register engine_control_plane_target_outcomes_total metric")
});

pub static FANOUT_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "engine_control_plane_fanout_duration_seconds",
        "Wall time of a fanout call",
        &["surface"]
    )
    .expect("Failed to register engine_control_plane_fanout_duration_seconds metric")
});

pub static RANKS_READY: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "engine_control_plane_ranks_ready",
        "Local ranks currently in state ready"
    )
    .expect("Failed to register engine_control_plane_ranks_ready metric")
});

/// Force registration so every collector is exported before first use
pub fn register() {
    Lazy::force(&FANOUT_CALLS);
    Lazy::force(&TARGET_OUTCOMES);
    Lazy::force(&FANOUT_DURATION);
    Lazy::force(&RANKS_READY);
}

/// Count one outcome under `surface`
pub fn record_outcome<P>(surface: &str, outcome: &Outcome<P>) {
    let label = match outcome.failure_kind() {
        None => "success".to_string(),
        Some(kind) => kind.to_string(),
    };
    TARGET_OUTCOMES.with_label_values(&[surface, &label]).inc();
}
