//! Telemetry collection primitives for pipeline stages and weight patching.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

#[derive(Debug, Default)]
struct TelemetryState {
    stage_counts: HashMap<&'static str, u64>,
    completed_items: u64,
    patches_applied: u64,
    patches_skipped: u64,
}

/// Snapshot of telemetry suitable for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub stage_counts: Vec<(String, u64)>,
    pub completed_items: u64,
    pub patches_applied: u64,
    pub patches_skipped: u64,
}

impl TelemetrySnapshot {
    /// Count recorded for a single stage, zero when never entered.
    pub fn stage(&self, stage: &str) -> u64 {
        self.stage_counts
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }
}

/// Shared sink capturing per-stage events.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySink {
    state: Arc<Mutex<TelemetryState>>,
}

impl TelemetrySink {
    /// Records a stage observation.
    pub fn record_stage(&self, stage: &'static str) {
        let mut state = self.state.lock().expect("telemetry mutex poisoned");
        *state.stage_counts.entry(stage).or_insert(0) += 1;
    }

    /// Records a batch item leaving the final stage.
    pub fn record_completed(&self) {
        let mut state = self.state.lock().expect("telemetry mutex poisoned");
        state.completed_items += 1;
    }

    /// Records the outcome of a single weight patch.
    pub fn record_patch(&self, applied: bool) {
        let mut state = self.state.lock().expect("telemetry mutex poisoned");
        if applied {
            state.patches_applied += 1;
        } else {
            state.patches_skipped += 1;
        }
    }

    /// Exposes a snapshot for diagnostics and testing.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let state = self.state.lock().expect("telemetry mutex poisoned");
        let mut stage_counts: Vec<(String, u64)> = state
            .stage_counts
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        stage_counts.sort();
        TelemetrySnapshot {
            stage_counts,
            completed_items: state.completed_items,
            patches_applied: state.patches_applied,
            patches_skipped: state.patches_skipped,
        }
    }
}
