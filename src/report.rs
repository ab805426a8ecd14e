//! Sinks for structured pass/fail records.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{error, info};

use crate::error::Phase;
use crate::lock;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportEvent {
    RunStarted { run: String },
    PhasePassed { run: String, phase: Phase },
    PhaseFailed { run: String, phase: Phase, cause: String },
    Diagnostic { run: String, message: String },
    RunFinished { run: String, passed: bool },
}

impl ReportEvent {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

pub trait Reporter: Send + Sync {
    fn record(&self, event: ReportEvent);
}

/// Drops everything. Used when no reporter is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopReporter;

impl Reporter for NopReporter {
    fn record(&self, _event: ReportEvent) {}
}

/// Forwards every record to the `tracing` subscriber as JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn record(&self, event: ReportEvent) {
        match &event {
            ReportEvent::PhaseFailed { .. } | ReportEvent::RunFinished { passed: false, .. } => {
                error!(record = %event.to_json(), "conformance report")
            }
            _ => info!(record = %event.to_json(), "conformance report"),
        }
    }
}

/// Keeps every record in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryReporter {
    events: Arc<Mutex<Vec<ReportEvent>>>,
}

impl MemoryReporter {
    pub fn events(&self) -> Vec<ReportEvent> {
        lock(&self.events).clone()
    }

    pub fn failures(&self) -> Vec<ReportEvent> {
        self.events()
            .into_iter()
            .filter(|event| matches!(event, ReportEvent::PhaseFailed { .. }))
            .collect()
    }
}

impl Reporter for MemoryReporter {
    fn record(&self, event: ReportEvent) {
        lock(&self.events).push(event);
    }
}

impl<R: Reporter + ?Sized> Reporter for Arc<R> {
    fn record(&self, event: ReportEvent) {
        (**self).record(event)
    }
}
